use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel not connected")]
    Disconnected,

    #[error("persistence error: {0}")]
    Persistence(#[from] vesper_core::error::VesperError),

    #[error("session error: {0}")]
    Session(#[from] vesper_session::error::SessionError),
}

impl ChannelError {
    pub fn code(&self) -> &'static str {
        match self {
            ChannelError::Transport(_) => "TRANSPORT_ERROR",
            ChannelError::Disconnected => "DISCONNECTED",
            ChannelError::Persistence(_) => "PERSISTENCE_ERROR",
            ChannelError::Session(_) => "SESSION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
