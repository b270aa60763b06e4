use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("session error: {0}")]
    Session(#[from] vesper_session::error::SessionError),

    #[error("persistence error: {0}")]
    Persistence(#[from] vesper_core::error::VesperError),
}

impl HeartbeatError {
    /// Short error code string used in structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            HeartbeatError::Session(_) => "SESSION_ERROR",
            HeartbeatError::Persistence(_) => "PERSISTENCE_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, HeartbeatError>;
