use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("provider error: {0}")]
    Provider(#[from] vesper_provider::provider::ProviderError),

    #[error("persistence error: {0}")]
    Persistence(#[from] vesper_core::error::VesperError),

    #[error("tool loop exceeded {0} rounds without a final response")]
    MaxRoundsExceeded(usize),
}

impl SessionError {
    /// Short error code string used in structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NotFound(_) => "SESSION_NOT_FOUND",
            SessionError::Provider(_) => "PROVIDER_ERROR",
            SessionError::Persistence(_) => "PERSISTENCE_ERROR",
            SessionError::MaxRoundsExceeded(_) => "MAX_ROUNDS_EXCEEDED",
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
