use thiserror::Error;

#[derive(Debug, Error)]
pub enum VesperError {
    #[error("configuration missing: {0}")]
    ConfigMissing(String),

    #[error("credential missing: {0}")]
    CredentialMissing(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl VesperError {
    /// Short error code string used in structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            VesperError::ConfigMissing(_) => "CONFIG_MISSING",
            VesperError::CredentialMissing(_) => "CREDENTIAL_MISSING",
            VesperError::Persistence(_) => "PERSISTENCE_ERROR",
            VesperError::Serialization(_) => "SERIALIZATION_ERROR",
            VesperError::Io(_) => "IO_ERROR",
            VesperError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, VesperError>;
