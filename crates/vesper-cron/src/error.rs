use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("invalid cron expression '{expr}': {reason}")]
    Parse { expr: String, reason: String },

    #[error("persistence error: {0}")]
    Persistence(#[from] vesper_core::error::VesperError),
}

impl CronError {
    /// Short error code string used in structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            CronError::NotFound(_) => "CRON_NOT_FOUND",
            CronError::Parse { .. } => "CRON_SCHEDULE_PARSE",
            CronError::Persistence(_) => "PERSISTENCE_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CronError>;
