use crate::models::backup_job::BackupJob;
use crate::models::restore_job::RestoreJob;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum BackupError {
    #[error("{0}")]
    Validation(String),

    #[error("Backup tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("Backup tool failed: {0}")]
    ToolExecution(String),

    #[error("Process timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidState(String),

    /// Preflight diagnostics refused the request; no job row was created.
    #[error("{0}")]
    NotReady(String),

    /// The backup ran and ended FAILED; the job row carries the reason.
    #[error("{}", .0.error_message.as_deref().unwrap_or("Backup failed"))]
    BackupFailed(Box<BackupJob>),

    /// The restore ran and ended FAILED; the job row carries the reason.
    #[error("{}", .0.error_message.as_deref().unwrap_or("Restore failed"))]
    RestoreFailed(Box<RestoreJob>),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BackupError {
    /// True when the failure was recorded on a job row rather than lost.
    pub fn is_recorded(&self) -> bool {
        matches!(self, BackupError::BackupFailed(_) | BackupError::RestoreFailed(_))
    }
}

impl From<tokio::task::JoinError> for BackupError {
    fn from(e: tokio::task::JoinError) -> Self {
        BackupError::Internal(anyhow::anyhow!("Blocking task failed: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_mentions_seconds() {
        let err = BackupError::Timeout(Duration::from_secs(5));
        assert_eq!(err.to_string(), "Process timed out after 5 seconds");
    }

    #[test]
    fn test_validation_is_not_recorded() {
        assert!(!BackupError::Validation("name is required".into()).is_recorded());
    }
}
