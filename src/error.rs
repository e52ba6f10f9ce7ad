//! Error types for classfetch.

use uuid::Uuid;

use crate::jobs::model::ErrorKind;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Job Store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Job not found: {id}")]
    NotFound { id: Uuid },

    /// A write was rejected because the caller no longer owns the job.
    /// Recovered locally by aborting the current execution; the job
    /// record itself is untouched.
    #[error("Ownership lost for job {id}: no longer owned by {worker_id}")]
    OwnershipLost { id: Uuid, worker_id: String },
}

impl StoreError {
    /// True when the error means another actor took the job away from us.
    pub fn is_ownership_lost(&self) -> bool {
        matches!(self, Self::OwnershipLost { .. })
    }
}

/// A classified transfer failure from a downloader.
///
/// `kind` carries the transient/permanent classification (see
/// [`ErrorKind::is_retryable`]); `message` is the human-readable detail
/// surfaced on the job record.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct DownloadError {
    pub kind: ErrorKind,
    pub message: String,
}

impl DownloadError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_error_classification() {
        let e = DownloadError::new(ErrorKind::Timeout, "read timed out");
        assert!(e.is_retryable());
        let e = DownloadError::new(ErrorKind::AuthDenied, "403 Forbidden");
        assert!(!e.is_retryable());
    }

    #[test]
    fn ownership_lost_detection() {
        let e = StoreError::OwnershipLost {
            id: Uuid::new_v4(),
            worker_id: "w1".into(),
        };
        assert!(e.is_ownership_lost());
        assert!(!StoreError::Query("boom".into()).is_ownership_lost());
    }
}
