/*!
Error types for the relsnap core engine.
*/

use crate::classify::{classify, ErrorClass};
use crate::service::ServiceError;
use thiserror::Error;

/// Result type used throughout the relsnap core.
pub type Result<T> = std::result::Result<T, BackupError>;

/// Errors that can occur while creating, reading or restoring a backup.
#[derive(Error, Debug)]
pub enum BackupError {
    /// I/O errors on the backup stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Structural corruption of the backup container
    #[error("Invalid backup format: {0}")]
    InvalidFormat(String),

    /// Trailer digest or count does not match the records read
    #[error("Integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    /// Invalid configuration or input values
    #[error("Validation error: {0}")]
    Validation(String),

    /// A rewriter refused its input
    #[error("Rewrite error: {0}")]
    Rewrite(String),

    /// The operation was canceled by the caller or the service
    #[error("operation canceled: {0}")]
    Canceled(String),

    /// A commit hit existing relationships while the conflict strategy is `fail`
    #[error(
        "duplicate relationships found ({relationships} relationships in {batches} batches); \
         re-run with --conflict-strategy=skip or --conflict-strategy=touch"
    )]
    DuplicateRelationships { batches: usize, relationships: usize },

    /// A service call failed with an error that is not handled by policy
    #[error("{operation} failed: {source}")]
    Service {
        operation: &'static str,
        source: ServiceError,
    },

    /// Logging or metrics setup failed
    #[error("Observability error: {0}")]
    Observability(String),

    /// Upsert replay gave up on a batch
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: usize,
        source: ServiceError,
    },
}

impl BackupError {
    /// Create a new invalid format error
    pub fn invalid_format<S: Into<String>>(msg: S) -> Self {
        Self::InvalidFormat(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new rewrite error
    pub fn rewrite<S: Into<String>>(msg: S) -> Self {
        Self::Rewrite(msg.into())
    }

    /// Create a new cancellation error
    pub fn canceled<S: Into<String>>(msg: S) -> Self {
        Self::Canceled(msg.into())
    }

    /// Create a new observability error
    pub fn observability<S: Into<String>>(msg: S) -> Self {
        Self::Observability(msg.into())
    }

    /// Wrap a service error with the name of the failed call
    pub fn service(operation: &'static str, source: ServiceError) -> Self {
        Self::Service { operation, source }
    }

    /// True when the error stems from cancellation rather than a failure
    pub fn is_canceled(&self) -> bool {
        match self {
            BackupError::Canceled(_) => true,
            BackupError::Service { source, .. } => classify(source) == ErrorClass::Canceled,
            _ => false,
        }
    }
}
