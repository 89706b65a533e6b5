/*!
Classification of service failures.

Every failed commit is sorted into exactly one [`ErrorClass`]. Structured
status codes are consulted first; older datastores behind the service only
report conflicts and serialization failures as text, so a fixed table of
substrings is consulted after that.
*/

use crate::service::{ServiceError, StatusCode};
use relsnap_retry::RetryableError;
use std::fmt;

/// How the restore orchestrator reacts to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The caller or the service canceled the operation; never retried
    Canceled,
    /// Duplicate-key conflict, handled by the conflict strategy
    Conflict,
    /// Transient failure, replayed when retries are enabled
    Retryable,
    /// Anything else
    Unrecoverable,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Canceled => "canceled",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Retryable => "retryable",
            ErrorClass::Unrecoverable => "unrecoverable",
        };
        f.write_str(name)
    }
}

const CANCELED_TEXT: &str = "context canceled";

/// Unique-constraint messages from SQL datastores
const LEGACY_CONFLICT_SUBSTRINGS: &[&str] = &[
    "duplicate key value violates unique constraint",
    "Duplicate entry",
    "violates unique constraint",
    "UNIQUE constraint failed",
    "AlreadyExists",
];

/// Serialization and contention messages that succeed when replayed
const LEGACY_RETRYABLE_SUBSTRINGS: &[&str] = &[
    "restart transaction",
    "retryable error",
    "TransactionRetryWithProtoRefreshError",
    "could not serialize access due to concurrent update",
    "could not serialize access due to read/write dependencies",
    "Deadlock found when trying to get lock",
    "Lock wait timeout exceeded",
    "connection reset by peer",
];

/// Classify a service error
///
/// # Example
/// ```rust
/// use relsnap_core::{classify, ErrorClass, ServiceError};
///
/// let err = ServiceError::unknown("ERROR: duplicate key value violates unique constraint \"pk\"");
/// assert_eq!(classify(&err), ErrorClass::Conflict);
/// ```
pub fn classify(err: &ServiceError) -> ErrorClass {
    if err.code == StatusCode::Canceled || err.message.contains(CANCELED_TEXT) {
        return ErrorClass::Canceled;
    }

    match err.code {
        StatusCode::AlreadyExists => return ErrorClass::Conflict,
        StatusCode::Unavailable
        | StatusCode::DeadlineExceeded
        | StatusCode::ResourceExhausted
        | StatusCode::Aborted => return ErrorClass::Retryable,
        _ => {}
    }

    if contains_any(&err.message, LEGACY_CONFLICT_SUBSTRINGS) {
        ErrorClass::Conflict
    } else if contains_any(&err.message, LEGACY_RETRYABLE_SUBSTRINGS) {
        ErrorClass::Retryable
    } else {
        ErrorClass::Unrecoverable
    }
}

fn contains_any(message: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| message.contains(needle))
}

impl RetryableError for ServiceError {
    fn is_transient(&self) -> bool {
        classify(self) == ErrorClass::Retryable
    }
}
