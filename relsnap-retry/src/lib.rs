//! Retry and backoff logic for relsnap service calls
//!
//! This crate provides the exponential backoff policy shared by the backup
//! and restore orchestrators: a fixed floor, a capped ceiling, no limit on the
//! total elapsed time and a fixed maximum number of attempts per operation.

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::Future;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub use backoff::backoff::Backoff;

/// Retry error types
///
/// Operations report `Transient` or `Permanent` failures for a single
/// attempt; the driver turns them into `MaxRetriesExceeded` or `Permanent`.
#[derive(Error, Debug)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    #[error("Operation '{operation}' exceeded maximum retry attempts ({attempts}): {source}")]
    MaxRetriesExceeded {
        operation: &'static str,
        attempts: usize,
        source: E,
    },
    #[error("Transient error in '{operation}': {source}")]
    Transient { operation: &'static str, source: E },
    #[error("Permanent error in '{operation}': {source}")]
    Permanent { operation: &'static str, source: E },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The error reported by the last attempt
    pub fn into_source(self) -> E {
        match self {
            RetryError::MaxRetriesExceeded { source, .. }
            | RetryError::Transient { source, .. }
            | RetryError::Permanent { source, .. } => source,
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            RetryError::MaxRetriesExceeded { operation, .. }
            | RetryError::Transient { operation, .. }
            | RetryError::Permanent { operation, .. } => operation,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T, E> = std::result::Result<T, RetryError<E>>;

/// Boxed future for a single attempt
pub type BoxFuture<'a, T, E> = Pin<Box<dyn Future<Output = RetryResult<T, E>> + Send + 'a>>;

/// Exponential backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_interval: Duration,
    /// Upper bound for any single delay
    pub max_interval: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Jitter applied to each delay (0.0 disables jitter)
    pub randomization_factor: f64,
    /// Maximum number of attempts, including the first one
    pub max_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
            randomization_factor: 0.5,
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    /// A policy without delays, mostly useful in tests
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            multiplier: 1.0,
            randomization_factor: 0.0,
            max_attempts,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Build a fresh backoff; the total elapsed time is never bounded.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.randomization_factor)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Check the policy for values the driver cannot work with
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.multiplier < 1.0 {
            return Err(format!("multiplier must be >= 1.0, got {}", self.multiplier));
        }
        if !(0.0..=1.0).contains(&self.randomization_factor) {
            return Err(format!(
                "randomization_factor must be within [0, 1], got {}",
                self.randomization_factor
            ));
        }
        if self.initial_interval > self.max_interval {
            return Err("initial_interval must not exceed max_interval".to_string());
        }
        Ok(())
    }
}

/// Execute an operation with the default exponential backoff policy
pub async fn with_backoff<'a, F, T, E>(op_name: &'static str, f: F) -> RetryResult<T, E>
where
    F: FnMut(usize) -> BoxFuture<'a, T, E>,
    E: std::error::Error + 'static,
{
    with_policy(op_name, &RetryPolicy::default(), f).await
}

/// Execute an operation with a custom backoff policy
///
/// The closure receives the 1-based attempt number. Transient failures are
/// retried after the next backoff delay until `max_attempts` is reached;
/// permanent failures stop immediately.
pub async fn with_policy<'a, F, T, E>(
    op_name: &'static str,
    policy: &RetryPolicy,
    mut f: F,
) -> RetryResult<T, E>
where
    F: FnMut(usize) -> BoxFuture<'a, T, E>,
    E: std::error::Error + 'static,
{
    let mut backoff = policy.backoff();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        debug!(operation = op_name, attempt, "attempting operation");

        match f(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(operation = op_name, attempt, "operation succeeded after retries");
                }
                return Ok(result);
            }
            Err(RetryError::Transient { source, .. }) => {
                if attempt >= max_attempts {
                    warn!(
                        operation = op_name,
                        attempt,
                        error = %source,
                        "operation failed, no attempts left"
                    );
                    return Err(RetryError::MaxRetriesExceeded {
                        operation: op_name,
                        attempts: attempt,
                        source,
                    });
                }

                let delay = backoff.next_backoff().unwrap_or(policy.max_interval);
                warn!(
                    operation = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %source,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(RetryError::Permanent { source, .. }) => {
                warn!(
                    operation = op_name,
                    attempt,
                    error = %source,
                    "operation failed permanently"
                );
                return Err(RetryError::Permanent {
                    operation: op_name,
                    source,
                });
            }
            Err(err @ RetryError::MaxRetriesExceeded { .. }) => return Err(err),
        }
    }
}

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Helper macro for creating transient errors
#[macro_export]
macro_rules! transient_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Transient {
            operation: $op,
            source: $err,
        }
    };
}

/// Helper macro for creating permanent errors
#[macro_export]
macro_rules! permanent_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Permanent {
            operation: $op,
            source: $err,
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn refused() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")
    }

    #[tokio::test]
    async fn test_successful_operation() {
        let result: RetryResult<&str, io::Error> =
            with_backoff("test_op", |_attempt| Box::pin(async { Ok("success") })).await;

        assert_eq!(result.unwrap(), "success");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_then_success() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let attempt_count_clone = Arc::clone(&attempt_count);

        let result = with_backoff("test_op", move |_attempt| {
            let count = attempt_count_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if count < 2 {
                    Err(transient_error!("test_op", refused()))
                } else {
                    Ok("success")
                }
            })
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_immediately() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let attempt_count_clone = Arc::clone(&attempt_count);

        let result: RetryResult<&str, io::Error> = with_backoff("test_op", move |_attempt| {
            attempt_count_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                Err(permanent_error!(
                    "test_op",
                    io::Error::new(io::ErrorKind::PermissionDenied, "permission denied")
                ))
            })
        })
        .await;

        assert!(matches!(result, Err(RetryError::Permanent { .. })));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_attempts_exceeded_keeps_last_error() {
        let policy = RetryPolicy::default().with_max_attempts(4);

        let result: RetryResult<(), io::Error> = with_policy("test_op", &policy, |attempt| {
            Box::pin(async move {
                Err(transient_error!(
                    "test_op",
                    io::Error::new(io::ErrorKind::TimedOut, format!("attempt {attempt}"))
                ))
            })
        })
        .await;

        match result {
            Err(RetryError::MaxRetriesExceeded {
                attempts, source, ..
            }) => {
                assert_eq!(attempts, 4);
                assert_eq!(source.to_string(), "attempt 4");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_backoff_is_capped_and_unbounded_in_time() {
        let policy = RetryPolicy {
            randomization_factor: 0.0,
            ..RetryPolicy::default()
        };
        let mut backoff = policy.backoff();

        assert!(backoff.max_elapsed_time.is_none());
        let delays: Vec<Duration> = (0..12).filter_map(|_| backoff.next_backoff()).collect();
        assert_eq!(delays.len(), 12);
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert!(delays.iter().all(|d| *d <= policy.max_interval));
        assert_eq!(*delays.last().unwrap(), policy.max_interval);
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::immediate(3).validate().is_ok());
        assert!(RetryPolicy::default().with_max_attempts(0).validate().is_err());

        let inverted = RetryPolicy {
            initial_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(1),
            ..RetryPolicy::default()
        };
        assert!(inverted.validate().is_err());
    }
}
