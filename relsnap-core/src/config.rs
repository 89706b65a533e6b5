//! Configuration for backup creation and restore
//!
//! This module provides the settings structures consumed by the
//! orchestrators: batching and transaction sizes, the conflict strategy,
//! retry behaviour and request timeouts.

use crate::{BackupError, Compression, Result};
use relsnap_retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What to do when a commit fails because relationships already exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Abort the restore
    #[default]
    Fail,
    /// Drop the conflicting transaction and carry on
    Skip,
    /// Replay the transaction as idempotent upserts
    Touch,
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictStrategy::Fail => "fail",
            ConflictStrategy::Skip => "skip",
            ConflictStrategy::Touch => "touch",
        };
        f.write_str(name)
    }
}

impl FromStr for ConflictStrategy {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(ConflictStrategy::Fail),
            "skip" => Ok(ConflictStrategy::Skip),
            "touch" => Ok(ConflictStrategy::Touch),
            other => Err(BackupError::validation(format!(
                "unknown conflict strategy {other:?} (expected fail, skip or touch)"
            ))),
        }
    }
}

/// Settings for [`RestoreOrchestrator`](crate::RestoreOrchestrator)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Relationships per batch sent on the import stream
    pub batch_size: usize,
    /// Batches committed together in one transaction
    pub batches_per_transaction: usize,
    pub conflict_strategy: ConflictStrategy,
    /// Abort on retryable commit failures instead of replaying them
    pub disable_retries: bool,
    /// Timeout applied to each upsert request during replay
    pub request_timeout: Duration,
    /// Backoff used while replaying batches
    pub retry: RetryPolicy,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            batches_per_transaction: 10,
            conflict_strategy: ConflictStrategy::Fail,
            disable_retries: false,
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl RestoreConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_batches_per_transaction(mut self, batches: usize) -> Self {
        self.batches_per_transaction = batches;
        self
    }

    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    pub fn with_retries_disabled(mut self, disabled: bool) -> Self {
        self.disable_retries = disabled;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(BackupError::validation("batch size must be at least 1"));
        }
        if self.batches_per_transaction == 0 {
            return Err(BackupError::validation(
                "batches per transaction must be at least 1",
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(BackupError::validation("request timeout must be positive"));
        }
        self.retry
            .validate()
            .map_err(|e| BackupError::validation(format!("invalid retry policy: {e}")))
    }
}

/// Settings for [`CreateOrchestrator`](crate::CreateOrchestrator)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateConfig {
    /// Relationships requested per export page
    pub page_limit: u32,
    /// Fail on the first export error instead of resuming from the cursor
    pub disable_retries: bool,
    /// Backoff used when resuming a broken export
    pub retry: RetryPolicy,
    pub compression: Compression,
}

impl Default for CreateConfig {
    fn default() -> Self {
        Self {
            page_limit: 1_000,
            disable_retries: false,
            retry: RetryPolicy::default(),
            compression: Compression::Gzip,
        }
    }
}

impl CreateConfig {
    pub fn with_page_limit(mut self, page_limit: u32) -> Self {
        self.page_limit = page_limit;
        self
    }

    pub fn with_retries_disabled(mut self, disabled: bool) -> Self {
        self.disable_retries = disabled;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.page_limit == 0 {
            return Err(BackupError::validation("page limit must be at least 1"));
        }
        self.retry
            .validate()
            .map_err(|e| BackupError::validation(format!("invalid retry policy: {e}")))
    }
}
