/*!
Backup creation: snapshot-consistent export into an [`Encoder`].
*/

use crate::classify::{classify, ErrorClass};
use crate::observability::{record_exported, record_filtered};
use crate::service::{ExportPage, PermissionsService, RelationshipExport, ServiceError};
use crate::{
    BackupError, BackupHeader, CancellationToken, CreateConfig, Encoder, Result, Rewriter,
    ZedToken,
};
use relsnap_retry::Backoff;
use std::io::Write;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const OP_READ_SCHEMA: &str = "read schema";
const OP_EXPORT: &str = "export relationships";

/// Counters reported by a finished backup
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateStats {
    /// Relationships received from the service
    pub processed: u64,
    /// Relationships written to the backup
    pub encoded: u64,
    /// Relationships excluded by the rewriter
    pub filtered: u64,
    /// Export pages received
    pub pages: u64,
    /// Times the export was reopened after a failure
    pub resumed: u64,
    pub elapsed: Duration,
}

impl CreateStats {
    /// Relationships processed per second
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.processed as f64 / secs
        } else {
            0.0
        }
    }
}

/// Exports the service state at one snapshot into a backup stream
///
/// # Example
/// ```rust
/// use relsnap_core::{CreateConfig, CreateOrchestrator, MemoryService, NoopRewriter};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let service = MemoryService::new().with_schema("definition user {}");
/// let orchestrator = CreateOrchestrator::new(service, NoopRewriter, CreateConfig::default());
/// let (backup, stats) = orchestrator.run(Vec::new()).await?;
/// assert_eq!(stats.encoded, 0);
/// assert!(!backup.is_empty());
/// # Ok::<(), relsnap_core::BackupError>(())
/// # }).unwrap();
/// ```
pub struct CreateOrchestrator<S, R> {
    service: S,
    rewriter: R,
    config: CreateConfig,
    cancel: CancellationToken,
}

impl<S: PermissionsService, R: Rewriter> CreateOrchestrator<S, R> {
    pub fn new(service: S, rewriter: R, config: CreateConfig) -> Self {
        Self {
            service,
            rewriter,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Use a cancellation token shared with the caller
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(BackupError::canceled("backup creation canceled"));
        }
        Ok(())
    }

    /// Write a complete backup to `writer` and return it with the run's counters
    ///
    /// The schema and the snapshot token are read once; every page of the
    /// export is then requested at that token, so the backup is consistent
    /// even while the service keeps accepting writes.
    pub async fn run<W: Write>(&self, writer: W) -> Result<(W, CreateStats)> {
        self.config.validate()?;
        let started = Instant::now();
        let mut stats = CreateStats::default();

        self.check_cancelled()?;
        let snapshot = self
            .cancel
            .run_until_cancelled(self.service.read_schema())
            .await
            .ok_or_else(|| BackupError::canceled("backup creation canceled"))?
            .map_err(|e| BackupError::service(OP_READ_SCHEMA, e))?;

        let schema = self.rewriter.rewrite_schema(&snapshot.schema)?;
        let header = BackupHeader::new(schema, snapshot.zed_token.clone());
        let mut encoder = Encoder::new(writer, &header, self.config.compression)?;

        info!(
            zed_token = %snapshot.zed_token,
            compression = self.config.compression.algorithm_name(),
            "starting backup"
        );

        let mut export: Option<Box<dyn RelationshipExport>> = None;
        let mut cursor: Option<String> = None;
        let mut backoff = self.config.retry.backoff();
        let mut failures = 0usize;

        loop {
            self.check_cancelled()?;

            let next = self
                .cancel
                .run_until_cancelled(self.next_page(&mut export, &snapshot.zed_token, &cursor))
                .await
                .ok_or_else(|| BackupError::canceled("backup creation canceled"))?;

            let page = match next {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(err) => {
                    export = None;
                    failures += 1;
                    let delay = self.resume_delay(err, failures, &mut backoff)?;
                    stats.resumed += 1;
                    self.cancel
                        .run_until_cancelled(tokio::time::sleep(delay))
                        .await
                        .ok_or_else(|| BackupError::canceled("backup creation canceled"))?;
                    continue;
                }
            };

            failures = 0;
            backoff.reset();
            stats.pages += 1;

            if let Some(next_cursor) = page.cursor {
                cursor = Some(next_cursor);
            }
            for relationship in page.relationships {
                self.check_cancelled()?;
                stats.processed += 1;

                match self.rewriter.rewrite_relationship(relationship)? {
                    Some(relationship) => {
                        encoder.append(&relationship)?;
                        stats.encoded += 1;
                        record_exported();
                    }
                    None => {
                        stats.filtered += 1;
                        record_filtered();
                    }
                }
            }
            debug!(pages = stats.pages, processed = stats.processed, "export page done");
        }

        let writer = encoder.close()?;
        stats.elapsed = started.elapsed();

        info!(
            processed = stats.processed,
            encoded = stats.encoded,
            filtered = stats.filtered,
            resumed = stats.resumed,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            rate_per_sec = stats.rate(),
            "backup complete"
        );
        Ok((writer, stats))
    }

    /// Open the export if needed and fetch its next page
    async fn next_page(
        &self,
        export: &mut Option<Box<dyn RelationshipExport>>,
        zed_token: &ZedToken,
        cursor: &Option<String>,
    ) -> std::result::Result<Option<ExportPage>, ServiceError> {
        let stream = match export.take() {
            Some(stream) => stream,
            None => {
                if cursor.is_some() {
                    debug!(cursor = ?cursor, "resuming export");
                }
                self.service
                    .export_relationships(zed_token, cursor.clone(), self.config.page_limit)
                    .await?
            }
        };
        export.insert(stream).next_page().await
    }

    /// Decide whether a failed export is resumed and after how long
    fn resume_delay(
        &self,
        err: ServiceError,
        failures: usize,
        backoff: &mut impl Backoff,
    ) -> Result<Duration> {
        match classify(&err) {
            ErrorClass::Canceled => return Err(BackupError::service(OP_EXPORT, err)),
            ErrorClass::Retryable if !self.config.disable_retries => {}
            _ => return Err(BackupError::service(OP_EXPORT, err)),
        }

        if failures >= self.config.retry.max_attempts {
            return Err(BackupError::RetriesExhausted {
                operation: OP_EXPORT,
                attempts: failures,
                source: err,
            });
        }

        let delay = backoff
            .next_backoff()
            .unwrap_or(self.config.retry.max_interval);
        warn!(
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "export failed, resuming from last cursor"
        );
        Ok(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewriter::MockRewriter;
    use crate::{Decoder, MemoryService, NoopRewriter, RelationshipRecord};

    #[tokio::test]
    async fn test_rewriter_exclusions_are_counted() {
        let service = MemoryService::new()
            .with_schema("definition user {}")
            .with_relationships([
                "doc:1#viewer@user:a".parse::<RelationshipRecord>().unwrap(),
                "doc:2#viewer@user:b".parse().unwrap(),
            ]);

        let mut rewriter = MockRewriter::new();
        rewriter
            .expect_rewrite_schema()
            .times(1)
            .returning(|schema| Ok(schema.to_string()));
        rewriter
            .expect_rewrite_relationship()
            .times(2)
            .returning(|rel| Ok((rel.resource_id == "1").then_some(rel)));

        let orchestrator = CreateOrchestrator::new(service, rewriter, CreateConfig::default());
        let (bytes, stats) = orchestrator.run(Vec::new()).await.unwrap();

        assert_eq!(stats.processed, 2);
        assert_eq!(stats.encoded, 1);
        assert_eq!(stats.filtered, 1);
        assert_eq!(Decoder::new(&bytes[..]).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let orchestrator =
            CreateOrchestrator::new(MemoryService::new(), NoopRewriter, CreateConfig::default());
        orchestrator.cancellation_token().cancel();

        let err = orchestrator.run(Vec::new()).await.unwrap_err();
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let orchestrator = CreateOrchestrator::new(
            MemoryService::new(),
            NoopRewriter,
            CreateConfig::default().with_page_limit(0),
        );
        assert!(matches!(
            orchestrator.run(Vec::new()).await,
            Err(BackupError::Validation(_))
        ));
    }
}
