/*!
Restore: replay a decoded backup into the live service.

Relationships are grouped into batches, batches are sent on a bulk import
stream and every `batches_per_transaction` batches the stream is closed,
which commits them atomically. A failed commit is classified and handled by
the conflict strategy and retry settings:

| commit outcome             | next step                                   |
|----------------------------|---------------------------------------------|
| success                    | count written, keep streaming               |
| canceled                   | abort                                       |
| conflict, strategy `fail`  | abort with a duplicate relationships error  |
| conflict, strategy `skip`  | count the transaction as skipped, continue  |
| conflict, strategy `touch` | replay the transaction as upserts           |
| retryable                  | replay as upserts, or abort if retries are disabled |
| anything else              | abort                                       |

A commit that succeeds is trusted: the relationships it reports are counted
as written. If sending a batch failed earlier in that transaction, only the
batches the server never received are settled afterwards, by the same table
applied to the send error. Batches that were never received are replayed as
upserts even when that error is not retryable.

Nothing is rolled back on abort; re-running with `skip` or `touch` resumes a
partial restore.
*/

use crate::classify::{classify, ErrorClass};
use crate::observability::{
    record_commit_latency, record_filtered, record_retry, record_skipped, record_written,
};
use crate::service::{ImportStream, PermissionsService, ServiceError};
use crate::{
    BackupError, CancellationToken, ConflictStrategy, Decoder, RelationshipRecord, RestoreConfig,
    Result, Rewriter,
};
use relsnap_retry::{permanent_error, transient_error, BoxFuture, RetryError, RetryableError};
use std::io::Read;
use std::mem;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const OP_WRITE_SCHEMA: &str = "write schema";
const OP_OPEN_IMPORT: &str = "open import";
const OP_SEND: &str = "send batch";
const OP_COMMIT: &str = "commit import";
const OP_TOUCH: &str = "touch relationships";

/// Counters reported by a finished restore
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreStats {
    pub written_relationships: u64,
    pub written_batches: u64,
    pub skipped_relationships: u64,
    pub skipped_batches: u64,
    pub duplicate_relationships: u64,
    pub duplicate_batches: u64,
    /// Relationships excluded by the rewriter
    pub filtered_relationships: u64,
    /// Upsert requests issued while replaying failed transactions
    pub total_retries: u64,
    /// Successful commits
    pub commits: u64,
    pub elapsed: Duration,
}

impl RestoreStats {
    /// Relationships written per second
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.written_relationships as f64 / secs
        } else {
            0.0
        }
    }
}

/// Steps of a restore; aborting is an early return with the error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Streaming,
    Committing,
    Retrying,
    Completed,
}

/// Replays backups into a [`PermissionsService`]
///
/// # Example
/// ```rust
/// use relsnap_core::{
///     BackupHeader, Compression, Decoder, Encoder, MemoryService, NoopRewriter,
///     RestoreConfig, RestoreOrchestrator, ZedToken,
/// };
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let header = BackupHeader::new("definition user {}", ZedToken::new("GhUKEzE2"));
/// let mut encoder = Encoder::new(Vec::new(), &header, Compression::Gzip)?;
/// encoder.append(&"document:readme#viewer@user:alice".parse()?)?;
/// let backup = encoder.close()?;
///
/// let service = MemoryService::new();
/// let orchestrator = RestoreOrchestrator::new(service.clone(), NoopRewriter, RestoreConfig::default());
/// let stats = orchestrator.restore(Decoder::new(&backup[..])?).await?;
/// assert_eq!(stats.written_relationships, 1);
/// assert_eq!(service.schema(), "definition user {}");
/// # Ok::<(), relsnap_core::BackupError>(())
/// # }).unwrap();
/// ```
pub struct RestoreOrchestrator<S, R> {
    service: S,
    rewriter: R,
    config: RestoreConfig,
    cancel: CancellationToken,
}

impl<S: PermissionsService, R: Rewriter> RestoreOrchestrator<S, R> {
    pub fn new(service: S, rewriter: R, config: RestoreConfig) -> Self {
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

    pub fn config(&self) -> &RestoreConfig {
        &self.config
    }

    /// Restore the schema and every relationship of `decoder`
    ///
    /// The (rewritten) schema is written first. On failure the relationships
    /// committed so far stay written.
    pub async fn restore<Rd: Read>(&self, decoder: Decoder<Rd>) -> Result<RestoreStats> {
        self.config.validate()?;
        let started = Instant::now();

        let mut run = RestoreRun {
            orchestrator: self,
            decoder,
            stream: None,
            batch: Vec::with_capacity(self.config.batch_size),
            pending: Vec::with_capacity(self.config.batches_per_transaction),
            sent_since_commit: 0,
            send_error: None,
            exhausted: false,
            stats: RestoreStats::default(),
        };

        run.check_cancelled()?;
        run.write_schema().await?;

        let mut state = State::Streaming;
        while state != State::Completed {
            debug!(?state, "restore step");
            state = match state {
                State::Streaming => run.stream().await?,
                State::Committing => run.commit().await?,
                State::Retrying => run.retry().await?,
                State::Completed => State::Completed,
            };
        }

        let mut stats = run.stats;
        stats.elapsed = started.elapsed();
        info!(
            written_relationships = stats.written_relationships,
            written_batches = stats.written_batches,
            skipped_relationships = stats.skipped_relationships,
            skipped_batches = stats.skipped_batches,
            duplicate_relationships = stats.duplicate_relationships,
            duplicate_batches = stats.duplicate_batches,
            filtered_relationships = stats.filtered_relationships,
            total_retries = stats.total_retries,
            commits = stats.commits,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            rate_per_sec = stats.rate(),
            "restore complete"
        );
        Ok(stats)
    }
}

/// Mutable state of one restore
struct RestoreRun<'a, S, R, Rd: Read> {
    orchestrator: &'a RestoreOrchestrator<S, R>,
    decoder: Decoder<Rd>,
    /// Import stream of the current transaction, opened on first send
    stream: Option<Box<dyn ImportStream>>,
    batch: Vec<RelationshipRecord>,
    /// Batches sent since the last commit
    pending: Vec<Vec<RelationshipRecord>>,
    /// Batches of `pending` that reached the server, from the front
    sent_since_commit: usize,
    /// First send failure of the transaction and the call that failed
    send_error: Option<(&'static str, ServiceError)>,
    exhausted: bool,
    stats: RestoreStats,
}

impl<'a, S: PermissionsService, R: Rewriter, Rd: Read> RestoreRun<'a, S, R, Rd> {
    fn pending_relationships(&self) -> u64 {
        self.pending.iter().map(|batch| batch.len() as u64).sum()
    }

    fn after_transaction(&self) -> State {
        if self.exhausted {
            State::Completed
        } else {
            State::Streaming
        }
    }

    fn clear_transaction(&mut self) {
        self.pending.clear();
        self.sent_since_commit = 0;
        self.send_error = None;
        self.stream = None;
    }

    /// Log the abort with the progress made so far and hand back the error
    fn abort(&self, err: BackupError) -> BackupError {
        error!(
            error = %err,
            written_relationships = self.stats.written_relationships,
            written_batches = self.stats.written_batches,
            skipped_relationships = self.stats.skipped_relationships,
            pending_batches = self.pending.len(),
            pending_relationships = self.pending_relationships(),
            "restore aborted"
        );
        err
    }

    fn canceled(&self) -> BackupError {
        self.abort(BackupError::canceled("restore canceled"))
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.orchestrator.cancel.is_cancelled() {
            return Err(self.canceled());
        }
        Ok(())
    }

    async fn write_schema(&mut self) -> Result<()> {
        let orchestrator = self.orchestrator;
        let schema = orchestrator
            .rewriter
            .rewrite_schema(self.decoder.schema())
            .map_err(|e| self.abort(e))?;
        if schema.trim().is_empty() {
            warn!("schema is empty after rewriting, not writing it");
            return Ok(());
        }

        let written = orchestrator
            .cancel
            .run_until_cancelled(orchestrator.service.write_schema(&schema))
            .await
            .ok_or_else(|| self.canceled())?;
        written.map_err(|e| self.abort(BackupError::service(OP_WRITE_SCHEMA, e)))?;

        info!(bytes = schema.len(), "schema written");
        Ok(())
    }

    /// Read, rewrite and batch relationships until a commit is due
    async fn stream(&mut self) -> Result<State> {
        let orchestrator = self.orchestrator;
        let config = &orchestrator.config;

        loop {
            self.check_cancelled()?;

            let next = self.decoder.next_relationship().map_err(|e| self.abort(e))?;
            let Some(relationship) = next else {
                self.exhausted = true;
                if !self.batch.is_empty() {
                    self.send_batch().await?;
                }
                return Ok(if self.pending.is_empty() {
                    State::Completed
                } else {
                    State::Committing
                });
            };

            let rewritten = orchestrator
                .rewriter
                .rewrite_relationship(relationship)
                .map_err(|e| self.abort(e))?;
            let Some(relationship) = rewritten else {
                self.stats.filtered_relationships += 1;
                record_filtered();
                continue;
            };

            self.batch.push(relationship);
            if self.batch.len() < config.batch_size {
                continue;
            }

            if !self.send_batch().await? {
                return Ok(State::Committing);
            }
            if self.sent_since_commit >= config.batches_per_transaction {
                return Ok(State::Committing);
            }
        }
    }

    /// Move the current batch into the transaction and send it
    ///
    /// Returns `false` when the send failed; the failure is kept for the
    /// commit, which reports the authoritative outcome.
    async fn send_batch(&mut self) -> Result<bool> {
        let orchestrator = self.orchestrator;
        let batch = mem::replace(
            &mut self.batch,
            Vec::with_capacity(orchestrator.config.batch_size),
        );

        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                let opened = orchestrator
                    .cancel
                    .run_until_cancelled(orchestrator.service.open_import())
                    .await;
                match opened {
                    Some(Ok(stream)) => stream,
                    Some(Err(err)) => {
                        warn!(error = %err, "could not open import stream");
                        self.pending.push(batch);
                        self.send_error = Some((OP_OPEN_IMPORT, err));
                        return Ok(false);
                    }
                    None => {
                        self.pending.push(batch);
                        return Err(self.canceled());
                    }
                }
            }
        };

        let stream = self.stream.insert(stream);
        let sent = orchestrator
            .cancel
            .run_until_cancelled(stream.send(&batch))
            .await;
        self.pending.push(batch);

        match sent {
            None => Err(self.canceled()),
            Some(Ok(())) => {
                self.sent_since_commit += 1;
                Ok(true)
            }
            Some(Err(err)) => {
                warn!(
                    error = %err,
                    pending_batches = self.pending.len(),
                    "sending batch failed, committing what was sent"
                );
                self.send_error = Some((OP_SEND, err));
                Ok(false)
            }
        }
    }

    /// Close the import stream and act on the outcome
    async fn commit(&mut self) -> Result<State> {
        self.check_cancelled()?;
        let orchestrator = self.orchestrator;
        let send_error = self.send_error.take();
        let sent_batches = self.sent_since_commit.min(self.pending.len());

        if let Some(stream) = self.stream.take() {
            let started = Instant::now();
            let outcome = orchestrator
                .cancel
                .run_until_cancelled(stream.close_and_receive())
                .await
                .ok_or_else(|| self.canceled())?;
            record_commit_latency(started.elapsed());

            match outcome {
                Ok(written) => self.record_commit(sent_batches, written),
                // A failed commit decides for every batch of the transaction
                Err(err) => return self.resolve(OP_COMMIT, err, false),
            }
        }

        self.pending.drain(..sent_batches);
        self.sent_since_commit = 0;

        match send_error {
            Some((operation, err)) if !self.pending.is_empty() => {
                debug!(
                    unsent_batches = self.pending.len(),
                    "settling batches the service did not receive"
                );
                self.resolve(operation, err, true)
            }
            _ => {
                self.clear_transaction();
                Ok(self.after_transaction())
            }
        }
    }

    fn record_commit(&mut self, sent_batches: usize, written: u64) {
        let expected: u64 = self.pending[..sent_batches]
            .iter()
            .map(|batch| batch.len() as u64)
            .sum();
        if written != expected {
            warn!(
                expected,
                written, "service reported a different number of written relationships"
            );
        }

        self.stats.written_relationships += written;
        self.stats.written_batches += sent_batches as u64;
        self.stats.commits += 1;
        record_written(written);
        debug!(written, commits = self.stats.commits, "transaction committed");
    }

    /// Handle a failure that left every pending batch unwritten
    ///
    /// `unsent` marks batches the service never received; those are
    /// replayed as upserts unless the failure is a conflict or a
    /// cancellation.
    fn resolve(
        &mut self,
        operation: &'static str,
        err: ServiceError,
        unsent: bool,
    ) -> Result<State> {
        let orchestrator = self.orchestrator;
        let config = &orchestrator.config;
        let relationships = self.pending_relationships();
        let batches = self.pending.len();

        match (classify(&err), config.conflict_strategy) {
            (ErrorClass::Canceled, _) => Err(self.abort(BackupError::service(operation, err))),
            (ErrorClass::Conflict, ConflictStrategy::Fail) => {
                Err(self.abort(BackupError::DuplicateRelationships {
                    batches,
                    relationships: relationships as usize,
                }))
            }
            (ErrorClass::Conflict, ConflictStrategy::Skip) => {
                self.stats.skipped_relationships += relationships;
                self.stats.skipped_batches += batches as u64;
                self.stats.duplicate_relationships += relationships;
                self.stats.duplicate_batches += batches as u64;
                record_skipped(relationships);
                warn!(
                    relationships,
                    batches, "batches contained existing relationships, skipping them"
                );

                self.clear_transaction();
                Ok(self.after_transaction())
            }
            (ErrorClass::Conflict, ConflictStrategy::Touch) => {
                info!(
                    batches,
                    "batches contained existing relationships, touching them instead"
                );
                Ok(State::Retrying)
            }
            (ErrorClass::Retryable, _) if !config.disable_retries => {
                warn!(error = %err, operation, batches, "replaying batches as upserts");
                Ok(State::Retrying)
            }
            (ErrorClass::Unrecoverable, _) if unsent && !config.disable_retries => {
                warn!(error = %err, operation, batches, "resending unsent batches as upserts");
                Ok(State::Retrying)
            }
            _ => Err(self.abort(BackupError::service(operation, err))),
        }
    }

    /// Replay every pending batch with idempotent upserts
    async fn retry(&mut self) -> Result<State> {
        let orchestrator = self.orchestrator;
        let config = &orchestrator.config;
        let service = &orchestrator.service;
        let timeout = config.request_timeout;

        while !self.pending.is_empty() {
            self.check_cancelled()?;

            let batch = self.pending.remove(0);
            let batch_ref: &[RelationshipRecord] = &batch;
            let mut issued = 0u64;

            let replay = relsnap_retry::with_policy(OP_TOUCH, &config.retry, |attempt| {
                issued += 1;
                record_retry();
                debug!(attempt, relationships = batch_ref.len(), "touching batch");
                let touch: BoxFuture<'_, (), ServiceError> = Box::pin(async move {
                    let result =
                        match tokio::time::timeout(timeout, service.touch_relationships(batch_ref))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(ServiceError::deadline_exceeded(format!(
                                "touch timed out after {}ms",
                                timeout.as_millis()
                            ))),
                        };
                    result.map_err(|err| {
                        if err.is_transient() {
                            transient_error!(OP_TOUCH, err)
                        } else {
                            permanent_error!(OP_TOUCH, err)
                        }
                    })
                });
                touch
            });

            let outcome = orchestrator.cancel.run_until_cancelled(replay).await;
            self.stats.total_retries += issued;

            match outcome {
                None => {
                    self.pending.insert(0, batch);
                    return Err(self.canceled());
                }
                Some(Ok(())) => {
                    let written = batch.len() as u64;
                    self.stats.written_relationships += written;
                    self.stats.written_batches += 1;
                    record_written(written);
                }
                Some(Err(RetryError::MaxRetriesExceeded {
                    attempts, source, ..
                })) => {
                    self.pending.insert(0, batch);
                    return Err(self.abort(BackupError::RetriesExhausted {
                        operation: OP_TOUCH,
                        attempts,
                        source,
                    }));
                }
                Some(Err(err)) => {
                    self.pending.insert(0, batch);
                    return Err(self.abort(BackupError::service(OP_TOUCH, err.into_source())));
                }
            }
        }

        debug!(
            written = self.stats.written_relationships,
            total_retries = self.stats.total_retries,
            "transaction replayed"
        );
        self.clear_transaction();
        Ok(self.after_transaction())
    }
}
