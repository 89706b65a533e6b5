/*!
Integration tests for restoring backups into a permission service.
*/

use relsnap_core::{
    BackupError, BackupHeader, Compression, ConflictStrategy, Decoder, Encoder, Fault,
    MemoryService, NoopRewriter, PrefixFilter, RelationshipRecord, RestoreConfig,
    RestoreOrchestrator, RestoreStats, RetryPolicy, ServiceError, StatusCode, ZedToken,
};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SCHEMA: &str = "definition user {}\n\ndefinition doc {\n  relation viewer: user\n}\n";

fn records(n: usize) -> Vec<RelationshipRecord> {
    (0..n)
        .map(|i| format!("doc:{i}#viewer@user:u{i}").parse().unwrap())
        .collect()
}

fn backup_with(schema: &str, records: &[RelationshipRecord]) -> Vec<u8> {
    let header = BackupHeader::new(schema, ZedToken::new("GhUKEzE2"));
    let mut encoder = Encoder::new(Vec::new(), &header, Compression::Gzip).unwrap();
    for record in records {
        encoder.append(record).unwrap();
    }
    encoder.close().unwrap()
}

fn backup(records: &[RelationshipRecord]) -> Vec<u8> {
    backup_with(SCHEMA, records)
}

async fn restore(
    service: &MemoryService,
    config: RestoreConfig,
    bytes: &[u8],
) -> Result<RestoreStats, BackupError> {
    let orchestrator = RestoreOrchestrator::new(service.clone(), NoopRewriter, config);
    orchestrator.restore(Decoder::new(bytes).unwrap()).await
}

#[tokio::test]
async fn test_batch_size_one() {
    let service = MemoryService::new();
    let config = RestoreConfig::default()
        .with_batch_size(1)
        .with_batches_per_transaction(1);

    let stats = restore(&service, config, &backup(&records(5))).await.unwrap();

    assert_eq!(stats.written_relationships, 5);
    assert_eq!(stats.written_batches, 5);
    assert_eq!(stats.commits, 5);
    assert_eq!(stats.total_retries, 0);
    assert_eq!(service.len(), 5);
}

#[tokio::test]
async fn test_batches_cover_input_with_one_remainder() {
    let service = MemoryService::new();
    let config = RestoreConfig::default().with_batch_size(3);

    let stats = restore(&service, config, &backup(&records(10))).await.unwrap();

    assert_eq!(service.stats().batch_sizes, vec![3, 3, 3, 1]);
    assert_eq!(stats.written_batches, 4);
    assert_eq!(stats.written_relationships, 10);
    assert_eq!(stats.commits, 1);
}

#[tokio::test]
async fn test_exact_multiple_has_no_short_batch() {
    let service = MemoryService::new();
    let config = RestoreConfig::default()
        .with_batch_size(3)
        .with_batches_per_transaction(2);

    let stats = restore(&service, config, &backup(&records(9))).await.unwrap();

    assert_eq!(service.stats().batch_sizes, vec![3, 3, 3]);
    assert_eq!(stats.commits, 2);
    assert_eq!(stats.written_relationships, 9);
}

#[tokio::test]
async fn test_three_records_two_per_batch_one_per_transaction() {
    let service = MemoryService::new();
    let config = RestoreConfig::default()
        .with_batch_size(2)
        .with_batches_per_transaction(1);

    let stats = restore(&service, config, &backup(&records(3))).await.unwrap();

    assert_eq!(service.stats().batch_sizes, vec![2, 1]);
    assert_eq!(stats.commits, 2);
    assert_eq!(stats.written_batches, 2);
    assert_eq!(stats.written_relationships, 3);
}

#[tokio::test]
async fn test_empty_backup_still_writes_schema() {
    let service = MemoryService::new();

    let stats = restore(&service, RestoreConfig::default(), &backup(&[]))
        .await
        .unwrap();

    assert_eq!(service.schema(), SCHEMA);
    assert_eq!(service.stats().schema_writes, 1);
    assert_eq!(service.stats().imports_opened, 0);
    assert_eq!(stats.written_batches, 0);
    assert_eq!(stats.commits, 0);
}

#[tokio::test]
async fn test_conflict_with_fail_aborts() {
    let all = records(3);
    let service = MemoryService::new().with_relationships([all[1].clone()]);

    let err = restore(&service, RestoreConfig::default(), &backup(&all))
        .await
        .unwrap_err();

    assert!(matches!(err, BackupError::DuplicateRelationships { .. }));
    assert!(err.to_string().contains("duplicate relationships found"));
    // Only the pre-existing relationship is there
    assert_eq!(service.len(), 1);
    assert_eq!(service.stats().commits, 0);
    assert_eq!(service.stats().touch_calls, 0);
}

#[tokio::test]
async fn test_conflict_with_skip_counts_transaction() {
    let all = records(4);
    let service = MemoryService::new().with_relationships([all[0].clone()]);
    let config = RestoreConfig::default()
        .with_batch_size(2)
        .with_batches_per_transaction(1)
        .with_conflict_strategy(ConflictStrategy::Skip);

    let stats = restore(&service, config, &backup(&all)).await.unwrap();

    assert_eq!(stats.skipped_relationships, 2);
    assert_eq!(stats.skipped_batches, 1);
    assert_eq!(stats.duplicate_relationships, stats.skipped_relationships);
    assert_eq!(stats.duplicate_batches, stats.skipped_batches);
    assert_eq!(stats.written_relationships + stats.skipped_relationships, 4);
    assert_eq!(stats.total_retries, 0);
    assert!(!service.contains(&all[1]));
    assert!(service.contains(&all[3]));
}

#[tokio::test]
async fn test_legacy_conflict_text_is_a_conflict() {
    let service = MemoryService::new();
    service.inject_commit_faults([Fault::Fail(ServiceError::unknown(
        "ERROR: duplicate key value violates unique constraint \"pk_relation_tuple\" (SQLSTATE 23505)",
    ))]);
    let config = RestoreConfig::default().with_conflict_strategy(ConflictStrategy::Skip);

    let stats = restore(&service, config, &backup(&records(3))).await.unwrap();

    assert_eq!(stats.skipped_relationships, 3);
    assert_eq!(stats.written_relationships, 0);
}

#[tokio::test(start_paused = true)]
async fn test_conflict_with_touch_converges() {
    let all = records(4);
    let service = MemoryService::new().with_relationships([all[0].clone()]);
    let config = RestoreConfig::default()
        .with_batch_size(2)
        .with_conflict_strategy(ConflictStrategy::Touch);

    let stats = restore(&service, config, &backup(&all)).await.unwrap();

    assert_eq!(service.len(), 4);
    assert_eq!(stats.written_relationships, 4);
    assert_eq!(stats.written_batches, 2);
    // one upsert per replayed batch
    assert_eq!(stats.total_retries, 2);
    assert_eq!(stats.skipped_relationships, 0);
    assert_eq!(stats.commits, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_commit_is_replayed_with_backoff() {
    let service = MemoryService::new();
    service.inject_commit_faults([Fault::Fail(ServiceError::unavailable("leader moved"))]);
    service.inject_touch_faults([Fault::Fail(ServiceError::new(
        StatusCode::Internal,
        "restart transaction: TransactionRetryWithProtoRefreshError",
    ))]);

    let stats = restore(&service, RestoreConfig::default(), &backup(&records(5)))
        .await
        .unwrap();

    assert_eq!(service.len(), 5);
    assert_eq!(stats.written_relationships, 5);
    assert_eq!(stats.total_retries, 2);
    assert_eq!(service.stats().touch_calls, 2);
}

#[tokio::test]
async fn test_retryable_with_retries_disabled_aborts() {
    let service = MemoryService::new();
    service.inject_commit_faults([Fault::Fail(ServiceError::unavailable("down"))]);
    let config = RestoreConfig::default().with_retries_disabled(true);

    let err = restore(&service, config, &backup(&records(2)))
        .await
        .unwrap_err();

    match err {
        BackupError::Service { source, .. } => assert_eq!(source.code, StatusCode::Unavailable),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(service.stats().touch_calls, 0);
    assert!(service.is_empty());
}

#[tokio::test]
async fn test_unrecoverable_commit_aborts() {
    let service = MemoryService::new();
    service.inject_commit_faults([Fault::Fail(ServiceError::new(
        StatusCode::PermissionDenied,
        "token lacks write permission",
    ))]);

    let err = restore(&service, RestoreConfig::default(), &backup(&records(2)))
        .await
        .unwrap_err();

    assert!(matches!(err, BackupError::Service { .. }));
    assert!(!err.is_canceled());
    assert_eq!(service.stats().touch_calls, 0);
}

#[tokio::test(start_paused = true)]
async fn test_replay_gives_up_after_max_attempts() {
    let service = MemoryService::new();
    service.inject_commit_faults([Fault::Fail(ServiceError::unavailable("down"))]);
    service.inject_touch_faults((0..3).map(|_| Fault::Fail(ServiceError::unavailable("down"))));
    let config = RestoreConfig::default().with_retry_policy(RetryPolicy::immediate(3));

    let err = restore(&service, config, &backup(&records(2)))
        .await
        .unwrap_err();

    match err {
        BackupError::RetriesExhausted {
            attempts, source, ..
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(source.code, StatusCode::Unavailable);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(service.stats().touch_calls, 3);
}

#[tokio::test]
async fn test_canceled_commit_is_not_retried() {
    let service = MemoryService::new();
    service.inject_commit_faults([Fault::Fail(ServiceError::canceled("context canceled"))]);

    let err = restore(&service, RestoreConfig::default(), &backup(&records(2)))
        .await
        .unwrap_err();

    assert!(err.is_canceled());
    assert_eq!(service.stats().touch_calls, 0);
}

#[tokio::test]
async fn test_cancel_before_start() {
    let service = MemoryService::new();
    let orchestrator =
        RestoreOrchestrator::new(service.clone(), NoopRewriter, RestoreConfig::default());
    orchestrator.cancellation_token().cancel();

    let bytes = backup(&records(2));
    let err = orchestrator
        .restore(Decoder::new(&bytes[..]).unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, BackupError::Canceled(_)));
    assert_eq!(service.stats().schema_writes, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_hung_commit() {
    let service = MemoryService::new();
    service.inject_commit_faults([Fault::Hang]);
    let orchestrator =
        RestoreOrchestrator::new(service.clone(), NoopRewriter, RestoreConfig::default());

    let token = orchestrator.cancellation_token().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let bytes = backup(&records(2));
    let err = orchestrator
        .restore(Decoder::new(&bytes[..]).unwrap())
        .await
        .unwrap_err();

    assert!(err.is_canceled());
    assert!(service.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_replay() {
    let service = MemoryService::new();
    service.inject_commit_faults([Fault::Fail(ServiceError::unavailable("down"))]);
    service.inject_touch_faults([Fault::Hang]);
    let orchestrator =
        RestoreOrchestrator::new(service.clone(), NoopRewriter, RestoreConfig::default());

    let token = orchestrator.cancellation_token().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let bytes = backup(&records(2));
    let err = orchestrator
        .restore(Decoder::new(&bytes[..]).unwrap())
        .await
        .unwrap_err();

    // cancelled well before the 30s request timeout
    assert!(err.is_canceled());
    assert_eq!(service.stats().touch_calls, 1);
}

#[tokio::test(start_paused = true)]
async fn test_partial_restore_resumes_with_touch() {
    let all = records(4);
    let service = MemoryService::new().with_relationships([all[2].clone()]);
    let config = RestoreConfig::default()
        .with_batch_size(2)
        .with_batches_per_transaction(1);
    let bytes = backup(&all);

    let err = restore(&service, config.clone(), &bytes).await.unwrap_err();
    assert!(matches!(err, BackupError::DuplicateRelationships { .. }));
    // first transaction stays written
    assert_eq!(service.len(), 3);

    let stats = restore(
        &service,
        config.with_conflict_strategy(ConflictStrategy::Touch),
        &bytes,
    )
    .await
    .unwrap();
    assert_eq!(service.len(), 4);
    assert_eq!(stats.written_relationships, 4);
}

#[tokio::test]
async fn test_rewriter_filters_are_counted() {
    let schema = "definition acme/user {}\n\ndefinition other/user {}\n";
    let all: Vec<RelationshipRecord> = vec![
        "acme/user:a#member@acme/user:b".parse().unwrap(),
        "other/user:a#member@other/user:b".parse().unwrap(),
        "acme/user:c#member@other/user:d".parse().unwrap(),
    ];
    let service = MemoryService::new();
    let orchestrator = RestoreOrchestrator::new(
        service.clone(),
        PrefixFilter::new("acme").unwrap(),
        RestoreConfig::default(),
    );

    let bytes = backup_with(schema, &all);
    let stats = orchestrator
        .restore(Decoder::new(&bytes[..]).unwrap())
        .await
        .unwrap();

    assert_eq!(stats.filtered_relationships, 2);
    assert_eq!(stats.written_relationships, 1);
    assert_eq!(service.schema(), "definition acme/user {}\n");
}

#[tokio::test]
async fn test_empty_rewritten_schema_is_not_written() {
    let service = MemoryService::new().with_schema("definition existing {}");
    let orchestrator = RestoreOrchestrator::new(
        service.clone(),
        PrefixFilter::new("nomatch").unwrap(),
        RestoreConfig::default(),
    );

    let bytes = backup(&records(2));
    let stats = orchestrator
        .restore(Decoder::new(&bytes[..]).unwrap())
        .await
        .unwrap();

    assert_eq!(service.stats().schema_writes, 0);
    assert_eq!(service.schema(), "definition existing {}");
    assert_eq!(stats.filtered_relationships, 2);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_any_write() {
    let service = MemoryService::new();
    let err = restore(
        &service,
        RestoreConfig::default().with_batch_size(0),
        &backup(&records(1)),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, BackupError::Validation(_)));
    assert_eq!(service.stats().schema_writes, 0);
}

#[tokio::test]
async fn test_corrupt_backup_aborts_restore() {
    let bytes = backup(&records(3));
    let mut plain = Vec::new();
    std::io::Read::read_to_end(
        &mut flate2::read::GzDecoder::new(&bytes[..]),
        &mut plain,
    )
    .unwrap();
    // drop the trailer line
    let text = String::from_utf8(plain).unwrap();
    let truncated: String = text.lines().take(3).map(|l| format!("{l}\n")).collect();

    let (logs, _guard) = capture_logs(tracing::Level::ERROR);
    let service = MemoryService::new();
    let orchestrator =
        RestoreOrchestrator::new(service.clone(), NoopRewriter, RestoreConfig::default());
    let err = orchestrator
        .restore(Decoder::new(truncated.as_bytes()).unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, BackupError::InvalidFormat(_)));
    assert!(service.is_empty());
    assert!(logs.contents().contains("restore aborted"));
}

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Capture formatted events at `level` and above for the current thread
fn capture_logs(level: tracing::Level) -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer({
            let logs = logs.clone();
            move || logs.clone()
        })
        .with_ansi(false)
        .with_max_level(level)
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}

fn two_batch_transactions() -> RestoreConfig {
    RestoreConfig::default()
        .with_batch_size(2)
        .with_batches_per_transaction(2)
}

#[tokio::test(start_paused = true)]
async fn test_successful_commit_outranks_failed_send() {
    let service = MemoryService::new();
    service.inject_send_faults([
        Fault::Pass,
        Fault::Fail(ServiceError::new(StatusCode::InvalidArgument, "batch rejected")),
    ]);

    let stats = restore(&service, two_batch_transactions(), &backup(&records(4)))
        .await
        .unwrap();

    // The first batch was committed, the unsent one was upserted
    assert_eq!(service.len(), 4);
    assert_eq!(service.stats().commits, 1);
    assert_eq!(service.stats().touch_calls, 1);
    assert_eq!(stats.commits, 1);
    assert_eq!(stats.written_relationships, 4);
    assert_eq!(stats.written_batches, 2);
    assert_eq!(stats.total_retries, 1);
}

#[tokio::test]
async fn test_conflicting_send_skips_only_unsent_batch() {
    let (logs, _guard) = capture_logs(tracing::Level::INFO);
    let service = MemoryService::new();
    service.inject_send_faults([
        Fault::Pass,
        Fault::Fail(ServiceError::already_exists("relationship exists")),
    ]);
    let config = two_batch_transactions().with_conflict_strategy(ConflictStrategy::Skip);

    let stats = restore(&service, config, &backup(&records(4))).await.unwrap();

    assert_eq!(service.len(), 2);
    assert_eq!(stats.written_relationships, 2);
    assert_eq!(stats.written_batches, 1);
    assert_eq!(stats.skipped_relationships, 2);
    assert_eq!(stats.skipped_batches, 1);
    assert_eq!(stats.duplicate_relationships, 2);
    assert_eq!(stats.total_retries, 0);

    let output = logs.contents();
    assert!(output.contains("restore complete"));
    assert!(output.contains("skipped_batches=1"));
    assert!(output.contains("duplicate_batches=1"));
}

#[tokio::test]
async fn test_failed_send_without_retries_keeps_committed_batches() {
    let service = MemoryService::new();
    service.inject_send_faults([Fault::Pass, Fault::Fail(ServiceError::unavailable("reset"))]);
    let config = two_batch_transactions().with_retries_disabled(true);

    let err = restore(&service, config, &backup(&records(4)))
        .await
        .unwrap_err();

    match err {
        BackupError::Service { operation, source } => {
            assert_eq!(operation, "send batch");
            assert_eq!(source.code, StatusCode::Unavailable);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(service.len(), 2);
    assert_eq!(service.stats().commits, 1);
    assert_eq!(service.stats().touch_calls, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_commit_decides_for_whole_transaction() {
    let service = MemoryService::new();
    service.inject_send_faults([
        Fault::Pass,
        Fault::Fail(ServiceError::new(StatusCode::InvalidArgument, "batch rejected")),
    ]);
    service.inject_commit_faults([Fault::Fail(ServiceError::unavailable("leader moved"))]);

    let stats = restore(&service, two_batch_transactions(), &backup(&records(4)))
        .await
        .unwrap();

    assert_eq!(service.len(), 4);
    assert_eq!(stats.commits, 0);
    assert_eq!(stats.written_relationships, 4);
    assert_eq!(stats.total_retries, 2);
}

#[tokio::test]
async fn test_commit_count_mismatch_is_reported_not_fatal() {
    let (logs, _guard) = capture_logs(tracing::Level::WARN);
    let service = MemoryService::new();
    service.inject_commit_reports([1]);
    let config = RestoreConfig::default()
        .with_batch_size(2)
        .with_batches_per_transaction(1);

    let stats = restore(&service, config, &backup(&records(4))).await.unwrap();

    // The service's own count is what gets reported
    assert_eq!(service.len(), 4);
    assert_eq!(stats.commits, 2);
    assert_eq!(stats.written_relationships, 3);
    assert_eq!(stats.written_batches, 2);

    let output = logs.contents();
    assert!(output.contains("service reported a different number of written relationships"));
    assert!(output.contains("expected=2"));
    assert!(output.contains("written=1"));
}
