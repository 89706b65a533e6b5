/*!
Observability infrastructure for relsnap.

This module provides:
- Structured logging setup on top of `tracing-subscriber`
- Prometheus counters for backup and restore progress (feature `metrics`)

The `record_*` helpers are always available and compile to nothing when the
`metrics` feature is disabled, so the orchestrators can call them freely.
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use std::time::Duration;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry as TracingRegistry};

use crate::{BackupError, Result};

/// Filter directive used when `RUST_LOG` is not set
pub const DEFAULT_DIRECTIVE: &str = "relsnap=info";

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<BackupMetrics> = OnceLock::new();

/// Metrics collected while creating and restoring backups
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct BackupMetrics {
    pub relationships_written_total: Counter,
    pub relationships_skipped_total: Counter,
    pub relationships_filtered_total: Counter,
    pub relationships_exported_total: Counter,
    pub retries_total: Counter,
    pub commit_latency_seconds: Histogram,

    // Prometheus registry for scraping
    registry: Registry,
}

#[cfg(feature = "metrics")]
fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter> {
    let counter = Counter::new(name, help)
        .map_err(|e| BackupError::observability(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| BackupError::observability(format!("Failed to register {name}: {e}")))?;
    Ok(counter)
}

#[cfg(feature = "metrics")]
impl BackupMetrics {
    /// Initialize new metrics instance
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let relationships_written_total = counter(
            &registry,
            "relsnap_relationships_written_total",
            "Relationships written to the service by restores",
        )?;
        let relationships_skipped_total = counter(
            &registry,
            "relsnap_relationships_skipped_total",
            "Relationships skipped because they already existed",
        )?;
        let relationships_filtered_total = counter(
            &registry,
            "relsnap_relationships_filtered_total",
            "Relationships excluded by a rewriter",
        )?;
        let relationships_exported_total = counter(
            &registry,
            "relsnap_relationships_exported_total",
            "Relationships encoded into backups",
        )?;
        let retries_total = counter(
            &registry,
            "relsnap_retries_total",
            "Upsert requests issued while replaying failed transactions",
        )?;

        let commit_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "relsnap_commit_latency_seconds",
            "Duration of import commits in seconds",
        ))
        .map_err(|e| {
            BackupError::observability(format!(
                "Failed to create commit_latency_seconds metric: {e}"
            ))
        })?;
        registry
            .register(Box::new(commit_latency_seconds.clone()))
            .map_err(|e| {
                BackupError::observability(format!("Failed to register commit_latency_seconds: {e}"))
            })?;

        Ok(Self {
            relationships_written_total,
            relationships_skipped_total,
            relationships_filtered_total,
            relationships_exported_total,
            retries_total,
            commit_latency_seconds,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    pub fn global() -> Result<&'static BackupMetrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }
        let metrics = Self::new()?;
        // Another thread may have won the race; either instance is fine
        let _ = METRICS.set(metrics);
        METRICS
            .get()
            .ok_or_else(|| BackupError::observability("metrics registry unavailable"))
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| BackupError::observability(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer).map_err(|e| {
            BackupError::observability(format!("Failed to convert metrics to string: {e}"))
        })
    }
}

#[cfg(feature = "metrics")]
fn with_metrics(f: impl FnOnce(&BackupMetrics)) {
    if let Ok(metrics) = BackupMetrics::global() {
        f(metrics);
    }
}

pub(crate) fn record_written(count: u64) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.relationships_written_total.inc_by(count as f64));
    #[cfg(not(feature = "metrics"))]
    let _ = count;
}

pub(crate) fn record_skipped(count: u64) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.relationships_skipped_total.inc_by(count as f64));
    #[cfg(not(feature = "metrics"))]
    let _ = count;
}

pub(crate) fn record_filtered() {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.relationships_filtered_total.inc());
}

pub(crate) fn record_exported() {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.relationships_exported_total.inc());
}

pub(crate) fn record_retry() {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.retries_total.inc());
}

pub(crate) fn record_commit_latency(duration: Duration) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.commit_latency_seconds.observe(duration.as_secs_f64()));
    #[cfg(not(feature = "metrics"))]
    let _ = duration;
}

/// Initialize the global observability system
///
/// Installs a `tracing` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive`, and initializes the metrics registry when the
/// `metrics` feature is enabled.
///
/// # Arguments
/// * `json` - Emit one JSON object per event instead of human-readable lines
/// * `default_directive` - Filter used when `RUST_LOG` is unset, e.g. `relsnap=debug`
///
/// # Returns
/// Result indicating success or failure of initialization
pub fn init_observability(json: bool, default_directive: &str) -> Result<()> {
    #[cfg(feature = "metrics")]
    BackupMetrics::global()?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .map_err(|e| {
            BackupError::observability(format!("Invalid log filter {default_directive:?}: {e}"))
        })?;

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let subscriber = TracingRegistry::default().with(filter).with(fmt_layer);

    set_global_default(subscriber).map_err(|e| {
        BackupError::observability(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("relsnap observability initialized");
    Ok(())
}

/// Initialize observability with default settings
pub fn init_default_observability() -> Result<()> {
    init_observability(false, DEFAULT_DIRECTIVE)
}
