/*!
In-memory permission service.

Commits are atomic and reject duplicates with `AlreadyExists`, touches are
idempotent upserts and exports are pinned to a revision. Faults can be queued
per call type to exercise the orchestrators' error handling.
*/

use super::{
    ExportPage, ImportStream, PermissionsService, RelationshipExport, SchemaSnapshot,
    ServiceError, StatusCode,
};
use crate::relationship::RelationshipKey;
use crate::{RelationshipRecord, ZedToken};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Outcome injected into the next call of a given kind
#[derive(Debug, Clone)]
pub enum Fault {
    /// Let the call through unchanged
    Pass,
    /// Fail the call with this error
    Fail(ServiceError),
    /// Never complete the call
    Hang,
}

/// Call counters, useful for asserting on orchestrator behaviour
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub schema_writes: u64,
    pub imports_opened: u64,
    pub sends: u64,
    /// Size of every batch received on an import stream, in order
    pub batch_sizes: Vec<usize>,
    pub commits: u64,
    pub failed_commits: u64,
    pub touch_calls: u64,
    pub export_pages: u64,
}

#[derive(Default)]
struct Faults {
    sends: VecDeque<Fault>,
    commits: VecDeque<Fault>,
    touches: VecDeque<Fault>,
    export_pages: VecDeque<Fault>,
    /// Written counts reported by the next successful commits
    commit_reports: VecDeque<u64>,
}

#[derive(Default)]
struct State {
    schema: String,
    revision: u64,
    relationships: BTreeMap<RelationshipKey, RelationshipRecord>,
    faults: Faults,
    stats: MemoryStats,
}

impl State {
    fn zed_token(&self) -> ZedToken {
        ZedToken::new(format!("rev-{}", self.revision))
    }
}

/// Transactional in-memory implementation of [`PermissionsService`]
#[derive(Clone, Default)]
pub struct MemoryService {
    state: Arc<Mutex<State>>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn apply(fault: Option<Fault>) -> Result<(), ServiceError> {
    match fault {
        None | Some(Fault::Pass) => Ok(()),
        Some(Fault::Fail(err)) => Err(err),
        Some(Fault::Hang) => futures::future::pending().await,
    }
}

impl MemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the schema without counting a schema write
    pub fn with_schema<S: Into<String>>(self, schema: S) -> Self {
        lock(&self.state).schema = schema.into();
        self
    }

    /// Seed relationships that exist before any import
    pub fn with_relationships<I>(self, relationships: I) -> Self
    where
        I: IntoIterator<Item = RelationshipRecord>,
    {
        {
            let mut state = lock(&self.state);
            for relationship in relationships {
                state.relationships.insert(relationship.key(), relationship);
            }
            state.revision += 1;
        }
        self
    }

    pub fn inject_send_faults<I: IntoIterator<Item = Fault>>(&self, faults: I) {
        lock(&self.state).faults.sends.extend(faults);
    }

    pub fn inject_commit_faults<I: IntoIterator<Item = Fault>>(&self, faults: I) {
        lock(&self.state).faults.commits.extend(faults);
    }

    /// Make the next successful commits report these written counts
    ///
    /// The relationships are still stored; only the reply is altered.
    pub fn inject_commit_reports<I: IntoIterator<Item = u64>>(&self, counts: I) {
        lock(&self.state).faults.commit_reports.extend(counts);
    }

    pub fn inject_touch_faults<I: IntoIterator<Item = Fault>>(&self, faults: I) {
        lock(&self.state).faults.touches.extend(faults);
    }

    pub fn inject_export_faults<I: IntoIterator<Item = Fault>>(&self, faults: I) {
        lock(&self.state).faults.export_pages.extend(faults);
    }

    pub fn schema(&self) -> String {
        lock(&self.state).schema.clone()
    }

    pub fn zed_token(&self) -> ZedToken {
        lock(&self.state).zed_token()
    }

    /// All stored relationships in key order
    pub fn relationships(&self) -> Vec<RelationshipRecord> {
        lock(&self.state).relationships.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).relationships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, relationship: &RelationshipRecord) -> bool {
        lock(&self.state)
            .relationships
            .contains_key(&relationship.key())
    }

    pub fn stats(&self) -> MemoryStats {
        lock(&self.state).stats.clone()
    }
}

#[async_trait]
impl PermissionsService for MemoryService {
    async fn read_schema(&self) -> Result<SchemaSnapshot, ServiceError> {
        let state = lock(&self.state);
        Ok(SchemaSnapshot {
            schema: state.schema.clone(),
            zed_token: state.zed_token(),
        })
    }

    async fn write_schema(&self, schema: &str) -> Result<(), ServiceError> {
        let mut state = lock(&self.state);
        state.schema = schema.to_string();
        state.revision += 1;
        state.stats.schema_writes += 1;
        Ok(())
    }

    async fn export_relationships(
        &self,
        at: &ZedToken,
        cursor: Option<String>,
        page_limit: u32,
    ) -> Result<Box<dyn RelationshipExport>, ServiceError> {
        if page_limit == 0 {
            return Err(ServiceError::new(
                StatusCode::InvalidArgument,
                "page limit must be positive",
            ));
        }
        let offset = match cursor {
            Some(cursor) => cursor.parse::<usize>().map_err(|_| {
                ServiceError::new(StatusCode::InvalidArgument, format!("bad cursor {cursor:?}"))
            })?,
            None => 0,
        };

        let state = lock(&self.state);
        if *at != state.zed_token() {
            return Err(ServiceError::new(
                StatusCode::FailedPrecondition,
                format!("revision {at} is no longer available"),
            ));
        }

        let snapshot: Vec<RelationshipRecord> = state.relationships.values().cloned().collect();
        Ok(Box::new(MemoryExport {
            state: Arc::clone(&self.state),
            snapshot,
            offset,
            page_limit: page_limit as usize,
        }))
    }

    async fn open_import(&self) -> Result<Box<dyn ImportStream>, ServiceError> {
        lock(&self.state).stats.imports_opened += 1;
        Ok(Box::new(MemoryImport {
            state: Arc::clone(&self.state),
            buffered: Vec::new(),
        }))
    }

    async fn touch_relationships(
        &self,
        relationships: &[RelationshipRecord],
    ) -> Result<(), ServiceError> {
        let fault = {
            let mut state = lock(&self.state);
            state.stats.touch_calls += 1;
            state.faults.touches.pop_front()
        };
        apply(fault).await?;

        let mut state = lock(&self.state);
        for relationship in relationships {
            state
                .relationships
                .insert(relationship.key(), relationship.clone());
        }
        state.revision += 1;
        Ok(())
    }
}

struct MemoryExport {
    state: Arc<Mutex<State>>,
    snapshot: Vec<RelationshipRecord>,
    offset: usize,
    page_limit: usize,
}

#[async_trait]
impl RelationshipExport for MemoryExport {
    async fn next_page(&mut self) -> Result<Option<ExportPage>, ServiceError> {
        let fault = {
            let mut state = lock(&self.state);
            state.stats.export_pages += 1;
            state.faults.export_pages.pop_front()
        };
        apply(fault).await?;

        if self.offset >= self.snapshot.len() {
            return Ok(None);
        }
        let end = (self.offset + self.page_limit).min(self.snapshot.len());
        let relationships = self.snapshot[self.offset..end].to_vec();
        self.offset = end;

        Ok(Some(ExportPage {
            relationships,
            cursor: Some(end.to_string()),
        }))
    }
}

struct MemoryImport {
    state: Arc<Mutex<State>>,
    buffered: Vec<RelationshipRecord>,
}

#[async_trait]
impl ImportStream for MemoryImport {
    async fn send(&mut self, batch: &[RelationshipRecord]) -> Result<(), ServiceError> {
        let fault = {
            let mut state = lock(&self.state);
            state.stats.sends += 1;
            state.faults.sends.pop_front()
        };
        apply(fault).await?;

        lock(&self.state).stats.batch_sizes.push(batch.len());
        self.buffered.extend_from_slice(batch);
        Ok(())
    }

    async fn close_and_receive(self: Box<Self>) -> Result<u64, ServiceError> {
        let fault = lock(&self.state).faults.commits.pop_front();
        if let Err(err) = apply(fault).await {
            lock(&self.state).stats.failed_commits += 1;
            return Err(err);
        }

        let mut state = lock(&self.state);
        let mut seen = HashSet::with_capacity(self.buffered.len());
        for relationship in &self.buffered {
            let key = relationship.key();
            if state.relationships.contains_key(&key) || !seen.insert(key) {
                state.stats.failed_commits += 1;
                return Err(ServiceError::already_exists(format!(
                    "duplicate relationship {relationship}"
                )));
            }
        }

        let written = self.buffered.len() as u64;
        let buffered = self.buffered;
        for relationship in buffered {
            state.relationships.insert(relationship.key(), relationship);
        }
        state.revision += 1;
        state.stats.commits += 1;
        debug!(written, revision = state.revision, "committed import");
        Ok(state.faults.commit_reports.pop_front().unwrap_or(written))
    }
}
