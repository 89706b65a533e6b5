/*!
# relsnap Core Engine

Backup, restore and redaction of a permission service's schema and
relationship graph.

This crate provides:

- A streaming backup container (newline-delimited JSON, optionally gzip) with
  an integrity trailer
- Rewriters that filter or transform schema text and relationships
- Structure-preserving redaction of backups
- Snapshot-consistent backup creation with cursor resume
- Batched, transactional restore with conflict strategies and upsert replay

## Architecture

The orchestrators only talk to the service through the [`PermissionsService`]
port; network clients live outside this crate. [`MemoryService`] implements
the port in memory for tests and local tooling.

## Usage

```rust
use relsnap_core::{
    CreateConfig, CreateOrchestrator, Decoder, MemoryService, NoopRewriter, RestoreConfig,
    RestoreOrchestrator,
};

# tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
let source = MemoryService::new()
    .with_schema("definition user {}\n\ndefinition document {\n  relation viewer: user\n}")
    .with_relationships(["document:readme#viewer@user:alice".parse()?]);

// Back up
let create = CreateOrchestrator::new(source, NoopRewriter, CreateConfig::default());
let (backup, _) = create.run(Vec::new()).await?;

// Restore somewhere else
let target = MemoryService::new();
let restore = RestoreOrchestrator::new(target.clone(), NoopRewriter, RestoreConfig::default());
let stats = restore.restore(Decoder::new(&backup[..])?).await?;
assert_eq!(stats.written_relationships, 1);
assert_eq!(target.len(), 1);
# Ok::<(), relsnap_core::BackupError>(())
# }).unwrap();
```
*/

pub mod cancel;
pub mod classify;
pub mod codec;
pub mod compression;
pub mod config;
pub mod create;
pub mod error;
pub mod header;
pub mod observability;
pub mod redaction;
pub mod relationship;
pub mod restore;
pub mod rewriter;
pub mod schema_text;
pub mod service;


pub use cancel::CancellationToken;
pub use classify::{classify, ErrorClass};
pub use codec::{Decoder, Encoder};
pub use compression::Compression;
pub use config::{ConflictStrategy, CreateConfig, RestoreConfig};
pub use create::{CreateOrchestrator, CreateStats};
pub use error::{BackupError, Result};
pub use header::{BackupHeader, BACKUP_FORMAT_VERSION};
pub use redaction::{RedactionMap, RedactionOptions, Redactor};
pub use relationship::{RelationshipRecord, ZedToken};
pub use restore::{RestoreOrchestrator, RestoreStats};
pub use rewriter::{ChainRewriter, NoopRewriter, PrefixFilter, Rewriter};
pub use service::{
    ExportPage, Fault, ImportStream, MemoryService, MemoryStats, PermissionsService,
    RelationshipExport, SchemaSnapshot, ServiceError, StatusCode,
};

pub use relsnap_retry::RetryPolicy;
