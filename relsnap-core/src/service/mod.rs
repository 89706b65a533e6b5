/*!
Service port for the remote permission system.

This module defines the abstraction the orchestrators talk to. Network
clients live outside this crate; [`MemoryService`] is a transactional
in-memory implementation used for tests and local tooling.
*/

pub mod memory;

pub use memory::{Fault, MemoryService, MemoryStats};

use crate::{RelationshipRecord, ZedToken};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Status codes reported by the service, mirroring gRPC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Canceled => "Canceled",
            StatusCode::Unknown => "Unknown",
            StatusCode::InvalidArgument => "InvalidArgument",
            StatusCode::DeadlineExceeded => "DeadlineExceeded",
            StatusCode::NotFound => "NotFound",
            StatusCode::AlreadyExists => "AlreadyExists",
            StatusCode::PermissionDenied => "PermissionDenied",
            StatusCode::ResourceExhausted => "ResourceExhausted",
            StatusCode::FailedPrecondition => "FailedPrecondition",
            StatusCode::Aborted => "Aborted",
            StatusCode::OutOfRange => "OutOfRange",
            StatusCode::Unimplemented => "Unimplemented",
            StatusCode::Internal => "Internal",
            StatusCode::Unavailable => "Unavailable",
            StatusCode::DataLoss => "DataLoss",
            StatusCode::Unauthenticated => "Unauthenticated",
        };
        f.write_str(name)
    }
}

/// Error returned by any service call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct ServiceError {
    pub code: StatusCode,
    pub message: String,
}

impl ServiceError {
    pub fn new<S: Into<String>>(code: StatusCode, message: S) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn canceled<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::Canceled, message)
    }

    pub fn already_exists<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::AlreadyExists, message)
    }

    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    pub fn deadline_exceeded<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::DeadlineExceeded, message)
    }

    /// Errors from older service versions arrive as plain text
    pub fn unknown<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::Unknown, message)
    }
}

/// Result of a single-read schema fetch
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaSnapshot {
    pub schema: String,
    /// Revision the schema was read at; exports must be pinned to it
    pub zed_token: ZedToken,
}

/// One page of an export
#[derive(Debug, Clone, PartialEq)]
pub struct ExportPage {
    pub relationships: Vec<RelationshipRecord>,
    /// Resume position after this page
    pub cursor: Option<String>,
}

/// Server-side stream of relationships at a fixed snapshot
#[async_trait]
pub trait RelationshipExport: Send {
    /// Next page, or `None` once the export is complete
    async fn next_page(&mut self) -> Result<Option<ExportPage>, ServiceError>;
}

/// Client-side bulk import stream with close-to-commit semantics
///
/// Sent batches are buffered by the service; nothing is visible until
/// [`ImportStream::close_and_receive`] commits them atomically. Per-element
/// failures are only reported by the commit.
#[async_trait]
pub trait ImportStream: Send {
    async fn send(&mut self, batch: &[RelationshipRecord]) -> Result<(), ServiceError>;

    /// Commit everything sent on this stream, returning the number written
    async fn close_and_receive(self: Box<Self>) -> Result<u64, ServiceError>;
}

/// Operations the orchestrators need from the permission service
#[async_trait]
pub trait PermissionsService: Send + Sync {
    /// Read the current schema together with the revision it was read at
    async fn read_schema(&self) -> Result<SchemaSnapshot, ServiceError>;

    async fn write_schema(&self, schema: &str) -> Result<(), ServiceError>;

    /// Export every relationship as of `at`, optionally resuming after `cursor`
    async fn export_relationships(
        &self,
        at: &ZedToken,
        cursor: Option<String>,
        page_limit: u32,
    ) -> Result<Box<dyn RelationshipExport>, ServiceError>;

    /// Open a transactional bulk import stream
    async fn open_import(&self) -> Result<Box<dyn ImportStream>, ServiceError>;

    /// Non-transactional create-or-update of each relationship
    async fn touch_relationships(
        &self,
        relationships: &[RelationshipRecord],
    ) -> Result<(), ServiceError>;
}
