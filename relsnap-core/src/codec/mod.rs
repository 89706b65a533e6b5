/*!
Streaming backup container.

A backup is a sequence of newline-delimited JSON frames, optionally gzip
compressed: one header, any number of relationship frames and a trailer that
marks the clean end of the stream and carries the relationship count and the
SHA-256 of every relationship frame.
*/

pub mod decoder;
pub mod encoder;

pub use decoder::Decoder;
pub use encoder::Encoder;

use crate::RelationshipRecord;
use serde::{Deserialize, Serialize};

/// Frames following the header, as read back
#[derive(Deserialize, Debug)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum Frame {
    Relationship(RelationshipRecord),
    End { count: u64, sha256: String },
}

/// Frames following the header, as written
#[derive(Serialize, Debug)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum FrameRef<'a> {
    Relationship(&'a RelationshipRecord),
    End { count: u64, sha256: &'a str },
}
