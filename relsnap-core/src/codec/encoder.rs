/*!
Backup writer.
*/

use super::FrameRef;
use crate::compression::{CompressedWriter, Compression};
use crate::header::{BackupHeader, RecordDigest};
use crate::{BackupError, RelationshipRecord, Result};
use std::io::{BufWriter, Write};

/// Streaming backup writer
///
/// The header is written on construction, relationships are appended one at
/// a time and [`Encoder::close`] writes the end marker. Nothing is ever
/// rewritten, so the output may be a pipe.
///
/// # Example
/// ```rust
/// use relsnap_core::{BackupHeader, Compression, Encoder, RelationshipRecord, ZedToken};
///
/// let header = BackupHeader::new("definition user {}", ZedToken::new("GhUKEzE2"));
/// let mut encoder = Encoder::new(Vec::new(), &header, Compression::Gzip)?;
/// encoder.append(&"document:readme#viewer@user:alice".parse::<RelationshipRecord>()?)?;
/// let bytes = encoder.close()?;
/// assert!(!bytes.is_empty());
/// # Ok::<(), relsnap_core::BackupError>(())
/// ```
pub struct Encoder<W: Write> {
    sink: CompressedWriter<BufWriter<W>>,
    digest: RecordDigest,
    compression: Compression,
    line: Vec<u8>,
}

impl<W: Write> Encoder<W> {
    /// Start a backup on `writer`, writing the header immediately
    pub fn new(writer: W, header: &BackupHeader, compression: Compression) -> Result<Self> {
        header.validate()?;

        let mut sink = compression.writer(BufWriter::new(writer));
        serde_json::to_writer(&mut sink, header)?;
        sink.write_all(b"\n")?;

        Ok(Self {
            sink,
            digest: RecordDigest::new(),
            compression,
            line: Vec::with_capacity(256),
        })
    }

    /// Append one relationship
    pub fn append(&mut self, relationship: &RelationshipRecord) -> Result<()> {
        relationship.validate()?;

        self.line.clear();
        serde_json::to_writer(&mut self.line, &FrameRef::Relationship(relationship))?;
        self.line.push(b'\n');

        self.sink.write_all(&self.line)?;
        self.digest.update(&self.line);
        Ok(())
    }

    /// Number of relationships appended so far
    pub fn records_written(&self) -> u64 {
        self.digest.count()
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Write the end marker, flush everything and return the writer
    ///
    /// Callers writing to files should `sync_all` the returned handle before
    /// treating the backup as durable.
    pub fn close(mut self) -> Result<W> {
        let sha256 = self.digest.hex();
        serde_json::to_writer(
            &mut self.sink,
            &FrameRef::End {
                count: self.digest.count(),
                sha256: &sha256,
            },
        )?;
        self.sink.write_all(b"\n")?;

        let buffered = self.sink.finish()?;
        let writer = buffered
            .into_inner()
            .map_err(|e| BackupError::Io(e.into_error()))?;
        Ok(writer)
    }
}
