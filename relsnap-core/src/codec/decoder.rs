/*!
Backup reader.
*/

use super::Frame;
use crate::compression::{CompressedReader, Compression};
use crate::header::{BackupHeader, RecordDigest, BACKUP_FORMAT_VERSION};
use crate::{BackupError, RelationshipRecord, Result, ZedToken};
use std::io::{BufRead, BufReader, Read};
use tracing::debug;

/// Streaming backup reader
///
/// The header is parsed on construction; relationships are produced lazily,
/// one per call, and only the current line is held in memory.
pub struct Decoder<R: Read> {
    reader: BufReader<CompressedReader<R>>,
    header: BackupHeader,
    compression: Compression,
    digest: RecordDigest,
    line: String,
    finished: bool,
}

impl<R: Read> Decoder<R> {
    /// Open a backup stream, reading and checking its header
    pub fn new(reader: R) -> Result<Self> {
        let reader = CompressedReader::detect(reader)?;
        let compression = reader.compression();
        let mut reader = BufReader::new(reader);

        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(BackupError::invalid_format(
                "empty backup stream: missing header",
            ));
        }

        let header: BackupHeader = serde_json::from_str(line.trim_end())
            .map_err(|e| BackupError::invalid_format(format!("malformed header: {e}")))?;
        if !header.is_compatible() {
            return Err(BackupError::invalid_format(format!(
                "incompatible backup format {} version {} (current: {})",
                header.format, header.format_version, BACKUP_FORMAT_VERSION
            )));
        }

        debug!(
            compression = compression.algorithm_name(),
            zed_token = %header.zed_token,
            "opened backup stream"
        );

        Ok(Self {
            reader,
            header,
            compression,
            digest: RecordDigest::new(),
            line,
            finished: false,
        })
    }

    pub fn header(&self) -> &BackupHeader {
        &self.header
    }

    pub fn schema(&self) -> &str {
        &self.header.schema
    }

    pub fn zed_token(&self) -> &ZedToken {
        &self.header.zed_token
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Number of relationships decoded so far
    pub fn records_read(&self) -> u64 {
        self.digest.count()
    }

    /// Decode the next relationship
    ///
    /// Returns `Ok(None)` once the end marker has been read and verified, and
    /// on every call after that. A stream that stops before the end marker,
    /// or whose marker disagrees with the records read, is an error.
    pub fn next_relationship(&mut self) -> Result<Option<RelationshipRecord>> {
        if self.finished {
            return Ok(None);
        }
        let next = self.read_frame();
        if !matches!(next, Ok(Some(_))) {
            self.finished = true;
        }
        next
    }

    fn read_frame(&mut self) -> Result<Option<RelationshipRecord>> {
        self.line.clear();
        if self.reader.read_line(&mut self.line)? == 0 || !self.line.ends_with('\n') {
            return Err(BackupError::invalid_format(format!(
                "backup stream ended after {} relationships without an end marker",
                self.digest.count()
            )));
        }

        let frame: Frame = serde_json::from_str(self.line.trim_end()).map_err(|e| {
            BackupError::invalid_format(format!(
                "malformed frame after {} relationships: {e}",
                self.digest.count()
            ))
        })?;

        match frame {
            Frame::Relationship(relationship) => {
                relationship.validate()?;
                self.digest.update(self.line.as_bytes());
                Ok(Some(relationship))
            }
            Frame::End { count, sha256 } => {
                self.digest.verify(count, &sha256)?;

                self.line.clear();
                if self.reader.read_line(&mut self.line)? != 0 {
                    return Err(BackupError::invalid_format(
                        "unexpected data after the end marker",
                    ));
                }

                debug!(relationships = count, "reached end of backup stream");
                Ok(None)
            }
        }
    }
}

impl<R: Read> Iterator for Decoder<R> {
    type Item = Result<RelationshipRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_relationship().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Encoder;

    fn sample() -> Vec<RelationshipRecord> {
        vec![
            "document:readme#viewer@user:alice".parse().unwrap(),
            "document:readme#editor@group:eng#member".parse().unwrap(),
            r#"document:plan#viewer@user:*[business_hours:{"tz":"UTC"}]"#
                .parse()
                .unwrap(),
        ]
    }

    fn encode(compression: Compression, records: &[RelationshipRecord]) -> Vec<u8> {
        let header = BackupHeader::new(
            "definition user {}\n\ndefinition document {\n  relation viewer: user\n}",
            ZedToken::new("GhUKEzE2"),
        );
        let mut encoder = Encoder::new(Vec::new(), &header, compression).unwrap();
        for record in records {
            encoder.append(record).unwrap();
        }
        encoder.close().unwrap()
    }

    #[test]
    fn test_roundtrip_preserves_order() {
        for compression in [Compression::Gzip, Compression::None] {
            let records = sample();
            let bytes = encode(compression, &records);

            let mut decoder = Decoder::new(&bytes[..]).unwrap();
            assert_eq!(decoder.compression(), compression);
            assert_eq!(decoder.zed_token().as_str(), "GhUKEzE2");
            assert!(decoder.schema().contains("relation viewer: user"));

            let decoded: Vec<RelationshipRecord> =
                decoder.by_ref().collect::<Result<_>>().unwrap();
            assert_eq!(decoded, records);
            assert_eq!(decoder.records_read(), 3);

            // Clean end is sticky
            assert!(decoder.next_relationship().unwrap().is_none());
        }
    }

    #[test]
    fn test_empty_backup() {
        let bytes = encode(Compression::Gzip, &[]);
        let mut decoder = Decoder::new(&bytes[..]).unwrap();
        assert!(decoder.next_relationship().unwrap().is_none());
    }

    #[test]
    fn test_truncated_stream_is_an_error() {
        let bytes = encode(Compression::None, &sample());
        let text = String::from_utf8(bytes).unwrap();
        let without_trailer: String = text
            .lines()
            .take(3)
            .map(|line| format!("{line}\n"))
            .collect();

        let mut decoder = Decoder::new(without_trailer.as_bytes()).unwrap();
        assert!(decoder.next_relationship().unwrap().is_some());
        assert!(decoder.next_relationship().unwrap().is_some());
        let err = decoder.next_relationship().unwrap_err();
        assert!(matches!(err, BackupError::InvalidFormat(_)));
        assert!(err.to_string().contains("without an end marker"));
    }

    #[test]
    fn test_line_cut_mid_record_is_an_error() {
        let bytes = encode(Compression::None, &sample());
        let cut = &bytes[..bytes.len() / 2];

        let results: Vec<Result<RelationshipRecord>> = Decoder::new(cut).unwrap().collect();
        assert!(results.last().unwrap().is_err());
    }

    #[test]
    fn test_tampered_record_fails_integrity() {
        let bytes = encode(Compression::None, &sample());
        let tampered = String::from_utf8(bytes).unwrap().replace("alice", "mallory");

        let result: Result<Vec<RelationshipRecord>> =
            Decoder::new(tampered.as_bytes()).unwrap().collect();
        assert!(matches!(
            result,
            Err(BackupError::IntegrityCheckFailed { .. })
        ));
    }

    #[test]
    fn test_trailing_data_is_rejected() {
        let mut bytes = encode(Compression::None, &sample());
        bytes.extend_from_slice(b"{\"kind\":\"end\",\"count\":0,\"sha256\":\"\"}\n");

        let result: Result<Vec<RelationshipRecord>> = Decoder::new(&bytes[..]).unwrap().collect();
        assert!(matches!(result, Err(BackupError::InvalidFormat(_))));
    }

    #[test]
    fn test_bad_headers() {
        assert!(matches!(
            Decoder::new(&b""[..]),
            Err(BackupError::InvalidFormat(_))
        ));
        assert!(matches!(
            Decoder::new(&b"not json\n"[..]),
            Err(BackupError::InvalidFormat(_))
        ));

        let mut header = BackupHeader::new("", ZedToken::new("t"));
        header.format_version = BACKUP_FORMAT_VERSION + 1;
        let line = format!("{}\n", serde_json::to_string(&header).unwrap());
        assert!(matches!(
            Decoder::new(line.as_bytes()),
            Err(BackupError::InvalidFormat(_))
        ));
    }
}
