/*!
Backup header: the schema and snapshot token written before any relationship.
*/

use crate::{BackupError, Result, ZedToken};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Name carried by every backup header
pub const BACKUP_FORMAT_NAME: &str = "relsnap";

/// Current container format version for compatibility tracking
pub const BACKUP_FORMAT_VERSION: u8 = 1;

/// First frame of every backup file
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackupHeader {
    /// Always [`BACKUP_FORMAT_NAME`]
    pub format: String,

    /// Format version for compatibility (current: 1)
    pub format_version: u8,

    /// Schema text as returned by the service
    pub schema: String,

    /// Snapshot token the relationships were exported at
    pub zed_token: ZedToken,

    /// When the backup was started
    pub created_at: DateTime<Utc>,
}

impl BackupHeader {
    /// Create a header for a backup taken now
    ///
    /// # Example
    /// ```rust
    /// use relsnap_core::{BackupHeader, ZedToken};
    ///
    /// let header = BackupHeader::new("definition user {}", ZedToken::new("GhUKEzE2"));
    /// assert!(header.validate().is_ok());
    /// ```
    pub fn new<S: Into<String>>(schema: S, zed_token: ZedToken) -> Self {
        Self {
            format: BACKUP_FORMAT_NAME.to_string(),
            format_version: BACKUP_FORMAT_VERSION,
            schema: schema.into(),
            zed_token,
            created_at: Utc::now(),
        }
    }

    /// Replace the schema text, keeping everything else
    pub fn with_schema<S: Into<String>>(mut self, schema: S) -> Self {
        self.schema = schema.into();
        self
    }

    /// Check if this header is compatible with the current format version
    pub fn is_compatible(&self) -> bool {
        self.format == BACKUP_FORMAT_NAME && self.format_version <= BACKUP_FORMAT_VERSION
    }

    /// Validate that all required fields are properly set
    pub fn validate(&self) -> Result<()> {
        if self.format != BACKUP_FORMAT_NAME {
            return Err(BackupError::validation(format!(
                "unexpected format name {:?}",
                self.format
            )));
        }
        if self.zed_token.is_empty() {
            return Err(BackupError::validation("zed_token cannot be empty"));
        }
        Ok(())
    }

    /// Generate a suggested filename for this backup
    ///
    /// Format: relsnap_{timestamp}.backup
    pub fn suggested_filename(&self) -> String {
        format!("relsnap_{}.backup", self.created_at.format("%Y%m%d_%H%M%S"))
    }
}

/// Running SHA-256 over relationship frames, reported in the trailer
#[derive(Debug, Clone, Default)]
pub struct RecordDigest {
    hasher: Sha256,
    count: u64,
}

impl RecordDigest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one serialized relationship frame, newline included
    pub fn update(&mut self, frame: &[u8]) {
        self.hasher.update(frame);
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Hexadecimal digest of everything seen so far
    pub fn hex(&self) -> String {
        format!("{:x}", self.hasher.clone().finalize())
    }

    /// Compare against the count and digest announced by a trailer
    pub fn verify(&self, count: u64, sha256: &str) -> Result<()> {
        if count != self.count {
            return Err(BackupError::IntegrityCheckFailed {
                expected: format!("{count} relationships"),
                actual: format!("{} relationships", self.count),
            });
        }
        let actual = self.hex();
        if actual != sha256 {
            return Err(BackupError::IntegrityCheckFailed {
                expected: sha256.to_string(),
                actual,
            });
        }
        Ok(())
    }
}
