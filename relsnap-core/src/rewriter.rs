/*!
Rewriters applied to schema text and relationships on their way into or out
of a backup.

A rewriter may return `None` for a relationship to exclude it; orchestrators
count every exclusion.
*/

use crate::schema_text::{top_level_blocks, BlockKind};
use crate::{BackupError, RelationshipRecord, Result};

/// Transform applied to backup contents
#[cfg_attr(test, mockall::automock)]
pub trait Rewriter: Send + Sync {
    /// Rewrite the schema text
    fn rewrite_schema(&self, schema: &str) -> Result<String>;

    /// Rewrite a relationship, or return `None` to exclude it
    fn rewrite_relationship(&self, relationship: RelationshipRecord)
        -> Result<Option<RelationshipRecord>>;
}

/// Identity rewriter
#[derive(Debug, Clone, Default)]
pub struct NoopRewriter;

impl Rewriter for NoopRewriter {
    fn rewrite_schema(&self, schema: &str) -> Result<String> {
        Ok(schema.to_string())
    }

    fn rewrite_relationship(
        &self,
        relationship: RelationshipRecord,
    ) -> Result<Option<RelationshipRecord>> {
        Ok(Some(relationship))
    }
}

/// Keeps only the definitions, caveats and relationships of one prefix
///
/// Other top-level statements of the schema are kept as they are. A
/// relationship is kept when both its resource type and its subject type
/// live under the prefix.
///
/// # Example
/// ```rust
/// use relsnap_core::{PrefixFilter, Rewriter};
///
/// let filter = PrefixFilter::new("tenant1")?;
/// let schema = "definition tenant1/user {}\ndefinition tenant2/user {}";
/// assert_eq!(filter.rewrite_schema(schema)?, "definition tenant1/user {}\n");
/// # Ok::<(), relsnap_core::BackupError>(())
/// ```
#[derive(Debug, Clone)]
pub struct PrefixFilter {
    prefix: String,
}

impl PrefixFilter {
    /// Create a filter for `prefix`; a trailing `/` is optional
    pub fn new<S: AsRef<str>>(prefix: S) -> Result<Self> {
        let trimmed = prefix.as_ref().trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(BackupError::validation("prefix filter cannot be empty"));
        }
        Ok(Self {
            prefix: format!("{trimmed}/"),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn matches(&self, name: &str) -> bool {
        name.starts_with(&self.prefix)
    }
}

impl Rewriter for PrefixFilter {
    fn rewrite_schema(&self, schema: &str) -> Result<String> {
        let kept: Vec<&str> = top_level_blocks(schema)
            .into_iter()
            .filter(|block| block.kind == BlockKind::Directive || self.matches(block.name))
            .map(|block| block.text)
            .collect();

        let mut out = kept.join("\n\n");
        if !out.is_empty() {
            out.push('\n');
        }
        Ok(out)
    }

    fn rewrite_relationship(
        &self,
        relationship: RelationshipRecord,
    ) -> Result<Option<RelationshipRecord>> {
        if self.matches(&relationship.resource_type) && self.matches(&relationship.subject_type) {
            Ok(Some(relationship))
        } else {
            Ok(None)
        }
    }
}

/// Applies several rewriters in order
///
/// The first exclusion wins; later rewriters never see excluded relationships.
#[derive(Default)]
pub struct ChainRewriter {
    rewriters: Vec<Box<dyn Rewriter>>,
}

impl ChainRewriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R: Rewriter + 'static>(mut self, rewriter: R) -> Self {
        self.rewriters.push(Box::new(rewriter));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rewriters.is_empty()
    }
}

impl Rewriter for ChainRewriter {
    fn rewrite_schema(&self, schema: &str) -> Result<String> {
        let mut schema = schema.to_string();
        for rewriter in &self.rewriters {
            schema = rewriter.rewrite_schema(&schema)?;
        }
        Ok(schema)
    }

    fn rewrite_relationship(
        &self,
        relationship: RelationshipRecord,
    ) -> Result<Option<RelationshipRecord>> {
        let mut current = relationship;
        for rewriter in &self.rewriters {
            match rewriter.rewrite_relationship(current)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }
}
