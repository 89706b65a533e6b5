/*!
Structure-preserving redaction of backups.

A [`Redactor`] reads a backup and writes a copy in which definition, caveat
and relation names are replaced by counters (`def0`, `cav0`, `rel0`, ...) and
object ids by salted hashes. The same original always maps to the same
pseudonym within one run, so the relationship graph keeps its shape and the
redacted schema still describes the redacted relationships.
*/

use crate::codec::{Decoder, Encoder};
use crate::relationship::{ELLIPSIS, WILDCARD_ID};
use crate::schema_text::{tokenize, Token, TokenKind};
use crate::{Compression, RelationshipRecord, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use tracing::{debug, info};

/// Hex characters kept from each object id digest
const OBJECT_ID_HEX_LEN: usize = 32;

/// Which labels to redact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionOptions {
    /// Definition and caveat names
    pub redact_definitions: bool,
    /// Relation and permission names
    pub redact_relations: bool,
    pub redact_object_ids: bool,
    /// Keep the original to pseudonym mapping of object ids in the map
    pub record_object_ids: bool,
}

impl Default for RedactionOptions {
    fn default() -> Self {
        Self {
            redact_definitions: true,
            redact_relations: true,
            redact_object_ids: true,
            record_object_ids: false,
        }
    }
}

/// Counter-based pseudonyms for one category of names
#[derive(Debug, Clone)]
struct NameMap {
    prefix: &'static str,
    names: BTreeMap<String, String>,
}

impl NameMap {
    fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            names: BTreeMap::new(),
        }
    }

    fn pseudonym(&mut self, original: &str) -> String {
        if let Some(existing) = self.names.get(original) {
            return existing.clone();
        }
        let pseudonym = format!("{}{}", self.prefix, self.names.len());
        self.names.insert(original.to_string(), pseudonym.clone());
        pseudonym
    }

    fn sorted(&self) -> Vec<(&str, &str)> {
        self.names
            .iter()
            .map(|(original, pseudonym)| (original.as_str(), pseudonym.as_str()))
            .collect()
    }
}

/// Mapping from original labels to pseudonyms built up during one run
#[derive(Debug, Clone)]
pub struct RedactionMap {
    options: RedactionOptions,
    definitions: NameMap,
    caveats: NameMap,
    relations: NameMap,
    salt: String,
    object_ids: BTreeMap<String, String>,
}

impl RedactionMap {
    /// Create an empty map with a fresh random object id salt
    pub fn new(options: RedactionOptions) -> Self {
        Self::with_salt(options, uuid::Uuid::new_v4().to_string())
    }

    /// Create an empty map with a fixed object id salt
    pub fn with_salt<S: Into<String>>(options: RedactionOptions, salt: S) -> Self {
        Self {
            options,
            definitions: NameMap::new("def"),
            caveats: NameMap::new("cav"),
            relations: NameMap::new("rel"),
            salt: salt.into(),
            object_ids: BTreeMap::new(),
        }
    }

    pub fn options(&self) -> &RedactionOptions {
        &self.options
    }

    /// Definition names seen so far, sorted by original name
    pub fn definitions(&self) -> Vec<(&str, &str)> {
        self.definitions.sorted()
    }

    pub fn caveats(&self) -> Vec<(&str, &str)> {
        self.caveats.sorted()
    }

    pub fn relations(&self) -> Vec<(&str, &str)> {
        self.relations.sorted()
    }

    /// Object ids seen so far, or `None` unless recording was requested
    pub fn object_ids(&self) -> Option<Vec<(&str, &str)>> {
        self.options.record_object_ids.then(|| {
            self.object_ids
                .iter()
                .map(|(original, pseudonym)| (original.as_str(), pseudonym.as_str()))
                .collect()
        })
    }

    fn definition(&mut self, name: &str) -> String {
        if self.options.redact_definitions {
            self.definitions.pseudonym(name)
        } else {
            name.to_string()
        }
    }

    fn caveat(&mut self, name: &str) -> String {
        if self.options.redact_definitions {
            self.caveats.pseudonym(name)
        } else {
            name.to_string()
        }
    }

    fn relation(&mut self, name: &str) -> String {
        if self.options.redact_relations && name != ELLIPSIS {
            self.relations.pseudonym(name)
        } else {
            name.to_string()
        }
    }

    fn object_id(&mut self, id: &str) -> String {
        if !self.options.redact_object_ids || id == WILDCARD_ID {
            return id.to_string();
        }

        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(id.as_bytes());
        let mut pseudonym = format!("{:x}", hasher.finalize());
        pseudonym.truncate(OBJECT_ID_HEX_LEN);

        if self.options.record_object_ids {
            self.object_ids
                .entry(id.to_string())
                .or_insert_with(|| pseudonym.clone());
        }
        pseudonym
    }

    /// Rename every label of a relationship
    ///
    /// Caveat contexts are carried over unchanged.
    pub fn redact_relationship(&mut self, relationship: RelationshipRecord) -> RelationshipRecord {
        RelationshipRecord {
            resource_type: self.definition(&relationship.resource_type),
            resource_id: self.object_id(&relationship.resource_id),
            relation: self.relation(&relationship.relation),
            subject_type: self.definition(&relationship.subject_type),
            subject_id: self.object_id(&relationship.subject_id),
            subject_relation: relationship
                .subject_relation
                .as_deref()
                .map(|relation| self.relation(relation)),
            caveat_name: relationship
                .caveat_name
                .as_deref()
                .map(|caveat| self.caveat(caveat)),
            caveat_context: relationship.caveat_context,
        }
    }

    /// Rename the declared and referenced names of a schema
    ///
    /// Comments are dropped. Caveat parameters and expressions are kept as
    /// written since they do not name anything in the relationship graph.
    ///
    /// # Example
    /// ```rust
    /// use relsnap_core::{RedactionMap, RedactionOptions};
    ///
    /// let mut map = RedactionMap::new(RedactionOptions::default());
    /// let schema = "definition user {}\ndefinition doc {\n  relation viewer: user\n}";
    /// assert_eq!(
    ///     map.redact_schema(schema),
    ///     "definition def0 {}\ndefinition def1 {\n  relation rel0: def0\n}\n"
    /// );
    /// ```
    pub fn redact_schema(&mut self, schema: &str) -> String {
        let mut out = String::with_capacity(schema.len());
        let mut scope = Scope::Top;
        let mut prev: Option<Token<'_>> = None;

        for token in tokenize(schema) {
            match token.kind {
                TokenKind::Comment => {
                    if !out.is_empty() && !out.ends_with(char::is_whitespace) {
                        out.push(' ');
                    }
                    continue;
                }
                TokenKind::Whitespace => {
                    out.push_str(token.text);
                    continue;
                }
                _ => {}
            }

            let text = self.schema_token(&mut scope, prev.as_ref(), &token);
            out.push_str(&text);
            prev = Some(token);
        }

        let mut tidy: String = out
            .trim()
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n");
        if !tidy.is_empty() {
            tidy.push('\n');
        }
        tidy
    }

    fn schema_token<'t>(
        &mut self,
        scope: &mut Scope,
        prev: Option<&Token<'_>>,
        token: &Token<'t>,
    ) -> Cow<'t, str> {
        let keep = Cow::Borrowed(token.text);

        match scope {
            Scope::Top => {
                if token.is_ident("definition") {
                    *scope = Scope::DefinitionName;
                } else if token.is_ident("caveat") {
                    *scope = Scope::CaveatName;
                }
                keep
            }
            Scope::DefinitionName => {
                if token.kind == TokenKind::Ident {
                    *scope = Scope::Definition {
                        depth: 0,
                        item: Item::None,
                    };
                    Cow::Owned(self.definition(token.text))
                } else {
                    *scope = Scope::Top;
                    keep
                }
            }
            Scope::CaveatName => {
                if token.kind == TokenKind::Ident {
                    *scope = Scope::Caveat {
                        depth: 0,
                        opened: false,
                    };
                    Cow::Owned(self.caveat(token.text))
                } else {
                    *scope = Scope::Top;
                    keep
                }
            }
            Scope::Caveat { depth, opened } => {
                if token.is_punct('{') {
                    *depth += 1;
                    *opened = true;
                } else if token.is_punct('}') {
                    *depth = depth.saturating_sub(1);
                    if *opened && *depth == 0 {
                        *scope = Scope::Top;
                    }
                }
                keep
            }
            Scope::Definition { depth, item } => {
                if token.is_punct('{') {
                    *depth += 1;
                    return keep;
                }
                if token.is_punct('}') {
                    *depth = depth.saturating_sub(1);
                    if *depth == 0 {
                        *scope = Scope::Top;
                    }
                    return keep;
                }
                if token.is_punct(';') {
                    *item = Item::None;
                    return keep;
                }
                if token.kind != TokenKind::Ident {
                    return keep;
                }

                if token.is_ident("relation") {
                    *item = Item::RelationName;
                    return keep;
                }
                if token.is_ident("permission") {
                    *item = Item::PermissionName;
                    return keep;
                }

                match *item {
                    Item::RelationName => {
                        *item = Item::RelationTypes;
                        Cow::Owned(self.relation(token.text))
                    }
                    Item::PermissionName => {
                        *item = Item::PermissionExpr;
                        Cow::Owned(self.relation(token.text))
                    }
                    Item::RelationTypes => self.type_reference(prev, token),
                    Item::PermissionExpr => {
                        let after_dot = prev.is_some_and(|p| p.is_punct('.'));
                        if token.is_ident("nil")
                            || (after_dot && (token.is_ident("any") || token.is_ident("all")))
                        {
                            keep
                        } else {
                            Cow::Owned(self.relation(token.text))
                        }
                    }
                    Item::None => keep,
                }
            }
        }
    }

    /// Identifiers in `relation name: type | type:* | type#rel with caveat`
    fn type_reference<'t>(&mut self, prev: Option<&Token<'_>>, token: &Token<'t>) -> Cow<'t, str> {
        if token.is_ident("with") || token.is_ident("and") {
            return Cow::Borrowed(token.text);
        }
        let Some(prev) = prev else {
            return Cow::Borrowed(token.text);
        };

        if prev.is_punct(':') || prev.is_punct('|') {
            Cow::Owned(self.definition(token.text))
        } else if prev.is_punct('#') {
            Cow::Owned(self.relation(token.text))
        } else if (prev.is_ident("with") || prev.is_ident("and")) && token.text != "expiration" {
            Cow::Owned(self.caveat(token.text))
        } else {
            Cow::Borrowed(token.text)
        }
    }
}

/// Position of the schema walker
enum Scope {
    Top,
    DefinitionName,
    Definition { depth: usize, item: Item },
    CaveatName,
    Caveat { depth: usize, opened: bool },
}

/// Current declaration inside a definition body
enum Item {
    None,
    RelationName,
    RelationTypes,
    PermissionName,
    PermissionExpr,
}

/// Streams a backup through a [`RedactionMap`] into a new backup
///
/// The schema is redacted when the redactor is created; every call to
/// [`Redactor::redact_next`] then moves one relationship from the decoder to
/// the encoder.
pub struct Redactor<R: Read, W: Write> {
    decoder: Decoder<R>,
    encoder: Encoder<W>,
    map: RedactionMap,
}

impl<R: Read, W: Write> Redactor<R, W> {
    /// Start redacting `decoder` into `writer`
    ///
    /// # Arguments
    /// * `decoder` - Source backup, header already read
    /// * `writer` - Destination for the redacted backup
    /// * `options` - Which labels to rename
    /// * `compression` - Compression of the redacted backup
    pub fn new(
        decoder: Decoder<R>,
        writer: W,
        options: RedactionOptions,
        compression: Compression,
    ) -> Result<Self> {
        Self::with_map(decoder, writer, RedactionMap::new(options), compression)
    }

    /// Start redacting with a caller-provided map
    pub fn with_map(
        decoder: Decoder<R>,
        writer: W,
        mut map: RedactionMap,
        compression: Compression,
    ) -> Result<Self> {
        let schema = map.redact_schema(decoder.schema());
        let header = decoder.header().clone().with_schema(schema);
        let encoder = Encoder::new(writer, &header, compression)?;

        debug!(
            definitions = map.definitions.names.len(),
            caveats = map.caveats.names.len(),
            relations = map.relations.names.len(),
            "redacted schema"
        );

        Ok(Self {
            decoder,
            encoder,
            map,
        })
    }

    /// Redact the next relationship, returning the redacted record
    ///
    /// Returns `Ok(None)` once the source backup is exhausted.
    pub fn redact_next(&mut self) -> Result<Option<RelationshipRecord>> {
        let Some(relationship) = self.decoder.next_relationship()? else {
            return Ok(None);
        };
        let redacted = self.map.redact_relationship(relationship);
        self.encoder.append(&redacted)?;
        Ok(Some(redacted))
    }

    pub fn records_redacted(&self) -> u64 {
        self.encoder.records_written()
    }

    pub fn map(&self) -> &RedactionMap {
        &self.map
    }

    /// Redact whatever is left, close the output and return it with the map
    pub fn finish(mut self) -> Result<(W, RedactionMap)> {
        while self.redact_next()?.is_some() {}

        let count = self.encoder.records_written();
        let writer = self.encoder.close()?;
        info!(relationships = count, "redaction complete");
        Ok((writer, self.map))
    }
}
