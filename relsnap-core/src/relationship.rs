/*!
Relationship records and snapshot tokens.
*/

use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Subject relation meaning "the object itself".
pub const ELLIPSIS: &str = "...";

/// Object id matching every object of a subject type.
pub const WILDCARD_ID: &str = "*";

/// Opaque consistency token pinning reads to one point in time
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ZedToken(String);

impl ZedToken {
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ZedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One edge of the relationship graph
///
/// The canonical text form is
/// `resource_type:resource_id#relation@subject_type:subject_id[#subject_relation][[caveat[:{context}]]]`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RelationshipRecord {
    pub resource_type: String,
    pub resource_id: String,
    pub relation: String,
    pub subject_type: String,
    pub subject_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_relation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caveat_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caveat_context: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Identity of a relationship; the caveat is not part of it.
pub type RelationshipKey = (String, String, String, String, String, Option<String>);

impl RelationshipRecord {
    /// Create an uncaveated relationship to a subject object
    pub fn new<S1, S2, S3, S4, S5>(
        resource_type: S1,
        resource_id: S2,
        relation: S3,
        subject_type: S4,
        subject_id: S5,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
        S4: Into<String>,
        S5: Into<String>,
    {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            relation: relation.into(),
            subject_type: subject_type.into(),
            subject_id: subject_id.into(),
            subject_relation: None,
            caveat_name: None,
            caveat_context: None,
        }
    }

    pub fn with_subject_relation<S: Into<String>>(mut self, relation: S) -> Self {
        self.subject_relation = Some(relation.into());
        self
    }

    pub fn with_caveat<S: Into<String>>(
        mut self,
        name: S,
        context: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Self {
        self.caveat_name = Some(name.into());
        self.caveat_context = context;
        self
    }

    pub fn key(&self) -> RelationshipKey {
        (
            self.resource_type.clone(),
            self.resource_id.clone(),
            self.relation.clone(),
            self.subject_type.clone(),
            self.subject_id.clone(),
            self.subject_relation
                .clone()
                .filter(|relation| relation != ELLIPSIS),
        )
    }

    /// Validate that all required fields are set
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("resource_type", &self.resource_type),
            ("resource_id", &self.resource_id),
            ("relation", &self.relation),
            ("subject_type", &self.subject_type),
            ("subject_id", &self.subject_id),
        ];
        for (field, value) in required {
            if value.is_empty() {
                return Err(BackupError::validation(format!(
                    "relationship {field} cannot be empty"
                )));
            }
        }
        if self.caveat_context.is_some() && self.caveat_name.is_none() {
            return Err(BackupError::validation(
                "relationship caveat context requires a caveat name",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for RelationshipRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}#{}@{}:{}",
            self.resource_type, self.resource_id, self.relation, self.subject_type, self.subject_id
        )?;
        if let Some(relation) = &self.subject_relation {
            if relation != ELLIPSIS {
                write!(f, "#{relation}")?;
            }
        }
        if let Some(caveat) = &self.caveat_name {
            write!(f, "[{caveat}")?;
            if let Some(context) = &self.caveat_context {
                let json = serde_json::to_string(context).map_err(|_| fmt::Error)?;
                write!(f, ":{json}")?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}

impl FromStr for RelationshipRecord {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || BackupError::validation(format!("invalid relationship: {s:?}"));

        let (resource, rest) = s.trim().split_once('@').ok_or_else(invalid)?;
        let (object, relation) = resource.split_once('#').ok_or_else(invalid)?;
        let (resource_type, resource_id) = object.split_once(':').ok_or_else(invalid)?;

        let (subject, caveat) = match rest.find('[') {
            Some(start) => {
                let body = rest[start + 1..].strip_suffix(']').ok_or_else(invalid)?;
                (&rest[..start], Some(body))
            }
            None => (rest, None),
        };

        let (subject_object, subject_relation) = match subject.split_once('#') {
            Some((object, relation)) => (object, Some(relation.to_string())),
            None => (subject, None),
        };
        let (subject_type, subject_id) = subject_object.split_once(':').ok_or_else(invalid)?;

        let mut record = RelationshipRecord::new(
            resource_type,
            resource_id,
            relation,
            subject_type,
            subject_id,
        );
        record.subject_relation = subject_relation;

        if let Some(caveat) = caveat {
            let (name, context) = match caveat.split_once(':') {
                Some((name, json)) => {
                    let context: serde_json::Map<String, serde_json::Value> =
                        serde_json::from_str(json)?;
                    (name, Some(context))
                }
                None => (caveat, None),
            };
            record = record.with_caveat(name, context);
        }

        record.validate().map_err(|_| invalid())?;
        Ok(record)
    }
}
