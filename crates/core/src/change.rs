//! Records of the append-only history: changes, change sets, commits and
//! the versions pointing into the commit graph.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::CoreError;
use crate::ids::*;

pub const DEFAULT_FILE_ID: &str = "sys";
pub const DEFAULT_PLUGIN_KEY: &str = "sys_entity";

/// Joins the parts of composite entity ids, including commit edges.
pub const ENTITY_ID_SEPARATOR: &str = "~";

/// Identity of one logical entity across its history.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
}

impl EntityKey {
    pub fn new(
        entity_id: impl Into<String>,
        schema_key: impl Into<String>,
        file_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            schema_key: schema_key.into(),
            file_id: file_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.schema_key, self.file_id, self.entity_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub file_id: String,
    pub plugin_key: String,
    /// `None` records a deletion.
    pub snapshot_content: Option<Value>,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl Change {
    pub fn new(
        key: &EntityKey,
        schema_version: impl Into<String>,
        plugin_key: impl Into<String>,
        snapshot_content: Option<Value>,
    ) -> Self {
        Self {
            id: ChangeId::new(),
            entity_id: key.entity_id.clone(),
            schema_key: key.schema_key.clone(),
            schema_version: schema_version.into(),
            file_id: key.file_id.clone(),
            plugin_key: plugin_key.into(),
            snapshot_content,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: Option<Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.schema_key, &self.file_id)
    }

    pub fn is_deletion(&self) -> bool {
        self.snapshot_content.is_none()
    }

    /// A fresh change deleting the same entity.
    pub fn deletion(&self) -> Self {
        Self::new(&self.key(), &self.schema_version, &self.plugin_key, None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetElement {
    pub change_set_id: ChangeSetId,
    pub change_id: ChangeId,
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
}

impl ChangeSetElement {
    pub fn for_change(change_set_id: &ChangeSetId, change: &Change) -> Self {
        Self {
            change_set_id: change_set_id.clone(),
            change_id: change.id.clone(),
            entity_id: change.entity_id.clone(),
            schema_key: change.schema_key.clone(),
            file_id: change.file_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    pub change_set_id: ChangeSetId,
    pub parent_commit_ids: Vec<CommitId>,
}

impl Commit {
    pub fn new(change_set_id: ChangeSetId, parent_commit_ids: Vec<CommitId>) -> Self {
        Self {
            id: CommitId::new(),
            change_set_id,
            parent_commit_ids,
        }
    }

    /// Snapshot stored by the commit's bookkeeping change.
    pub fn snapshot(&self) -> Value {
        json!({
            "id": self.id,
            "change_set_id": self.change_set_id,
            "parent_commit_ids": self.parent_commit_ids,
        })
    }

    pub fn from_snapshot(snapshot: &Value) -> Result<Self, CoreError> {
        Ok(serde_json::from_value(snapshot.clone())?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    pub name: String,
    pub commit_id: CommitId,
}

/// The change that wins for an entity when resolving a commit's ancestry.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafChange {
    pub change: Change,
    /// Commit whose change set supplied the change.
    pub commit_id: CommitId,
    pub depth: usize,
}

pub fn encode_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_timestamp(s: &str) -> Result<DateTime<Utc>, CoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::InvalidData(format!("bad timestamp '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deletion_keeps_identity() {
        let key = EntityKey::new("e1", "todo", "f");
        let change = Change::new(&key, "1.0", "plugin_a", Some(json!({"v": 1})));
        let deletion = change.deletion();
        assert_eq!(deletion.key(), key);
        assert_eq!(deletion.plugin_key, "plugin_a");
        assert!(deletion.is_deletion());
        assert_ne!(deletion.id, change.id);
    }

    #[test]
    fn commit_snapshot_round_trips() {
        let commit = Commit::new(
            ChangeSetId::from("cs"),
            vec![CommitId::from("a"), CommitId::from("b")],
        );
        let parsed = Commit::from_snapshot(&commit.snapshot()).unwrap();
        assert_eq!(parsed, commit);
    }

    #[test]
    fn timestamps_are_rfc3339() {
        let now = Utc::now();
        let encoded = encode_timestamp(&now);
        assert!(encoded.ends_with('Z'));
        let decoded = decode_timestamp(&encoded).unwrap();
        assert_eq!(decoded.timestamp_micros(), now.timestamp_micros());
        assert!(decode_timestamp("yesterday").is_err());
    }
}
