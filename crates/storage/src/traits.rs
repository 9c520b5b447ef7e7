use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;
use verstate_core::{
    change::{Change, ChangeSetElement, Commit, EntityKey, LeafChange, Version},
    ids::*,
    log::LogEvent,
    plugin::FileChange,
};

use crate::error::StorageError;

/// Version and commit a cache update is applied under. Both are required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheScope {
    pub version_id: Option<VersionId>,
    pub commit_id: Option<CommitId>,
}

impl CacheScope {
    pub fn new(version_id: &VersionId, commit_id: &CommitId) -> Self {
        Self {
            version_id: Some(version_id.clone()),
            commit_id: Some(commit_id.clone()),
        }
    }
}

/// A row as physically stored in a per-schema cache table.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRow {
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
    pub version_id: VersionId,
    pub plugin_key: String,
    pub schema_version: String,
    pub snapshot_content: Option<Value>,
    pub metadata: Option<Value>,
    pub change_id: ChangeId,
    pub commit_id: CommitId,
    pub inherited_from_version_id: Option<VersionId>,
    pub inheritance_delete_marker: bool,
}

impl CacheRow {
    pub fn is_tombstone(&self) -> bool {
        self.inheritance_delete_marker
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.schema_key, &self.file_id)
    }
}

/// Live entity state of a version after inheritance and untracked overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRow {
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
    pub version_id: VersionId,
    pub plugin_key: String,
    pub schema_version: String,
    pub snapshot_content: Value,
    pub metadata: Option<Value>,
    pub change_id: Option<ChangeId>,
    pub commit_id: Option<CommitId>,
    pub inherited_from_version_id: Option<VersionId>,
    pub untracked: bool,
}

impl StateRow {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.schema_key, &self.file_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UntrackedEntry {
    pub key: EntityKey,
    pub version_id: VersionId,
    pub plugin_key: String,
    pub schema_version: String,
    pub snapshot_content: Value,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UntrackedRow {
    pub key: EntityKey,
    pub version_id: VersionId,
    pub plugin_key: String,
    pub schema_version: String,
    pub snapshot_content: Option<Value>,
    pub metadata: Option<Value>,
    pub inheritance_delete_marker: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub key: String,
    /// Sorted, so the same conflict always yields the same set.
    pub change_ids: Vec<ChangeId>,
    pub entity: EntityKey,
    pub source_version_id: VersionId,
    pub target_version_id: VersionId,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub id: i64,
    pub event: LogEvent,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedFile {
    pub id: i64,
    pub file: FileChange,
}

/// A row written by a rewritten statement, waiting to become a change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StagedWrite {
    pub seq: i64,
    pub entity_id: Option<String>,
    pub schema_key: Option<String>,
    pub file_id: Option<String>,
    pub plugin_key: Option<String>,
    pub schema_version: Option<String>,
    pub version_id: Option<String>,
    /// Raw JSON text as produced by SQL.
    pub snapshot_content: Option<String>,
    pub metadata: Option<String>,
    pub untracked: bool,
    pub origin_entity_id: Option<String>,
}

/// The append-only ledger of changes and the commit graph over them.
pub trait GraphStore {
    fn append_changes(&mut self, changes: &[Change]) -> Result<(), StorageError>;

    fn get_change(&self, id: &ChangeId) -> Result<Option<Change>, StorageError>;

    fn create_change_set(
        &mut self,
        id: &ChangeSetId,
        elements: &[ChangeSetElement],
    ) -> Result<(), StorageError>;

    fn change_set_changes(&self, id: &ChangeSetId) -> Result<Vec<Change>, StorageError>;

    fn create_commit(&mut self, commit: &Commit) -> Result<(), StorageError>;

    fn get_commit(&self, id: &CommitId) -> Result<Option<Commit>, StorageError>;

    /// Breadth-first ancestry of a commit with the shortest depth of each ancestor.
    fn ancestry(
        &self,
        id: &CommitId,
        limit: Option<usize>,
    ) -> Result<Vec<(CommitId, usize)>, StorageError>;

    fn resolve_leaf_changes(
        &self,
        id: &CommitId,
    ) -> Result<BTreeMap<EntityKey, LeafChange>, StorageError>;

    fn change_ids_in_history(
        &self,
        id: &CommitId,
        limit: Option<usize>,
    ) -> Result<HashSet<ChangeId>, StorageError>;

    /// Changes to one entity, closest first.
    fn entity_history(
        &self,
        id: &CommitId,
        key: &EntityKey,
        limit: Option<usize>,
    ) -> Result<Vec<Change>, StorageError>;
}

/// Per-schema materialized state.
pub trait CacheStore {
    fn update_cache(&mut self, changes: &[Change], scope: &CacheScope) -> Result<(), StorageError>;

    fn cache_rows(
        &mut self,
        schema_key: &str,
        version_id: &VersionId,
    ) -> Result<Vec<CacheRow>, StorageError>;

    fn live_state(
        &mut self,
        schema_key: &str,
        version_id: &VersionId,
    ) -> Result<Vec<StateRow>, StorageError>;

    /// Replace the cached rows of `version` for the given schemas with its leaf state.
    fn rebuild_cache(&mut self, version: &Version, schema_keys: &[String])
    -> Result<(), StorageError>;

    fn rebuild_graph_cache(&mut self) -> Result<(), StorageError>;

    fn watermark(
        &self,
        schema_key: &str,
        version_id: &VersionId,
    ) -> Result<Option<CommitId>, StorageError>;

    /// Move every watermark of `version_id` sitting at `from` to `to`.
    fn advance_watermarks(
        &mut self,
        version_id: &VersionId,
        from: &CommitId,
        to: &CommitId,
    ) -> Result<usize, StorageError>;
}

/// State kept outside the change log.
pub trait UntrackedStore {
    fn upsert_untracked(&mut self, entry: &UntrackedEntry) -> Result<(), StorageError>;

    fn delete_untracked(
        &mut self,
        key: &EntityKey,
        version_id: &VersionId,
    ) -> Result<(), StorageError>;

    fn get_untracked(
        &self,
        key: &EntityKey,
        version_id: &VersionId,
    ) -> Result<Option<UntrackedRow>, StorageError>;
}
