//! Turning staged writes into commits.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;
use verstate_core::{
    change::{Change, ChangeSetElement, Commit, DEFAULT_PLUGIN_KEY, EntityKey, Version},
    ids::*,
    schema::{COMMIT_SCHEMA_KEY, is_graph_schema},
};
use verstate_storage::{
    CacheScope, CacheStore, GraphStore, StagedWrite, UntrackedEntry, UntrackedStore,
    resolved_state_sql,
};

use crate::error::EngineError;
use crate::sql::STATE_VIEW;
use crate::Engine;

/// A staged row resolved against its schema.
#[derive(Debug, Clone)]
struct PendingWrite {
    key: EntityKey,
    version_id: VersionId,
    plugin_key: String,
    schema_version: String,
    snapshot: Option<Value>,
    metadata: Option<Value>,
    untracked: bool,
    /// Previous key when the write renamed the entity.
    origin: Option<EntityKey>,
}

/// One change per entity, the last write winning. Renames also delete the old key.
fn collapse(writes: Vec<PendingWrite>) -> Vec<Change> {
    let mut order: Vec<EntityKey> = Vec::new();
    let mut latest: HashMap<EntityKey, Change> = HashMap::new();
    let mut push = |change: Change| {
        let key = change.key();
        if !latest.contains_key(&key) {
            order.push(key.clone());
        }
        latest.insert(key, change);
    };
    for write in writes {
        if let Some(origin) = &write.origin {
            push(Change::new(origin, &write.schema_version, &write.plugin_key, None));
        }
        push(
            Change::new(&write.key, write.schema_version, write.plugin_key, write.snapshot)
                .with_metadata(write.metadata),
        );
    }
    order
        .into_iter()
        .filter_map(|key| latest.remove(&key))
        .collect()
}

impl Engine {
    /// Persist changes, a change set over `members` and a commit on `parents`.
    ///
    /// The commit is also recorded as a `sys_commit` change in the global
    /// scope so the graph can be queried like any other entity.
    pub(crate) fn record_commit(
        &mut self,
        members: &[Change],
        new_changes: &[Change],
        parents: Vec<CommitId>,
    ) -> Result<Commit, EngineError> {
        self.storage.append_changes(new_changes)?;

        let change_set_id = ChangeSetId::new();
        let elements: Vec<ChangeSetElement> = members
            .iter()
            .map(|c| ChangeSetElement::for_change(&change_set_id, c))
            .collect();
        self.storage.create_change_set(&change_set_id, &elements)?;

        let commit = Commit::new(change_set_id, parents);
        self.storage.create_commit(&commit)?;

        let bookkeeping = Change::new(
            &EntityKey::new(commit.id.as_str(), COMMIT_SCHEMA_KEY, &self.config.default_file_id),
            "1.0",
            DEFAULT_PLUGIN_KEY,
            Some(commit.snapshot()),
        );
        self.storage.append_changes(std::slice::from_ref(&bookkeeping))?;
        self.storage.update_cache(
            std::slice::from_ref(&bookkeeping),
            &CacheScope::new(&VersionId::global(), &commit.id),
        )?;
        tracing::debug!(commit = %commit.id, members = members.len(), "commit recorded");
        Ok(commit)
    }

    /// Commit `members` on top of the version's head and move the version to it.
    ///
    /// `merged_from` becomes the second parent. Caches of the version that
    /// were fresh at the old head stay fresh.
    pub(crate) fn advance_version(
        &mut self,
        version: &Version,
        members: &[Change],
        new_changes: &[Change],
        merged_from: Option<CommitId>,
    ) -> Result<CommitId, EngineError> {
        let mut parents = vec![version.commit_id.clone()];
        parents.extend(merged_from);
        let commit = self.record_commit(members, new_changes, parents)?;

        self.storage.set_version_commit(&version.id, &commit.id)?;
        self.storage
            .update_cache(members, &CacheScope::new(&version.id, &commit.id))?;
        let advanced = self
            .storage
            .advance_watermarks(&version.id, &version.commit_id, &commit.id)?;
        tracing::debug!(version = %version.id, commit = %commit.id, advanced, "version advanced");
        Ok(commit.id)
    }

    /// Commit tracked changes to a version and check constraints against the result.
    pub(crate) fn commit_tracked(
        &mut self,
        version_id: &VersionId,
        changes: Vec<Change>,
    ) -> Result<Option<CommitId>, EngineError> {
        if changes.is_empty() {
            return Ok(None);
        }
        let version = self.version(version_id)?;
        for change in &changes {
            let immutable = self
                .catalog
                .get(&change.schema_key)
                .is_some_and(|s| s.immutable);
            if immutable && self.entity_exists(&change.key(), version_id)? {
                return Err(EngineError::ImmutableSchemaViolation {
                    schema_key: change.schema_key.clone(),
                });
            }
        }

        let commit_id = self.advance_version(&version, &changes, &changes, None)?;
        let touched: Vec<(EntityKey, Option<Value>)> = changes
            .into_iter()
            .map(|c| (c.key(), c.snapshot_content))
            .collect();
        self.validate_constraints(version_id, &touched)?;
        Ok(Some(commit_id))
    }

    /// Whether the entity is live in the version, tracked or untracked.
    pub(crate) fn entity_exists(
        &mut self,
        key: &EntityKey,
        version_id: &VersionId,
    ) -> Result<bool, EngineError> {
        self.ensure_fresh(&BTreeSet::from([key.schema_key.clone()]))?;
        self.storage.ensure_cache_table(&key.schema_key)?;
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM ({}) WHERE version_id = ?1 AND entity_id = ?2 AND file_id = ?3)",
            resolved_state_sql(&key.schema_key)
        );
        let exists = self.storage.conn().query_row(
            &sql,
            rusqlite::params![version_id.as_str(), key.entity_id, key.file_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Drain `internal_state_writes` into untracked rows and one commit per
    /// touched version. Returns the number of staged rows consumed.
    pub(crate) fn flush_staged_writes(&mut self) -> Result<usize, EngineError> {
        let staged = self.storage.take_staged_writes()?;
        if staged.is_empty() {
            return Ok(0);
        }
        let count = staged.len();
        let active = self.active_version()?.id;

        let mut tracked: Vec<(VersionId, Vec<PendingWrite>)> = Vec::new();
        let mut untracked: Vec<(VersionId, Vec<(EntityKey, Option<Value>)>)> = Vec::new();
        for write in staged {
            let pending = self.resolve_write(write, &active)?;
            if pending.untracked {
                self.apply_untracked(&pending)?;
                let touched = (pending.key.clone(), pending.snapshot.clone());
                match untracked.iter_mut().find(|(v, _)| *v == pending.version_id) {
                    Some((_, list)) => list.push(touched),
                    None => untracked.push((pending.version_id.clone(), vec![touched])),
                }
            } else {
                match tracked.iter_mut().find(|(v, _)| *v == pending.version_id) {
                    Some((_, list)) => list.push(pending),
                    None => tracked.push((pending.version_id.clone(), vec![pending])),
                }
            }
        }

        for (version_id, touched) in &untracked {
            self.validate_constraints(version_id, touched)?;
        }
        for (version_id, writes) in tracked {
            self.commit_tracked(&version_id, collapse(writes))?;
        }
        Ok(count)
    }

    fn resolve_write(
        &self,
        write: StagedWrite,
        active: &VersionId,
    ) -> Result<PendingWrite, EngineError> {
        let schema_key = write
            .schema_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| EngineError::schema(STATE_VIEW, "schema_key is required"))?;
        if is_graph_schema(&schema_key) {
            return Err(EngineError::ImmutableSchemaViolation { schema_key });
        }
        let schema = match &write.schema_version {
            Some(version) => self.storage.get_schema(&schema_key, version)?,
            None => self.catalog.get(&schema_key).cloned(),
        }
        .ok_or_else(|| EngineError::schema(&schema_key, "schema is not registered"))?;

        let entity_id = write
            .entity_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| EngineError::schema(&schema_key, "entity_id is required"))?;
        let version_id = write
            .version_id
            .map(VersionId::from_string)
            .unwrap_or_else(|| active.clone());
        self.version(&version_id)?;

        let snapshot = match write.snapshot_content {
            Some(text) => {
                let value: Value = serde_json::from_str(&text).map_err(|e| {
                    EngineError::schema(&schema_key, format!("snapshot is not valid JSON: {e}"))
                })?;
                if value.is_null() {
                    None
                } else {
                    schema.validate_snapshot(&value)?;
                    Some(value)
                }
            }
            None => None,
        };
        let metadata = write
            .metadata
            .map(|text| serde_json::from_str::<Value>(&text))
            .transpose()
            .map_err(|e| EngineError::schema(&schema_key, format!("metadata is not valid JSON: {e}")))?;

        let file_id = write.file_id.unwrap_or_else(|| {
            schema
                .override_str("sys_file_id")
                .unwrap_or(&self.config.default_file_id)
                .to_string()
        });
        let plugin_key = write.plugin_key.unwrap_or_else(|| {
            schema
                .override_str("sys_plugin_key")
                .unwrap_or(&self.config.default_plugin_key)
                .to_string()
        });
        let origin = write
            .origin_entity_id
            .filter(|origin| *origin != entity_id)
            .map(|origin| EntityKey::new(origin, &schema_key, &file_id));

        Ok(PendingWrite {
            key: EntityKey::new(entity_id, &schema_key, file_id),
            version_id,
            plugin_key,
            schema_version: schema.version.clone(),
            snapshot,
            metadata,
            untracked: write.untracked,
            origin,
        })
    }

    fn apply_untracked(&mut self, write: &PendingWrite) -> Result<(), EngineError> {
        match &write.snapshot {
            Some(snapshot) => self.storage.upsert_untracked(&UntrackedEntry {
                key: write.key.clone(),
                version_id: write.version_id.clone(),
                plugin_key: write.plugin_key.clone(),
                schema_version: write.schema_version.clone(),
                snapshot_content: snapshot.clone(),
                metadata: write.metadata.clone(),
            })?,
            None => self.storage.delete_untracked(&write.key, &write.version_id)?,
        }
        if let Some(origin) = &write.origin {
            self.storage.delete_untracked(origin, &write.version_id)?;
        }
        tracing::debug!(entity = %write.key, version = %write.version_id, "untracked state written");
        Ok(())
    }
}
