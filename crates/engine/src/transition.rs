//! Moving a version to the state of another commit.
//!
//! A transition never rewrites history: it appends a commit whose state
//! equals the target's, with the version's head and the target as parents.

use std::collections::BTreeMap;

use verstate_core::{
    change::{Change, EntityKey, LeafChange},
    ids::*,
};
use verstate_storage::GraphStore;

use crate::Engine;
use crate::error::EngineError;

/// Change ids of the live (non-deleted) leaves.
fn live_leaves(leaves: &BTreeMap<EntityKey, LeafChange>) -> BTreeMap<&EntityKey, &ChangeId> {
    leaves
        .iter()
        .filter(|(_, leaf)| !leaf.change.is_deletion())
        .map(|(key, leaf)| (key, &leaf.change.id))
        .collect()
}

impl Engine {
    /// Make the state of `version_id` equal the state at `to`.
    ///
    /// Returns the commit the version ends on. Transitioning to the current
    /// head, or repeating a transition whose result is still the head, is a
    /// no-op.
    pub fn transition(
        &mut self,
        version_id: &VersionId,
        to: &CommitId,
    ) -> Result<CommitId, EngineError> {
        self.in_transaction(|engine| engine.transition_inner(version_id, to))
    }

    fn transition_inner(
        &mut self,
        version_id: &VersionId,
        to: &CommitId,
    ) -> Result<CommitId, EngineError> {
        let version = self.version(version_id)?;
        if version.commit_id == *to {
            tracing::debug!(version = %version_id, "transition target is the current head");
            return Ok(version.commit_id);
        }
        if self.storage.get_commit(to)?.is_none() {
            return Err(EngineError::CommitNotFound(to.to_string()));
        }
        let head = self
            .storage
            .get_commit(&version.commit_id)?
            .ok_or_else(|| EngineError::CommitNotFound(version.commit_id.to_string()))?;

        let target = self.storage.resolve_leaf_changes(to)?;
        let source = self.storage.resolve_leaf_changes(&version.commit_id)?;

        // the head is already a transition to `to` with nothing changed since
        if head.parent_commit_ids.get(1) == Some(to) && live_leaves(&source) == live_leaves(&target) {
            tracing::debug!(version = %version_id, "transition already applied");
            return Ok(version.commit_id);
        }

        let deletions: Vec<Change> = source
            .iter()
            .filter(|(key, leaf)| !leaf.change.is_deletion() && !target.contains_key(*key))
            .map(|(_, leaf)| leaf.change.deletion())
            .collect();
        let mut members: Vec<Change> = target.into_values().map(|leaf| leaf.change).collect();
        members.extend(deletions.iter().cloned());

        let commit_id = self.advance_version(&version, &members, &deletions, Some(to.clone()))?;
        tracing::info!(
            version = %version_id,
            to = %to,
            commit = %commit_id,
            deleted = deletions.len(),
            "version transitioned"
        );
        Ok(commit_id)
    }
}
