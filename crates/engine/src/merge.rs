//! Merging one version into another.
//!
//! Every live leaf of the source is compared with the target's leaf for the
//! same entity. Changes the target has not seen, and that do not compete
//! with a change the source has not seen, are adopted. Competing changes
//! always become a `diverging_entity` conflict record, plus whatever the
//! owning plugin reports; the target keeps its own state for them.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use verstate_core::{
    change::{Change, EntityKey},
    ids::*,
    log::{LogEvent, LogLevel},
    plugin::{ConflictContext, DetectedConflict},
};
use verstate_storage::{ConflictRecord, GraphStore};

use crate::Engine;
use crate::error::EngineError;

pub const DIVERGING_ENTITY_CONFLICT: &str = "diverging_entity";
const LOG_DETECTOR_FAILED: &str = "merge.conflict_detector_failed";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// The merge commit on the target, if anything was adopted.
    pub commit_id: Option<CommitId>,
    pub adopted: Vec<EntityKey>,
    /// Conflicts detected by this merge, including ones already recorded earlier.
    pub conflicts: Vec<ConflictRecord>,
}

impl MergeOutcome {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

enum Verdict {
    Adopt,
    Skip,
    Conflict,
}

impl Engine {
    pub fn merge_version(
        &mut self,
        source_id: &VersionId,
        target_id: &VersionId,
    ) -> Result<MergeOutcome, EngineError> {
        self.in_transaction(|engine| engine.merge_inner(source_id, target_id))
    }

    fn merge_inner(
        &mut self,
        source_id: &VersionId,
        target_id: &VersionId,
    ) -> Result<MergeOutcome, EngineError> {
        let source = self.version(source_id)?;
        let target = self.version(target_id)?;
        let limit = Some(self.config.history_search_limit);

        let source_leaves = self.storage.resolve_leaf_changes(&source.commit_id)?;
        let target_leaves = self.storage.resolve_leaf_changes(&target.commit_id)?;
        let source_history = self.storage.change_ids_in_history(&source.commit_id, limit)?;
        let target_history = self.storage.change_ids_in_history(&target.commit_id, limit)?;

        let mut adopted: BTreeMap<EntityKey, Change> = BTreeMap::new();
        let mut conflicts = Vec::new();
        for (key, leaf) in &source_leaves {
            let incoming = &leaf.change;
            let verdict = match target_leaves.get(key) {
                None if incoming.is_deletion() => Verdict::Skip,
                None => Verdict::Adopt,
                Some(current) => {
                    let current = &current.change;
                    if current.id == incoming.id
                        || target_history.contains(&incoming.id)
                        || current.snapshot_content == incoming.snapshot_content
                    {
                        Verdict::Skip
                    } else if source_history.contains(&current.id) {
                        Verdict::Adopt
                    } else {
                        Verdict::Conflict
                    }
                }
            };
            match verdict {
                Verdict::Adopt => {
                    adopted.insert(key.clone(), incoming.clone());
                }
                Verdict::Skip => {}
                Verdict::Conflict => {
                    let Some(current) = target_leaves.get(key) else {
                        continue;
                    };
                    conflicts.extend(self.record_conflicts(
                        key,
                        incoming,
                        &current.change,
                        &source.commit_id,
                        &target.commit_id,
                        (source_id, target_id),
                    )?);
                }
            }
        }

        let commit_id = if adopted.is_empty() {
            None
        } else {
            let mut members: BTreeMap<EntityKey, Change> = target_leaves
                .into_iter()
                .map(|(key, leaf)| (key, leaf.change))
                .collect();
            members.extend(adopted.iter().map(|(k, c)| (k.clone(), c.clone())));
            let members: Vec<Change> = members.into_values().collect();
            Some(self.advance_version(&target, &members, &[], Some(source.commit_id.clone()))?)
        };

        tracing::info!(
            source = %source_id,
            target = %target_id,
            adopted = adopted.len(),
            conflicts = conflicts.len(),
            "versions merged"
        );
        Ok(MergeOutcome {
            commit_id,
            adopted: adopted.into_keys().collect(),
            conflicts,
        })
    }

    /// Most recent change to `key` seen by both heads.
    fn common_ancestor(
        &self,
        key: &EntityKey,
        source_head: &CommitId,
        target_head: &CommitId,
    ) -> Result<Option<Change>, EngineError> {
        let limit = Some(self.config.history_search_limit);
        let target_ids: HashSet<ChangeId> = self
            .storage
            .entity_history(target_head, key, limit)?
            .into_iter()
            .map(|c| c.id)
            .collect();
        Ok(self
            .storage
            .entity_history(source_head, key, limit)?
            .into_iter()
            .find(|c| target_ids.contains(&c.id)))
    }

    fn record_conflicts(
        &mut self,
        key: &EntityKey,
        incoming: &Change,
        current: &Change,
        source_head: &CommitId,
        target_head: &CommitId,
        (source_id, target_id): (&VersionId, &VersionId),
    ) -> Result<Vec<ConflictRecord>, EngineError> {
        let ancestor = self.common_ancestor(key, source_head, target_head)?;

        let mut detected = vec![DetectedConflict {
            key: DIVERGING_ENTITY_CONFLICT.to_string(),
            message: match &ancestor {
                Some(base) => format!("{key} changed in both versions since change {}", base.id),
                None => format!(
                    "{key} changed in both versions with no common change within {} commits",
                    self.config.history_search_limit
                ),
            },
        }];
        for found in self.detect_with_plugin(key, incoming, current, ancestor.as_ref())? {
            if detected.iter().all(|d| d.key != found.key) {
                detected.push(found);
            }
        }

        let mut change_ids = vec![incoming.id.clone(), current.id.clone()];
        change_ids.sort();
        let mut records = Vec::with_capacity(detected.len());
        for conflict in detected {
            let record = ConflictRecord {
                id: ConflictId::new(),
                key: conflict.key,
                change_ids: change_ids.clone(),
                entity: key.clone(),
                source_version_id: source_id.clone(),
                target_version_id: target_id.clone(),
                message: conflict.message,
                created_at: Utc::now(),
            };
            if self.storage.insert_conflict(&record)? {
                tracing::info!(entity = %key, conflict = %record.key, "conflict recorded");
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Extra conflicts reported by the plugin owning the change. A detector
    /// that fails is logged and contributes nothing.
    fn detect_with_plugin(
        &mut self,
        key: &EntityKey,
        incoming: &Change,
        current: &Change,
        ancestor: Option<&Change>,
    ) -> Result<Vec<DetectedConflict>, EngineError> {
        let Some(plugin) = self
            .plugins
            .iter()
            .find(|p| p.key == incoming.plugin_key && p.can_detect_conflicts())
        else {
            return Ok(Vec::new());
        };
        let ctx = ConflictContext {
            key,
            source: incoming,
            target: current,
            ancestor,
        };
        let plugin_key = plugin.key.clone();
        match plugin.detect_conflicts(&ctx) {
            Some(Ok(found)) => Ok(found),
            None => Ok(Vec::new()),
            Some(Err(err)) => {
                self.log_event(LogEvent::new(
                    LOG_DETECTOR_FAILED,
                    LogLevel::Warn,
                    format!("plugin '{plugin_key}' failed to detect conflicts for {key}: {err}"),
                ))?;
                Ok(Vec::new())
            }
        }
    }
}
