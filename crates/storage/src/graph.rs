use std::collections::{BTreeMap, HashSet, VecDeque, btree_map::Entry};

use rusqlite::{OptionalExtension, params};

use verstate_core::{
    change::{Change, ChangeSetElement, Commit, EntityKey, LeafChange},
    ids::*,
    schema::COMMIT_SCHEMA_KEY,
};

use crate::error::{StorageError, is_constraint_violation};
use crate::sqlite::{CHANGE_COLUMNS, SqliteStorage, now, read_change, to_json_text};
use crate::traits::GraphStore;

impl SqliteStorage {
    /// Visit the ancestry of `start` breadth-first, parents in declared order.
    ///
    /// Each commit is visited once at its shortest depth. `limit` caps the
    /// number of visited commits.
    fn walk_ancestry(
        &self,
        start: &CommitId,
        limit: Option<usize>,
        mut visit: impl FnMut(&Commit, usize) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        let mut seen = HashSet::from([start.clone()]);
        let mut queue = VecDeque::from([(start.clone(), 0usize)]);
        let mut visited = 0usize;
        while let Some((id, depth)) = queue.pop_front() {
            if limit.is_some_and(|max| visited >= max) {
                tracing::debug!(start = %start, visited, "ancestry walk hit its limit");
                break;
            }
            let commit = self
                .get_commit(&id)?
                .ok_or_else(|| StorageError::NotFound(format!("commit {id}")))?;
            visit(&commit, depth)?;
            visited += 1;
            for parent in &commit.parent_commit_ids {
                if seen.insert(parent.clone()) {
                    queue.push_back((parent.clone(), depth + 1));
                }
            }
        }
        Ok(())
    }

    /// Bookkeeping changes of every commit, oldest first.
    pub(crate) fn commit_changes(&self) -> Result<Vec<Change>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CHANGE_COLUMNS} FROM internal_change c WHERE c.schema_key = ?1 ORDER BY c.rowid"
        ))?;
        let mut rows = stmt.query([COMMIT_SCHEMA_KEY])?;
        let mut changes = Vec::new();
        while let Some(row) = rows.next()? {
            changes.push(read_change(row)?);
        }
        Ok(changes)
    }
}

impl GraphStore for SqliteStorage {
    fn append_changes(&mut self, changes: &[Change]) -> Result<(), StorageError> {
        let sp = self.conn.savepoint()?;
        {
            let mut stmt = sp.prepare_cached(
                "INSERT INTO internal_change (id, entity_id, schema_key, schema_version, file_id, plugin_key, snapshot_content, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for change in changes {
                let result = stmt.execute(params![
                    change.id.as_str(),
                    change.entity_id,
                    change.schema_key,
                    change.schema_version,
                    change.file_id,
                    change.plugin_key,
                    to_json_text(change.snapshot_content.as_ref())?,
                    to_json_text(change.metadata.as_ref())?,
                    verstate_core::change::encode_timestamp(&change.created_at),
                ]);
                match result {
                    Ok(_) => {}
                    Err(e) if is_constraint_violation(&e) => {
                        return Err(StorageError::DuplicateChangeId {
                            change_id: change.id.to_string(),
                        });
                    }
                    Err(e) => return Err(StorageError::Sqlite(e)),
                }
            }
        }
        sp.commit()?;
        Ok(())
    }

    fn get_change(&self, id: &ChangeId) -> Result<Option<Change>, StorageError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {CHANGE_COLUMNS} FROM internal_change c WHERE c.id = ?1"
        ))?;
        let mut rows = stmt.query([id.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_change(row)?)),
            None => Ok(None),
        }
    }

    fn create_change_set(
        &mut self,
        id: &ChangeSetId,
        elements: &[ChangeSetElement],
    ) -> Result<(), StorageError> {
        let sp = self.conn.savepoint()?;
        sp.execute(
            "INSERT INTO internal_change_set (id, created_at) VALUES (?1, ?2)",
            params![id.as_str(), now()],
        )?;
        {
            let mut stmt = sp.prepare_cached(
                "INSERT INTO internal_change_set_element (change_set_id, position, change_id, entity_id, schema_key, file_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (position, element) in elements.iter().enumerate() {
                if &element.change_set_id != id {
                    return Err(StorageError::Serialization(format!(
                        "element of change set {} passed for {id}",
                        element.change_set_id
                    )));
                }
                stmt.execute(params![
                    id.as_str(),
                    position as i64,
                    element.change_id.as_str(),
                    element.entity_id,
                    element.schema_key,
                    element.file_id,
                ])?;
            }
        }
        sp.commit()?;
        Ok(())
    }

    fn change_set_changes(&self, id: &ChangeSetId) -> Result<Vec<Change>, StorageError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {CHANGE_COLUMNS} FROM internal_change_set_element e
             JOIN internal_change c ON c.id = e.change_id
             WHERE e.change_set_id = ?1 ORDER BY e.position"
        ))?;
        let mut rows = stmt.query([id.as_str()])?;
        let mut changes = Vec::new();
        while let Some(row) = rows.next()? {
            changes.push(read_change(row)?);
        }
        Ok(changes)
    }

    fn create_commit(&mut self, commit: &Commit) -> Result<(), StorageError> {
        if commit.parent_commit_ids.contains(&commit.id) {
            return Err(StorageError::SelfReferencingCommit {
                commit_id: commit.id.to_string(),
            });
        }
        for parent in &commit.parent_commit_ids {
            let exists: Option<i64> = self
                .conn
                .query_row(
                    "SELECT 1 FROM internal_commit WHERE id = ?1",
                    [parent.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(StorageError::DanglingParentCommit {
                    commit_id: commit.id.to_string(),
                    parent_id: parent.to_string(),
                });
            }
        }
        let owner: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM internal_commit WHERE change_set_id = ?1",
                [commit.change_set_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if owner.is_some() {
            return Err(StorageError::ChangeSetAlreadyCommitted {
                change_set_id: commit.change_set_id.to_string(),
            });
        }
        let parents = serde_json::to_string(&commit.parent_commit_ids)?;
        let result = self.conn.execute(
            "INSERT INTO internal_commit (id, change_set_id, parent_commit_ids, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![commit.id.as_str(), commit.change_set_id.as_str(), parents, now()],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
            {
                Err(StorageError::NotFound(format!(
                    "change set {}",
                    commit.change_set_id
                )))
            }
            Err(e) => Err(StorageError::Sqlite(e)),
        }
    }

    fn get_commit(&self, id: &CommitId) -> Result<Option<Commit>, StorageError> {
        let row: Option<(String, String)> = self
            .conn
            .prepare_cached(
                "SELECT change_set_id, parent_commit_ids FROM internal_commit WHERE id = ?1",
            )?
            .query_row([id.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        let Some((change_set_id, parents)) = row else {
            return Ok(None);
        };
        Ok(Some(Commit {
            id: id.clone(),
            change_set_id: ChangeSetId::from_string(change_set_id),
            parent_commit_ids: serde_json::from_str(&parents)?,
        }))
    }

    fn ancestry(
        &self,
        id: &CommitId,
        limit: Option<usize>,
    ) -> Result<Vec<(CommitId, usize)>, StorageError> {
        let mut out = Vec::new();
        self.walk_ancestry(id, limit, |commit, depth| {
            out.push((commit.id.clone(), depth));
            Ok(())
        })?;
        Ok(out)
    }

    fn resolve_leaf_changes(
        &self,
        id: &CommitId,
    ) -> Result<BTreeMap<EntityKey, LeafChange>, StorageError> {
        let mut leaves = BTreeMap::new();
        self.walk_ancestry(id, None, |commit, depth| {
            for change in self.change_set_changes(&commit.change_set_id)? {
                if let Entry::Vacant(slot) = leaves.entry(change.key()) {
                    slot.insert(LeafChange {
                        change,
                        commit_id: commit.id.clone(),
                        depth,
                    });
                }
            }
            Ok(())
        })?;
        Ok(leaves)
    }

    fn change_ids_in_history(
        &self,
        id: &CommitId,
        limit: Option<usize>,
    ) -> Result<HashSet<ChangeId>, StorageError> {
        let mut ids = HashSet::new();
        let mut stmt = self
            .conn
            .prepare_cached("SELECT change_id FROM internal_change_set_element WHERE change_set_id = ?1")?;
        self.walk_ancestry(id, limit, |commit, _| {
            let found = stmt
                .query_map([commit.change_set_id.as_str()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids.extend(found.into_iter().map(ChangeId::from_string));
            Ok(())
        })?;
        Ok(ids)
    }

    fn entity_history(
        &self,
        id: &CommitId,
        key: &EntityKey,
        limit: Option<usize>,
    ) -> Result<Vec<Change>, StorageError> {
        let mut history: Vec<Change> = Vec::new();
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {CHANGE_COLUMNS} FROM internal_change_set_element e
             JOIN internal_change c ON c.id = e.change_id
             WHERE e.change_set_id = ?1 AND e.entity_id = ?2 AND e.schema_key = ?3 AND e.file_id = ?4"
        ))?;
        self.walk_ancestry(id, limit, |commit, _| {
            let mut rows = stmt.query(params![
                commit.change_set_id.as_str(),
                key.entity_id,
                key.schema_key,
                key.file_id,
            ])?;
            while let Some(row) = rows.next()? {
                let change = read_change(row)?;
                if !history.iter().any(|c| c.id == change.id) {
                    history.push(change);
                }
            }
            Ok(())
        })?;
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn commit_with(
        storage: &mut SqliteStorage,
        changes: &[Change],
        parents: Vec<CommitId>,
    ) -> CommitId {
        storage.append_changes(changes).unwrap();
        let set = ChangeSetId::new();
        let elements: Vec<_> = changes
            .iter()
            .map(|c| ChangeSetElement::for_change(&set, c))
            .collect();
        storage.create_change_set(&set, &elements).unwrap();
        let commit = Commit::new(set, parents);
        storage.create_commit(&commit).unwrap();
        commit.id
    }

    #[test]
    fn ancestry_reports_shortest_depth() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let root = commit_with(&mut storage, &[], vec![]);
        let left = commit_with(&mut storage, &[], vec![root.clone()]);
        let right = commit_with(&mut storage, &[], vec![left.clone()]);
        let tip = commit_with(&mut storage, &[], vec![right.clone(), root.clone()]);

        let ancestry = storage.ancestry(&tip, None).unwrap();
        assert_eq!(
            ancestry,
            vec![(tip.clone(), 0), (right, 1), (root, 1), (left, 2)]
        );
        assert_eq!(storage.ancestry(&tip, Some(2)).unwrap().len(), 2);
    }

    #[test]
    fn self_reference_is_rejected() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        storage.create_change_set(&ChangeSetId::from("cs"), &[]).unwrap();
        let commit = Commit {
            id: CommitId::from("c"),
            change_set_id: ChangeSetId::from("cs"),
            parent_commit_ids: vec![CommitId::from("c")],
        };
        let err = storage.create_commit(&commit).unwrap_err();
        assert!(matches!(err, StorageError::SelfReferencingCommit { .. }));
    }

    #[test]
    fn change_set_belongs_to_one_commit() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        storage.create_change_set(&ChangeSetId::from("cs"), &[]).unwrap();
        storage
            .create_commit(&Commit::new(ChangeSetId::from("cs"), vec![]))
            .unwrap();
        let err = storage
            .create_commit(&Commit::new(ChangeSetId::from("cs"), vec![]))
            .unwrap_err();
        assert!(matches!(err, StorageError::ChangeSetAlreadyCommitted { .. }));
    }

    #[test]
    fn entity_history_is_closest_first() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let key = EntityKey::new("e1", "k", "f");
        let first = Change::new(&key, "1.0", "p", Some(json!({"v": 1})));
        let second = Change::new(&key, "1.0", "p", Some(json!({"v": 2})));
        let a = commit_with(&mut storage, &[first.clone()], vec![]);
        let b = commit_with(&mut storage, &[second.clone()], vec![a]);

        let history = storage.entity_history(&b, &key, None).unwrap();
        let ids: Vec<_> = history.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }
}
