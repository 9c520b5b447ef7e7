use rusqlite::{OptionalExtension, params};

use verstate_core::{change::EntityKey, ids::*};

use crate::error::StorageError;
use crate::sqlite::{SqliteStorage, from_json_text, now, to_json_text};
use crate::traits::{UntrackedEntry, UntrackedRow, UntrackedStore};

impl UntrackedStore for SqliteStorage {
    fn upsert_untracked(&mut self, entry: &UntrackedEntry) -> Result<(), StorageError> {
        let stamp = now();
        self.conn.execute(
            "INSERT INTO internal_untracked (entity_id, schema_key, file_id, version_id, plugin_key, schema_version, snapshot_content, metadata, inheritance_delete_marker, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9)
             ON CONFLICT (entity_id, schema_key, file_id, version_id) DO UPDATE SET
                plugin_key = excluded.plugin_key,
                schema_version = excluded.schema_version,
                snapshot_content = excluded.snapshot_content,
                metadata = excluded.metadata,
                inheritance_delete_marker = 0,
                updated_at = excluded.updated_at",
            params![
                entry.key.entity_id,
                entry.key.schema_key,
                entry.key.file_id,
                entry.version_id.as_str(),
                entry.plugin_key,
                entry.schema_version,
                to_json_text(Some(&entry.snapshot_content))?,
                to_json_text(entry.metadata.as_ref())?,
                stamp,
            ],
        )?;
        Ok(())
    }

    fn delete_untracked(
        &mut self,
        key: &EntityKey,
        version_id: &VersionId,
    ) -> Result<(), StorageError> {
        let sp = self.conn.savepoint()?;
        sp.execute(
            "DELETE FROM internal_untracked
             WHERE entity_id = ?1 AND schema_key = ?2 AND file_id = ?3 AND version_id = ?4",
            params![key.entity_id, key.schema_key, key.file_id, version_id.as_str()],
        )?;

        if !version_id.is_global() {
            // an inherited value would shine through the deleted row
            let inherited: Option<(String, String)> = sp
                .query_row(
                    "SELECT plugin_key, schema_version FROM internal_untracked
                     WHERE entity_id = ?1 AND schema_key = ?2 AND file_id = ?3 AND version_id = ?4
                       AND inheritance_delete_marker = 0",
                    params![key.entity_id, key.schema_key, key.file_id, GLOBAL_VERSION_ID],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if let Some((plugin_key, schema_version)) = inherited {
                let stamp = now();
                sp.execute(
                    "INSERT INTO internal_untracked (entity_id, schema_key, file_id, version_id, plugin_key, schema_version, snapshot_content, metadata, inheritance_delete_marker, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, 1, ?7, ?7)",
                    params![
                        key.entity_id,
                        key.schema_key,
                        key.file_id,
                        version_id.as_str(),
                        plugin_key,
                        schema_version,
                        stamp,
                    ],
                )?;
                tracing::debug!(entity = %key, version = %version_id, "untracked tombstone written");
            }
        }
        sp.commit()?;
        Ok(())
    }

    fn get_untracked(
        &self,
        key: &EntityKey,
        version_id: &VersionId,
    ) -> Result<Option<UntrackedRow>, StorageError> {
        let row: Option<(String, String, Option<String>, Option<String>, bool)> = self
            .conn
            .query_row(
                "SELECT plugin_key, schema_version, snapshot_content, metadata, inheritance_delete_marker
                 FROM internal_untracked
                 WHERE entity_id = ?1 AND schema_key = ?2 AND file_id = ?3 AND version_id = ?4",
                params![key.entity_id, key.schema_key, key.file_id, version_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;
        let Some((plugin_key, schema_version, snapshot, metadata, marker)) = row else {
            return Ok(None);
        };
        Ok(Some(UntrackedRow {
            key: key.clone(),
            version_id: version_id.clone(),
            plugin_key,
            schema_version,
            snapshot_content: from_json_text(snapshot)?,
            metadata: from_json_text(metadata)?,
            inheritance_delete_marker: marker,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(key: &EntityKey, version: &VersionId, v: i64) -> UntrackedEntry {
        UntrackedEntry {
            key: key.clone(),
            version_id: version.clone(),
            plugin_key: "p".into(),
            schema_version: "1.0".into(),
            snapshot_content: json!({"v": v}),
            metadata: None,
        }
    }

    #[test]
    fn deleting_an_owned_row_removes_it() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let key = EntityKey::new("e1", "k", "f");
        let branch = VersionId::from("branch");
        storage.upsert_untracked(&entry(&key, &branch, 1)).unwrap();
        storage.delete_untracked(&key, &branch).unwrap();
        assert_eq!(storage.get_untracked(&key, &branch).unwrap(), None);
    }

    #[test]
    fn deleting_an_inherited_row_writes_a_tombstone() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let key = EntityKey::new("e1", "k", "f");
        let branch = VersionId::from("branch");
        storage
            .upsert_untracked(&entry(&key, &VersionId::global(), 1))
            .unwrap();

        storage.delete_untracked(&key, &branch).unwrap();
        let local = storage.get_untracked(&key, &branch).unwrap().unwrap();
        assert!(local.inheritance_delete_marker);
        assert_eq!(local.snapshot_content, None);

        let global = storage
            .get_untracked(&key, &VersionId::global())
            .unwrap()
            .unwrap();
        assert_eq!(global.snapshot_content, Some(json!({"v": 1})));

        // tombstones are revivable
        storage.upsert_untracked(&entry(&key, &branch, 2)).unwrap();
        let revived = storage.get_untracked(&key, &branch).unwrap().unwrap();
        assert!(!revived.inheritance_delete_marker);
        assert_eq!(revived.snapshot_content, Some(json!({"v": 2})));
    }

    #[test]
    fn deleting_a_missing_row_is_a_no_op() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let key = EntityKey::new("e1", "k", "f");
        storage.delete_untracked(&key, &VersionId::from("v")).unwrap();
        assert_eq!(storage.get_untracked(&key, &VersionId::from("v")).unwrap(), None);
    }
}
