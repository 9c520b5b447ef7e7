use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use verstate_core::{
    change::{Change, Version, decode_timestamp, encode_timestamp},
    ids::*,
    log::{LogEvent, LogLevel},
    plugin::FileChange,
    schema::{Schema, builtin_schemas},
};

use crate::cache::CacheTableRegistry;
use crate::error::StorageError;
use crate::traits::{ConflictRecord, LogRecord, QueuedFile, StagedWrite};

pub(crate) fn to_json_text(value: Option<&Value>) -> Result<Option<String>, StorageError> {
    value
        .map(serde_json::to_string)
        .transpose()
        .map_err(StorageError::from)
}

pub(crate) fn from_json_text(text: Option<String>) -> Result<Option<Value>, StorageError> {
    text.map(|t| serde_json::from_str(&t))
        .transpose()
        .map_err(StorageError::from)
}

pub(crate) fn now() -> String {
    encode_timestamp(&Utc::now())
}

pub(crate) const CHANGE_COLUMNS: &str = "c.id, c.entity_id, c.schema_key, c.schema_version, c.file_id, c.plugin_key, c.snapshot_content, c.metadata, c.created_at";

/// Read a change selected with [`CHANGE_COLUMNS`].
pub(crate) fn read_change(row: &rusqlite::Row) -> Result<Change, StorageError> {
    let created_at: String = row.get(8)?;
    Ok(Change {
        id: ChangeId::from_string(row.get::<_, String>(0)?),
        entity_id: row.get(1)?,
        schema_key: row.get(2)?,
        schema_version: row.get(3)?,
        file_id: row.get(4)?,
        plugin_key: row.get(5)?,
        snapshot_content: from_json_text(row.get(6)?)?,
        metadata: from_json_text(row.get(7)?)?,
        created_at: decode_timestamp(&created_at)?,
    })
}

fn read_version(row: &rusqlite::Row) -> rusqlite::Result<Version> {
    Ok(Version {
        id: VersionId::from_string(row.get::<_, String>(0)?),
        name: row.get(1)?,
        commit_id: CommitId::from_string(row.get::<_, String>(2)?),
    })
}

pub struct SqliteStorage {
    pub(crate) conn: Connection,
    pub(crate) caches: CacheTableRegistry,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        crate::schema::init_schema(&conn)?;
        let mut storage = Self {
            conn,
            caches: CacheTableRegistry::default(),
        };
        for schema in builtin_schemas() {
            storage.store_schema(&schema)?;
            storage.ensure_cache_table(&schema.key)?;
        }
        Ok(storage)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // ---- schemas ----

    /// Persist a schema. Returns `false` when the identical definition already exists.
    pub fn store_schema(&mut self, schema: &Schema) -> Result<bool, StorageError> {
        let fingerprint = schema.fingerprint()?;
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT fingerprint FROM internal_stored_schema WHERE key = ?1 AND version = ?2",
                params![schema.key, schema.version],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(found) if found == fingerprint => return Ok(false),
            Some(_) => {
                return Err(StorageError::SchemaRedefinition {
                    key: schema.key.clone(),
                    version: schema.version.clone(),
                });
            }
            None => {}
        }
        self.conn.execute(
            "INSERT INTO internal_stored_schema (key, version, definition, fingerprint, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![schema.key, schema.version, schema.to_json()?, fingerprint, now()],
        )?;
        self.caches.invalidate(&schema.key);
        tracing::debug!(key = %schema.key, version = %schema.version, "schema stored");
        Ok(true)
    }

    /// All stored schemas in registration order.
    pub fn load_schemas(&self) -> Result<Vec<Schema>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT definition FROM internal_stored_schema ORDER BY rowid")?;
        let mut rows = stmt.query([])?;
        let mut schemas = Vec::new();
        while let Some(row) = rows.next()? {
            let definition: String = row.get(0)?;
            schemas.push(Schema::from_json(&definition)?);
        }
        Ok(schemas)
    }

    pub fn get_schema(&self, key: &str, version: &str) -> Result<Option<Schema>, StorageError> {
        let definition: Option<String> = self
            .conn
            .query_row(
                "SELECT definition FROM internal_stored_schema WHERE key = ?1 AND version = ?2",
                params![key, version],
                |row| row.get(0),
            )
            .optional()?;
        definition
            .map(|d| Schema::from_json(&d).map_err(StorageError::from))
            .transpose()
    }

    // ---- versions ----

    pub fn insert_version(&mut self, version: &Version) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO internal_version (id, name, commit_id) VALUES (?1, ?2, ?3)",
            params![version.id.as_str(), version.name, version.commit_id.as_str()],
        )?;
        Ok(())
    }

    pub fn get_version(&self, id: &VersionId) -> Result<Option<Version>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, commit_id FROM internal_version WHERE id = ?1",
                [id.as_str()],
                read_version,
            )
            .optional()?)
    }

    pub fn version_by_name(&self, name: &str) -> Result<Option<Version>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, commit_id FROM internal_version WHERE name = ?1",
                [name],
                read_version,
            )
            .optional()?)
    }

    pub fn list_versions(&self) -> Result<Vec<Version>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, commit_id FROM internal_version ORDER BY rowid")?;
        let versions = stmt
            .query_map([], read_version)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(versions)
    }

    pub fn set_version_commit(
        &mut self,
        id: &VersionId,
        commit_id: &CommitId,
    ) -> Result<(), StorageError> {
        let updated = self.conn.execute(
            "UPDATE internal_version SET commit_id = ?1 WHERE id = ?2",
            params![commit_id.as_str(), id.as_str()],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("version {id}")));
        }
        Ok(())
    }

    pub fn active_version_id(&self) -> Result<Option<VersionId>, StorageError> {
        let id: Option<String> = self
            .conn
            .query_row(
                "SELECT version_id FROM internal_active_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(VersionId::from_string))
    }

    pub fn set_active_version(&mut self, id: &VersionId) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO internal_active_version (id, version_id) VALUES (1, ?1)
             ON CONFLICT (id) DO UPDATE SET version_id = excluded.version_id",
            [id.as_str()],
        )?;
        Ok(())
    }

    // ---- conflicts ----

    /// Insert unless a conflict with the same key and change set already exists.
    pub fn insert_conflict(&mut self, conflict: &ConflictRecord) -> Result<bool, StorageError> {
        let change_ids = serde_json::to_string(&conflict.change_ids)?;
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO internal_conflict (id, key, change_ids, entity_id, schema_key, file_id, source_version_id, target_version_id, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                conflict.id.as_str(),
                conflict.key,
                change_ids,
                conflict.entity.entity_id,
                conflict.entity.schema_key,
                conflict.entity.file_id,
                conflict.source_version_id.as_str(),
                conflict.target_version_id.as_str(),
                conflict.message,
                encode_timestamp(&conflict.created_at),
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn list_conflicts(&self) -> Result<Vec<ConflictRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, key, change_ids, entity_id, schema_key, file_id, source_version_id, target_version_id, message, created_at
             FROM internal_conflict ORDER BY rowid",
        )?;
        let mut rows = stmt.query([])?;
        let mut conflicts = Vec::new();
        while let Some(row) = rows.next()? {
            let change_ids: String = row.get(2)?;
            let created_at: String = row.get(9)?;
            conflicts.push(ConflictRecord {
                id: ConflictId::from_string(row.get::<_, String>(0)?),
                key: row.get(1)?,
                change_ids: serde_json::from_str(&change_ids)?,
                entity: verstate_core::EntityKey::new(
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ),
                source_version_id: VersionId::from_string(row.get::<_, String>(6)?),
                target_version_id: VersionId::from_string(row.get::<_, String>(7)?),
                message: row.get(8)?,
                created_at: decode_timestamp(&created_at)?,
            });
        }
        Ok(conflicts)
    }

    // ---- logs ----

    pub fn insert_log(&mut self, event: &LogEvent) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO internal_log (key, level, message, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![event.key, event.level.as_str(), event.message, now()],
        )?;
        Ok(())
    }

    pub fn list_logs(&self) -> Result<Vec<LogRecord>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, key, level, message, created_at FROM internal_log ORDER BY id")?;
        let mut rows = stmt.query([])?;
        let mut logs = Vec::new();
        while let Some(row) = rows.next()? {
            let level: String = row.get(2)?;
            let created_at: String = row.get(4)?;
            logs.push(LogRecord {
                id: row.get(0)?,
                event: LogEvent {
                    key: row.get(1)?,
                    level: LogLevel::parse(&level)?,
                    message: row.get(3)?,
                },
                created_at: decode_timestamp(&created_at)?,
            });
        }
        Ok(logs)
    }

    // ---- file queue ----

    pub fn enqueue_file(&mut self, file: &FileChange) -> Result<i64, StorageError> {
        self.conn.execute(
            "INSERT INTO internal_file_queue (file_id, path, version_id, data_before, data_after, skip_change_detection)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                file.file_id,
                file.path,
                file.version_id.as_ref().map(|v| v.as_str()),
                file.before,
                file.after,
                file.skip_change_detection,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn next_queued_file(&self) -> Result<Option<QueuedFile>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, file_id, path, version_id, data_before, data_after, skip_change_detection
                 FROM internal_file_queue ORDER BY id LIMIT 1",
                [],
                |row| {
                    Ok(QueuedFile {
                        id: row.get(0)?,
                        file: FileChange {
                            file_id: row.get(1)?,
                            path: row.get(2)?,
                            version_id: row.get::<_, Option<String>>(3)?.map(VersionId::from_string),
                            before: row.get(4)?,
                            after: row.get(5)?,
                            skip_change_detection: row.get(6)?,
                        },
                    })
                },
            )
            .optional()?)
    }

    pub fn remove_queued_file(&mut self, id: i64) -> Result<(), StorageError> {
        self.conn
            .execute("DELETE FROM internal_file_queue WHERE id = ?1", [id])?;
        Ok(())
    }

    pub fn queued_file_count(&self) -> Result<u64, StorageError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM internal_file_queue", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ---- staged writes ----

    /// Drain the staging table in write order.
    pub fn take_staged_writes(&mut self) -> Result<Vec<StagedWrite>, StorageError> {
        let writes = {
            let mut stmt = self.conn.prepare(
                "SELECT seq, entity_id, schema_key, file_id, plugin_key, schema_version, version_id, snapshot_content, metadata, untracked, origin_entity_id
                 FROM internal_state_writes ORDER BY seq",
            )?;
            stmt.query_map([], |row| {
                Ok(StagedWrite {
                    seq: row.get(0)?,
                    entity_id: row.get(1)?,
                    schema_key: row.get(2)?,
                    file_id: row.get(3)?,
                    plugin_key: row.get(4)?,
                    schema_version: row.get(5)?,
                    version_id: row.get(6)?,
                    snapshot_content: row.get(7)?,
                    metadata: row.get(8)?,
                    untracked: row.get::<_, Option<bool>>(9)?.unwrap_or(false),
                    origin_entity_id: row.get(10)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?
        };
        self.conn.execute("DELETE FROM internal_state_writes", [])?;
        Ok(writes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::cache_table_name;
    use verstate_core::schema::PropertyType;

    fn note_schema() -> Schema {
        Schema::new("note", "1.0")
            .property("id", PropertyType::String)
            .primary_key(&["id"])
    }

    #[test]
    fn builtin_schemas_are_stored_on_open() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let keys: Vec<String> = storage
            .load_schemas()
            .unwrap()
            .into_iter()
            .map(|s| s.key)
            .collect();
        assert_eq!(keys, vec!["sys_commit", "sys_commit_edge", "sys_change_set"]);
    }

    #[test]
    fn graph_cache_tables_exist_on_open() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        for key in ["sys_commit", "sys_commit_edge", "sys_change_set"] {
            let found: i64 = storage
                .conn()
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [cache_table_name(key)],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(found, 1, "{key}");
        }
    }

    #[test]
    fn schema_redefinition_is_rejected() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        assert!(storage.store_schema(&note_schema()).unwrap());
        assert!(!storage.store_schema(&note_schema()).unwrap());

        let changed = note_schema().immutable();
        let err = storage.store_schema(&changed).unwrap_err();
        assert!(matches!(err, StorageError::SchemaRedefinition { .. }));
    }

    #[test]
    fn reopen_keeps_schemas() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let path = path.to_str().unwrap();
        {
            let mut storage = SqliteStorage::open(path).unwrap();
            storage.store_schema(&note_schema()).unwrap();
        }
        let storage = SqliteStorage::open(path).unwrap();
        assert_eq!(storage.get_schema("note", "1.0").unwrap(), Some(note_schema()));
    }

    #[test]
    fn file_queue_is_fifo() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        for path in ["/a.txt", "/b.txt"] {
            storage
                .enqueue_file(&FileChange {
                    file_id: path.to_string(),
                    path: path.to_string(),
                    after: Some(b"x".to_vec()),
                    ..Default::default()
                })
                .unwrap();
        }
        let first = storage.next_queued_file().unwrap().unwrap();
        assert_eq!(first.file.path, "/a.txt");
        assert_eq!(first.file.after.as_deref(), Some(&b"x"[..]));
        storage.remove_queued_file(first.id).unwrap();
        assert_eq!(storage.queued_file_count().unwrap(), 1);
    }
}
