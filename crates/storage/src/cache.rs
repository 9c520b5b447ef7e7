//! Per-schema cache tables.
//!
//! Every schema key owns one physical table holding the materialized state
//! of each version: a live snapshot, or a tombstone recording that the
//! version deleted the entity. Reads resolve a version's state by layering
//! its own rows over the rows inherited from the global version, with
//! untracked rows taking precedence at each level.

use std::collections::{BTreeMap, HashMap};

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::json;

use verstate_core::{
    change::{Change, Commit, DEFAULT_FILE_ID, ENTITY_ID_SEPARATOR, Version, encode_timestamp},
    ids::*,
    schema::{
        CHANGE_SET_SCHEMA_KEY, COMMIT_EDGE_SCHEMA_KEY, COMMIT_SCHEMA_KEY, builtin_schemas,
        is_graph_schema,
    },
};

use crate::error::StorageError;
use crate::sqlite::{SqliteStorage, from_json_text, to_json_text};
use crate::traits::{CacheRow, CacheScope, CacheStore, GraphStore, StateRow};

const CACHE_TABLE_PREFIX: &str = "internal_cache_";

/// Columns of the resolved state produced by [`resolved_state_sql`].
pub const STATE_COLUMNS: [&str; 14] = [
    "entity_id",
    "schema_key",
    "file_id",
    "version_id",
    "plugin_key",
    "schema_version",
    "snapshot_content",
    "metadata",
    "change_id",
    "commit_id",
    "inherited_from_version_id",
    "untracked",
    "created_at",
    "updated_at",
];

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Physical table name for a schema key.
///
/// Keys that are not already lowercase identifiers get a hash suffix so two
/// keys can never sanitize to the same table.
pub fn cache_table_name(schema_key: &str) -> String {
    let sanitized: String = schema_key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if sanitized == schema_key {
        format!("{CACHE_TABLE_PREFIX}{sanitized}")
    } else {
        let hash = blake3::hash(schema_key.as_bytes()).to_hex();
        format!("{CACHE_TABLE_PREFIX}{sanitized}_{}", &hash[..8])
    }
}

fn cache_table_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" (
            entity_id TEXT NOT NULL,
            schema_key TEXT NOT NULL,
            file_id TEXT NOT NULL,
            version_id TEXT NOT NULL,
            plugin_key TEXT NOT NULL,
            schema_version TEXT NOT NULL,
            snapshot_content TEXT,
            metadata TEXT,
            change_id TEXT NOT NULL,
            commit_id TEXT NOT NULL,
            inherited_from_version_id TEXT,
            inheritance_delete_marker INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (entity_id, file_id, version_id)
        ) WITHOUT ROWID;
        CREATE INDEX IF NOT EXISTS \"{table}_version\" ON \"{table}\" (version_id, inheritance_delete_marker);"
    )
}

/// SQL producing the live state of one schema for every version.
///
/// Candidates are ranked per `(entity_id, file_id, version_id)`: local
/// untracked, local tracked, global untracked, global tracked. The first
/// candidate wins and a winning tombstone hides the entity.
pub fn resolved_state_sql(schema_key: &str) -> String {
    let table = cache_table_name(schema_key);
    let key = quote_literal(schema_key);
    let global = quote_literal(GLOBAL_VERSION_ID);
    format!(
        "SELECT entity_id, schema_key, file_id, version_id, plugin_key, schema_version, snapshot_content, metadata, change_id, commit_id, inherited_from_version_id, untracked, created_at, updated_at \
         FROM (SELECT c.*, ROW_NUMBER() OVER (PARTITION BY c.entity_id, c.file_id, c.version_id ORDER BY c.depth, c.untracked DESC) AS rn FROM (\
         SELECT entity_id, schema_key, file_id, version_id, plugin_key, schema_version, snapshot_content, metadata, change_id, commit_id, NULL AS inherited_from_version_id, 0 AS untracked, inheritance_delete_marker AS marker, created_at, updated_at, 0 AS depth \
         FROM \"{table}\" \
         UNION ALL SELECT entity_id, schema_key, file_id, version_id, plugin_key, schema_version, snapshot_content, metadata, NULL, NULL, NULL, 1, inheritance_delete_marker, created_at, updated_at, 0 \
         FROM internal_untracked WHERE schema_key = {key} \
         UNION ALL SELECT t.entity_id, t.schema_key, t.file_id, v.id, t.plugin_key, t.schema_version, t.snapshot_content, t.metadata, t.change_id, t.commit_id, t.version_id, 0, t.inheritance_delete_marker, t.created_at, t.updated_at, 1 \
         FROM \"{table}\" t JOIN internal_version v ON v.id <> {global} WHERE t.version_id = {global} \
         UNION ALL SELECT u.entity_id, u.schema_key, u.file_id, v.id, u.plugin_key, u.schema_version, u.snapshot_content, u.metadata, NULL, NULL, u.version_id, 1, u.inheritance_delete_marker, u.created_at, u.updated_at, 1 \
         FROM internal_untracked u JOIN internal_version v ON v.id <> {global} WHERE u.version_id = {global} AND u.schema_key = {key}\
         ) AS c) WHERE rn = 1 AND marker = 0"
    )
}

#[derive(Debug, Clone)]
struct CacheTable {
    name: String,
    fingerprint: Option<String>,
}

/// Schema key to cache table handle, created lazily.
///
/// Handles remember the fingerprint of the schema they were created for and
/// are re-ensured when a newer definition is stored.
#[derive(Debug, Default)]
pub struct CacheTableRegistry {
    tables: HashMap<String, CacheTable>,
}

impl CacheTableRegistry {
    pub fn ensure(&mut self, conn: &Connection, schema_key: &str) -> Result<String, StorageError> {
        let fingerprint: Option<String> = conn
            .query_row(
                "SELECT fingerprint FROM internal_stored_schema WHERE key = ?1 ORDER BY rowid DESC LIMIT 1",
                [schema_key],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(table) = self.tables.get(schema_key)
            && table.fingerprint == fingerprint
        {
            return Ok(table.name.clone());
        }
        let name = cache_table_name(schema_key);
        conn.execute_batch(&cache_table_ddl(&name))?;
        tracing::debug!(schema_key, table = %name, "cache table ready");
        self.tables.insert(
            schema_key.to_string(),
            CacheTable {
                name: name.clone(),
                fingerprint,
            },
        );
        Ok(name)
    }

    pub fn invalidate(&mut self, schema_key: &str) {
        self.tables.remove(schema_key);
    }

    /// Forget every handle. Tables created by a rolled back transaction are
    /// gone, so each one has to be ensured again.
    pub fn clear(&mut self) {
        self.tables.clear();
    }
}

/// One row to write into a cache table.
struct RowWrite<'a> {
    entity_id: String,
    schema_key: &'a str,
    file_id: &'a str,
    plugin_key: &'a str,
    schema_version: &'a str,
    snapshot_content: Option<String>,
    metadata: Option<String>,
    change: &'a Change,
    version_id: &'a VersionId,
    commit_id: &'a CommitId,
}

impl<'a> RowWrite<'a> {
    fn from_change(
        change: &'a Change,
        version_id: &'a VersionId,
        commit_id: &'a CommitId,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            entity_id: change.entity_id.clone(),
            schema_key: &change.schema_key,
            file_id: &change.file_id,
            plugin_key: &change.plugin_key,
            schema_version: &change.schema_version,
            snapshot_content: to_json_text(change.snapshot_content.as_ref())?,
            metadata: to_json_text(change.metadata.as_ref())?,
            change,
            version_id,
            commit_id,
        })
    }
}

fn write_row(conn: &Connection, table: &str, row: &RowWrite<'_>) -> Result<(), StorageError> {
    let stamp = encode_timestamp(&row.change.created_at);
    if row.snapshot_content.is_none() {
        // hard-delete the live row, then record the tombstone
        conn.execute(
            &format!(
                "DELETE FROM \"{table}\" WHERE entity_id = ?1 AND file_id = ?2 AND version_id = ?3 AND inheritance_delete_marker = 0"
            ),
            params![row.entity_id, row.file_id, row.version_id.as_str()],
        )?;
    }
    conn.execute(
        &format!(
            "INSERT INTO \"{table}\" (entity_id, schema_key, file_id, version_id, plugin_key, schema_version, snapshot_content, metadata, change_id, commit_id, inherited_from_version_id, inheritance_delete_marker, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, ?11, ?12, ?12)
             ON CONFLICT (entity_id, file_id, version_id) DO UPDATE SET
                plugin_key = excluded.plugin_key,
                schema_version = excluded.schema_version,
                snapshot_content = excluded.snapshot_content,
                metadata = excluded.metadata,
                change_id = excluded.change_id,
                commit_id = excluded.commit_id,
                inherited_from_version_id = NULL,
                inheritance_delete_marker = excluded.inheritance_delete_marker,
                updated_at = excluded.updated_at"
        ),
        params![
            row.entity_id,
            row.schema_key,
            row.file_id,
            row.version_id.as_str(),
            row.plugin_key,
            row.schema_version,
            row.snapshot_content,
            row.metadata,
            row.change.id.as_str(),
            row.commit_id.as_str(),
            row.snapshot_content.is_none(),
            stamp,
        ],
    )?;
    Ok(())
}

/// Rows derived from a commit's bookkeeping change: the commit itself, one
/// edge per parent and the change-set placeholder.
fn graph_rows<'a>(
    change: &'a Change,
    global: &'a VersionId,
    commit_id: &'a CommitId,
) -> Result<Vec<RowWrite<'a>>, StorageError> {
    let mut rows = vec![RowWrite::from_change(change, global, commit_id)?];
    let Some(snapshot) = change.snapshot_content.as_ref() else {
        return Ok(rows);
    };
    let commit = Commit::from_snapshot(snapshot)?;
    for parent in &commit.parent_commit_ids {
        rows.push(RowWrite {
            entity_id: format!("{parent}{ENTITY_ID_SEPARATOR}{}", commit.id),
            schema_key: COMMIT_EDGE_SCHEMA_KEY,
            file_id: DEFAULT_FILE_ID,
            plugin_key: &change.plugin_key,
            schema_version: &change.schema_version,
            snapshot_content: Some(serde_json::to_string(
                &json!({"parent_id": parent, "child_id": commit.id}),
            )?),
            metadata: None,
            change,
            version_id: global,
            commit_id,
        });
    }
    rows.push(RowWrite {
        entity_id: commit.change_set_id.to_string(),
        schema_key: CHANGE_SET_SCHEMA_KEY,
        file_id: DEFAULT_FILE_ID,
        plugin_key: &change.plugin_key,
        schema_version: &change.schema_version,
        snapshot_content: Some(serde_json::to_string(
            &json!({"id": commit.change_set_id}),
        )?),
        metadata: None,
        change,
        version_id: global,
        commit_id,
    });
    Ok(rows)
}

fn set_watermark(
    conn: &Connection,
    schema_key: &str,
    version_id: &VersionId,
    commit_id: &CommitId,
) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO internal_cache_watermark (schema_key, version_id, commit_id) VALUES (?1, ?2, ?3)
         ON CONFLICT (schema_key, version_id) DO UPDATE SET commit_id = excluded.commit_id",
        params![schema_key, version_id.as_str(), commit_id.as_str()],
    )?;
    Ok(())
}

impl SqliteStorage {
    /// Create the cache table of a schema if needed and return its name.
    pub fn ensure_cache_table(&mut self, schema_key: &str) -> Result<String, StorageError> {
        self.caches.ensure(&self.conn, schema_key)
    }

    /// Drop cached table handles after a rollback.
    pub fn reset_cache_tables(&mut self) {
        self.caches.clear();
    }
}

impl CacheStore for SqliteStorage {
    fn update_cache(&mut self, changes: &[Change], scope: &CacheScope) -> Result<(), StorageError> {
        let (Some(version_id), Some(commit_id)) = (&scope.version_id, &scope.commit_id) else {
            let missing = match (&scope.version_id, &scope.commit_id) {
                (None, None) => "version_id and commit_id",
                (None, _) => "version_id",
                _ => "commit_id",
            };
            tracing::error!(missing, changes = changes.len(), "cache update without scope");
            return Err(StorageError::CacheConsistency(format!(
                "cache update of {} change(s) is missing {missing}",
                changes.len()
            )));
        };

        let global = VersionId::global();
        let mut grouped: BTreeMap<&str, Vec<RowWrite<'_>>> = BTreeMap::new();
        for change in changes {
            if change.schema_key == COMMIT_SCHEMA_KEY {
                for row in graph_rows(change, &global, commit_id)? {
                    grouped.entry(row.schema_key).or_default().push(row);
                }
            } else if is_graph_schema(&change.schema_key) {
                grouped
                    .entry(&change.schema_key)
                    .or_default()
                    .push(RowWrite::from_change(change, &global, commit_id)?);
            } else {
                grouped
                    .entry(&change.schema_key)
                    .or_default()
                    .push(RowWrite::from_change(change, version_id, commit_id)?);
            }
        }

        let sp = self.conn.savepoint()?;
        for (schema_key, rows) in &grouped {
            let table = self.caches.ensure(&sp, schema_key)?;
            for row in rows {
                write_row(&sp, &table, row)?;
            }
        }
        sp.commit()?;
        tracing::trace!(
            version = %version_id,
            commit = %commit_id,
            changes = changes.len(),
            "cache updated"
        );
        Ok(())
    }

    fn cache_rows(
        &mut self,
        schema_key: &str,
        version_id: &VersionId,
    ) -> Result<Vec<CacheRow>, StorageError> {
        let table = self.ensure_cache_table(schema_key)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT entity_id, schema_key, file_id, version_id, plugin_key, schema_version, snapshot_content, metadata, change_id, commit_id, inherited_from_version_id, inheritance_delete_marker
             FROM \"{table}\" WHERE version_id = ?1 ORDER BY entity_id, file_id"
        ))?;
        let mut rows = stmt.query([version_id.as_str()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(CacheRow {
                entity_id: row.get(0)?,
                schema_key: row.get(1)?,
                file_id: row.get(2)?,
                version_id: VersionId::from_string(row.get::<_, String>(3)?),
                plugin_key: row.get(4)?,
                schema_version: row.get(5)?,
                snapshot_content: from_json_text(row.get(6)?)?,
                metadata: from_json_text(row.get(7)?)?,
                change_id: ChangeId::from_string(row.get::<_, String>(8)?),
                commit_id: CommitId::from_string(row.get::<_, String>(9)?),
                inherited_from_version_id: row
                    .get::<_, Option<String>>(10)?
                    .map(VersionId::from_string),
                inheritance_delete_marker: row.get(11)?,
            });
        }
        Ok(out)
    }

    fn live_state(
        &mut self,
        schema_key: &str,
        version_id: &VersionId,
    ) -> Result<Vec<StateRow>, StorageError> {
        self.ensure_cache_table(schema_key)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT entity_id, schema_key, file_id, version_id, plugin_key, schema_version, snapshot_content, metadata, change_id, commit_id, inherited_from_version_id, untracked
             FROM ({}) WHERE version_id = ?1 ORDER BY entity_id, file_id",
            resolved_state_sql(schema_key)
        ))?;
        let mut rows = stmt.query([version_id.as_str()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let snapshot: Option<String> = row.get(6)?;
            let Some(snapshot_content) = from_json_text(snapshot)? else {
                continue;
            };
            out.push(StateRow {
                entity_id: row.get(0)?,
                schema_key: row.get(1)?,
                file_id: row.get(2)?,
                version_id: VersionId::from_string(row.get::<_, String>(3)?),
                plugin_key: row.get(4)?,
                schema_version: row.get(5)?,
                snapshot_content,
                metadata: from_json_text(row.get(7)?)?,
                change_id: row.get::<_, Option<String>>(8)?.map(ChangeId::from_string),
                commit_id: row.get::<_, Option<String>>(9)?.map(CommitId::from_string),
                inherited_from_version_id: row
                    .get::<_, Option<String>>(10)?
                    .map(VersionId::from_string),
                untracked: row.get(11)?,
            });
        }
        Ok(out)
    }

    fn rebuild_cache(&mut self, version: &Version, schema_keys: &[String]) -> Result<(), StorageError> {
        let leaves = self.resolve_leaf_changes(&version.commit_id)?;
        let sp = self.conn.savepoint()?;
        for schema_key in schema_keys {
            if is_graph_schema(schema_key) {
                continue;
            }
            let table = self.caches.ensure(&sp, schema_key)?;
            sp.execute(
                &format!("DELETE FROM \"{table}\" WHERE version_id = ?1"),
                [version.id.as_str()],
            )?;
            let mut written = 0usize;
            for leaf in leaves.values().filter(|l| &l.change.schema_key == schema_key) {
                let row = RowWrite::from_change(&leaf.change, &version.id, &leaf.commit_id)?;
                write_row(&sp, &table, &row)?;
                written += 1;
            }
            set_watermark(&sp, schema_key, &version.id, &version.commit_id)?;
            tracing::debug!(
                schema_key = %schema_key,
                version = %version.id,
                rows = written,
                "cache rebuilt"
            );
        }
        sp.commit()?;
        Ok(())
    }

    fn rebuild_graph_cache(&mut self) -> Result<(), StorageError> {
        let commits = self.commit_changes()?;
        let global = VersionId::global();
        let sp = self.conn.savepoint()?;
        let mut tables = HashMap::new();
        for schema in builtin_schemas() {
            let table = self.caches.ensure(&sp, &schema.key)?;
            sp.execute(&format!("DELETE FROM \"{table}\""), [])?;
            tables.insert(schema.key, table);
        }
        for change in &commits {
            let commit_id = CommitId::from_string(change.entity_id.clone());
            for row in graph_rows(change, &global, &commit_id)? {
                let table = tables.get(row.schema_key).ok_or_else(|| {
                    StorageError::CacheConsistency(format!("no cache table for {}", row.schema_key))
                })?;
                write_row(&sp, table, &row)?;
            }
        }
        sp.commit()?;
        tracing::debug!(commits = commits.len(), "graph cache rebuilt");
        Ok(())
    }

    fn watermark(
        &self,
        schema_key: &str,
        version_id: &VersionId,
    ) -> Result<Option<CommitId>, StorageError> {
        let commit: Option<String> = self
            .conn
            .query_row(
                "SELECT commit_id FROM internal_cache_watermark WHERE schema_key = ?1 AND version_id = ?2",
                params![schema_key, version_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(commit.map(CommitId::from_string))
    }

    fn advance_watermarks(
        &mut self,
        version_id: &VersionId,
        from: &CommitId,
        to: &CommitId,
    ) -> Result<usize, StorageError> {
        Ok(self.conn.execute(
            "UPDATE internal_cache_watermark SET commit_id = ?3 WHERE version_id = ?1 AND commit_id = ?2",
            params![version_id.as_str(), from.as_str(), to.as_str()],
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verstate_core::change::EntityKey;

    #[test]
    fn table_names_are_collision_free() {
        assert_eq!(cache_table_name("todo_item"), "internal_cache_todo_item");
        let upper = cache_table_name("Todo_item");
        assert!(upper.starts_with("internal_cache_todo_item_"));
        assert_ne!(upper, cache_table_name("todo_item"));
        assert_ne!(cache_table_name("a-b"), cache_table_name("a.b"));
    }

    #[test]
    fn missing_scope_is_an_error() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let change = Change::new(&EntityKey::new("e1", "k", "f"), "1.0", "p", Some(json!({})));
        let scope = CacheScope {
            version_id: Some(VersionId::global()),
            commit_id: None,
        };
        let err = storage.update_cache(&[change], &scope).unwrap_err();
        assert!(matches!(err, StorageError::CacheConsistency(_)));
    }

    #[test]
    fn deletion_replaces_live_row_with_tombstone() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let key = EntityKey::new("e1", "k", "f");
        let version = VersionId::from("v");
        let commit = CommitId::from("c1");
        let insert = Change::new(&key, "1.0", "p", Some(json!({"v": 1})));
        storage
            .update_cache(&[insert], &CacheScope::new(&version, &commit))
            .unwrap();
        let delete = Change::new(&key, "1.0", "p", None);
        storage
            .update_cache(&[delete.clone()], &CacheScope::new(&version, &commit))
            .unwrap();

        let rows = storage.cache_rows("k", &version).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_tombstone());
        assert_eq!(rows[0].snapshot_content, None);
        assert_eq!(rows[0].change_id, delete.id);
    }
}
