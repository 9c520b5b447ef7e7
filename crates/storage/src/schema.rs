use rusqlite::Connection;

use crate::error::StorageError;

pub const STORE_FORMAT_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -32000;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(VIEW_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS internal_store_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO internal_store_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS internal_stored_schema (
    key TEXT NOT NULL,
    version TEXT NOT NULL,
    definition TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (key, version)
);

CREATE TABLE IF NOT EXISTS internal_change (
    id TEXT PRIMARY KEY,
    entity_id TEXT NOT NULL,
    schema_key TEXT NOT NULL,
    schema_version TEXT NOT NULL,
    file_id TEXT NOT NULL,
    plugin_key TEXT NOT NULL,
    snapshot_content TEXT,
    metadata TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_change_entity ON internal_change (schema_key, entity_id, file_id);

CREATE TRIGGER IF NOT EXISTS internal_change_no_update BEFORE UPDATE ON internal_change
BEGIN
    SELECT RAISE(ABORT, 'changes are immutable');
END;
CREATE TRIGGER IF NOT EXISTS internal_change_no_delete BEFORE DELETE ON internal_change
BEGIN
    SELECT RAISE(ABORT, 'changes are immutable');
END;

CREATE TABLE IF NOT EXISTS internal_change_set (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS internal_change_set_element (
    change_set_id TEXT NOT NULL REFERENCES internal_change_set (id),
    position INTEGER NOT NULL,
    change_id TEXT NOT NULL REFERENCES internal_change (id),
    entity_id TEXT NOT NULL,
    schema_key TEXT NOT NULL,
    file_id TEXT NOT NULL,
    PRIMARY KEY (change_set_id, position),
    UNIQUE (change_set_id, entity_id, schema_key, file_id)
);
CREATE INDEX IF NOT EXISTS idx_change_set_element_change ON internal_change_set_element (change_id);

CREATE TABLE IF NOT EXISTS internal_commit (
    id TEXT PRIMARY KEY,
    change_set_id TEXT NOT NULL UNIQUE REFERENCES internal_change_set (id),
    parent_commit_ids TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS internal_commit_no_update BEFORE UPDATE ON internal_commit
BEGIN
    SELECT RAISE(ABORT, 'commits are immutable');
END;
CREATE TRIGGER IF NOT EXISTS internal_commit_no_delete BEFORE DELETE ON internal_commit
BEGIN
    SELECT RAISE(ABORT, 'commits are immutable');
END;

CREATE TABLE IF NOT EXISTS internal_version (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    commit_id TEXT NOT NULL REFERENCES internal_commit (id)
);

CREATE TABLE IF NOT EXISTS internal_active_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version_id TEXT NOT NULL REFERENCES internal_version (id)
);

CREATE TABLE IF NOT EXISTS internal_cache_watermark (
    schema_key TEXT NOT NULL,
    version_id TEXT NOT NULL,
    commit_id TEXT NOT NULL,
    PRIMARY KEY (schema_key, version_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS internal_untracked (
    entity_id TEXT NOT NULL,
    schema_key TEXT NOT NULL,
    file_id TEXT NOT NULL,
    version_id TEXT NOT NULL,
    plugin_key TEXT NOT NULL,
    schema_version TEXT NOT NULL,
    snapshot_content TEXT,
    metadata TEXT,
    inheritance_delete_marker INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (entity_id, schema_key, file_id, version_id)
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS idx_untracked_schema ON internal_untracked (schema_key, version_id);

CREATE TABLE IF NOT EXISTS internal_state_writes (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id TEXT,
    schema_key TEXT,
    file_id TEXT,
    plugin_key TEXT,
    schema_version TEXT,
    version_id TEXT,
    snapshot_content TEXT,
    metadata TEXT,
    untracked INTEGER NOT NULL DEFAULT 0,
    origin_entity_id TEXT
);

CREATE TABLE IF NOT EXISTS internal_conflict (
    id TEXT PRIMARY KEY,
    key TEXT NOT NULL,
    change_ids TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    schema_key TEXT NOT NULL,
    file_id TEXT NOT NULL,
    source_version_id TEXT NOT NULL,
    target_version_id TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (key, change_ids)
);

CREATE TABLE IF NOT EXISTS internal_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS internal_file_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id TEXT NOT NULL,
    path TEXT NOT NULL,
    version_id TEXT,
    data_before BLOB,
    data_after BLOB,
    skip_change_detection INTEGER NOT NULL DEFAULT 0
);
";

const VIEW_SQL: &str = "
CREATE VIEW IF NOT EXISTS version AS
    SELECT v.id, v.name, v.commit_id,
           v.id = (SELECT version_id FROM internal_active_version) AS is_active
    FROM internal_version v;

CREATE VIEW IF NOT EXISTS active_version AS
    SELECT v.id, v.name, v.commit_id
    FROM internal_version v
    JOIN internal_active_version a ON a.version_id = v.id;

CREATE VIEW IF NOT EXISTS change AS
    SELECT id, entity_id, schema_key, schema_version, file_id, plugin_key,
           snapshot_content, metadata, created_at
    FROM internal_change;

CREATE VIEW IF NOT EXISTS conflict AS
    SELECT id, key, change_ids, entity_id, schema_key, file_id,
           source_version_id, target_version_id, message, created_at
    FROM internal_conflict;

CREATE VIEW IF NOT EXISTS log AS
    SELECT id, key, level, message, created_at FROM internal_log;
";
