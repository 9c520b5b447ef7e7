use std::sync::Once;

use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use verstate_core::{
    change::{EntityKey, Version},
    ids::*,
    schema::{PropertyType, Schema},
};
use verstate_engine::{Engine, EngineConfig, EngineError, QueryResult};
use verstate_storage::{SqliteStorage, StateRow};

static TRACING: Once = Once::new();

/// Route engine logs to the test writer. Filtered by `RUST_LOG`, off by default.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub fn text(value: &str) -> SqlValue {
    SqlValue::Text(value.to_string())
}

pub fn int(value: i64) -> SqlValue {
    SqlValue::Integer(value)
}

/// `todo(id, title, done)` keyed by `id`.
pub fn todo_schema() -> Schema {
    Schema::new("todo", "1.0")
        .property("id", PropertyType::String)
        .property("title", PropertyType::String)
        .property("done", PropertyType::Boolean)
        .primary_key(&["id"])
}

/// An engine plus shortcuts for the statements tests repeat.
pub struct TestRepo {
    pub engine: Engine,
}

impl TestRepo {
    pub fn new() -> Result<Self, EngineError> {
        init_tracing();
        Ok(Self {
            engine: Engine::open_in_memory()?,
        })
    }

    pub fn open(path: &str) -> Result<Self, EngineError> {
        init_tracing();
        Ok(Self {
            engine: Engine::open(path)?,
        })
    }

    pub fn with_config(config: EngineConfig) -> Result<Self, EngineError> {
        init_tracing();
        Ok(Self {
            engine: Engine::with_config(SqliteStorage::open_in_memory()?, config)?,
        })
    }

    /// A repo with the `todo` schema registered.
    pub fn with_todos() -> Result<Self, EngineError> {
        let mut repo = Self::new()?;
        repo.engine.register_schema(todo_schema())?;
        Ok(repo)
    }

    pub fn exec(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, EngineError> {
        self.engine.execute(sql, params)
    }

    pub fn query(&mut self, sql: &str) -> Result<QueryResult, EngineError> {
        self.engine.execute(sql, &[])
    }

    pub fn insert_todo(&mut self, id: &str, title: &str) -> Result<(), EngineError> {
        self.exec(
            "INSERT INTO todo (id, title, done) VALUES (?, ?, 0)",
            &[text(id), text(title)],
        )?;
        Ok(())
    }

    pub fn insert_todo_in(
        &mut self,
        version: &VersionId,
        id: &str,
        title: &str,
    ) -> Result<(), EngineError> {
        self.exec(
            "INSERT INTO todo_by_version (id, title, done, sys_version_id) VALUES (?, ?, 0, ?)",
            &[text(id), text(title), text(version.as_str())],
        )?;
        Ok(())
    }

    pub fn set_title_in(
        &mut self,
        version: &VersionId,
        id: &str,
        title: &str,
    ) -> Result<(), EngineError> {
        self.exec(
            "UPDATE todo_by_version SET title = ? WHERE id = ? AND sys_version_id = ?",
            &[text(title), text(id), text(version.as_str())],
        )?;
        Ok(())
    }

    pub fn main(&self) -> Result<Version, EngineError> {
        self.engine.active_version()
    }

    pub fn head(&self, version: &VersionId) -> Result<CommitId, EngineError> {
        Ok(self.engine.version(version)?.commit_id)
    }

    pub fn branch(&mut self, name: &str) -> Result<Version, EngineError> {
        self.engine.create_version(name, None)
    }

    /// Live `todo` rows of a version, ordered by entity id.
    pub fn todos(&mut self, version: &VersionId) -> Result<Vec<StateRow>, EngineError> {
        let mut rows = self.engine.state("todo", version)?;
        rows.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(rows)
    }

    pub fn todo(&mut self, version: &VersionId, id: &str) -> Result<Option<Value>, EngineError> {
        let key = EntityKey::new(id, "todo", &self.engine.config().default_file_id);
        Ok(self
            .engine
            .entity(&key, version)?
            .map(|row| row.snapshot_content))
    }

    pub fn title(&mut self, version: &VersionId, id: &str) -> Result<Option<String>, EngineError> {
        Ok(self
            .todo(version, id)?
            .and_then(|s| s.get("title").and_then(Value::as_str).map(String::from)))
    }

    pub fn count(&mut self, sql: &str) -> Result<i64, Box<dyn std::error::Error>> {
        let result = self.query(sql)?;
        match result.rows.first().and_then(|r| r.first()) {
            Some(SqlValue::Integer(n)) => Ok(*n),
            other => Err(format!("expected a count from '{sql}', got {other:?}").into()),
        }
    }
}
