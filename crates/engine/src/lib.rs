pub mod config;
pub mod error;
pub mod ingest;
pub mod merge;
pub mod sql;
pub mod transition;
mod validation;
mod write;

pub use config::EngineConfig;
pub use error::EngineError;
pub use ingest::QueueReport;
pub use merge::MergeOutcome;
pub use sql::{Prepared, SchemaCatalog, StatementKind};

use std::collections::BTreeSet;

use rusqlite::types::Value as SqlValue;
use verstate_core::{
    change::{EntityKey, Version},
    ids::*,
    log::{LogEvent, LogLevel},
    plugin::Plugin,
    schema::{Schema, is_graph_schema},
};
use verstate_storage::{
    CacheStore, ConflictRecord, GraphStore, LogRecord, SqliteStorage, StateRow,
};

pub const MAIN_VERSION_NAME: &str = "main";
const SAVEPOINT: &str = "verstate_op";

/// Rows and columns returned by [`Engine::execute`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    /// Rows changed by a statement that returns no columns.
    pub rows_affected: usize,
}

impl QueryResult {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&SqlValue> {
        let index = self.column_index(column)?;
        self.rows.get(row)?.get(index)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub struct Engine {
    storage: SqliteStorage,
    config: EngineConfig,
    catalog: SchemaCatalog,
    plugins: Vec<Plugin>,
    /// Set while caches are rebuilt so nested freshness checks return early.
    refreshing: bool,
}

impl Engine {
    pub fn open(path: &str) -> Result<Self, EngineError> {
        Self::with_config(SqliteStorage::open(path)?, EngineConfig::default())
    }

    pub fn open_in_memory() -> Result<Self, EngineError> {
        Self::with_config(SqliteStorage::open_in_memory()?, EngineConfig::default())
    }

    /// Wrap opened storage. A store without versions gets `global` and an
    /// active `main`, each on an empty root commit.
    pub fn with_config(storage: SqliteStorage, config: EngineConfig) -> Result<Self, EngineError> {
        let mut engine = Self {
            storage,
            config,
            catalog: SchemaCatalog::default(),
            plugins: Vec::new(),
            refreshing: false,
        };
        for schema in engine.storage.load_schemas()? {
            engine.catalog.insert(schema);
        }
        if engine.storage.get_version(&VersionId::global())?.is_none() {
            engine.in_transaction(|engine| engine.bootstrap())?;
        }
        Ok(engine)
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    fn exec_batch(&self, sql: &str) -> Result<(), EngineError> {
        self.storage.conn().execute_batch(sql)?;
        Ok(())
    }

    /// Run `f` atomically. Opens a transaction, or a savepoint when one is
    /// already open, and rolls back whatever `f` did if it fails.
    pub(crate) fn in_transaction<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let nested = !self.storage.conn().is_autocommit();
        if nested {
            self.exec_batch(&format!("SAVEPOINT {SAVEPOINT}"))?;
        } else {
            self.exec_batch("BEGIN IMMEDIATE")?;
        }

        match f(self) {
            Ok(value) => {
                if nested {
                    self.exec_batch(&format!("RELEASE {SAVEPOINT}"))?;
                } else {
                    self.exec_batch("COMMIT")?;
                }
                Ok(value)
            }
            Err(e) => {
                self.storage.reset_cache_tables();
                if nested {
                    let _ = self.exec_batch(&format!(
                        "ROLLBACK TO {SAVEPOINT}; RELEASE {SAVEPOINT}"
                    ));
                } else {
                    let _ = self.exec_batch("ROLLBACK");
                }
                Err(e)
            }
        }
    }

    fn bootstrap(&mut self) -> Result<(), EngineError> {
        let global_root = self.record_commit(&[], &[], Vec::new())?;
        self.storage.insert_version(&Version {
            id: VersionId::global(),
            name: GLOBAL_VERSION_ID.to_string(),
            commit_id: global_root.id,
        })?;

        let main_root = self.record_commit(&[], &[], Vec::new())?;
        let main = Version {
            id: VersionId::new(),
            name: MAIN_VERSION_NAME.to_string(),
            commit_id: main_root.id,
        };
        self.storage.insert_version(&main)?;
        self.storage.set_active_version(&main.id)?;
        tracing::info!(main = %main.id, "store initialized");
        Ok(())
    }

    pub(crate) fn log_event(&mut self, event: LogEvent) -> Result<(), EngineError> {
        match event.level {
            LogLevel::Debug => tracing::debug!(key = %event.key, "{}", event.message),
            LogLevel::Info => tracing::info!(key = %event.key, "{}", event.message),
            LogLevel::Warn => tracing::warn!(key = %event.key, "{}", event.message),
            LogLevel::Error => tracing::error!(key = %event.key, "{}", event.message),
        }
        if self.config.persist_log_events {
            self.storage.insert_log(&event)?;
        }
        Ok(())
    }

    // ====================================================================
    // Schemas
    // ====================================================================

    /// Store a schema definition and make it the current one for its key.
    /// Returns `false` when the identical definition was already stored.
    pub fn register_schema(&mut self, schema: Schema) -> Result<bool, EngineError> {
        schema.validate()?;
        if schema.key.starts_with("sys_") {
            return Err(EngineError::schema(&schema.key, "the sys_ prefix is reserved"));
        }
        for fk in &schema.foreign_keys {
            let target = &fk.references.schema_key;
            if *target != schema.key && !self.catalog.contains(target) {
                return Err(EngineError::schema(
                    &schema.key,
                    format!("foreign key references unknown schema '{target}'"),
                ));
            }
        }

        let stored = self.in_transaction(|engine| {
            let stored = engine.storage.store_schema(&schema)?;
            engine.storage.ensure_cache_table(&schema.key)?;
            Ok(stored)
        })?;
        if stored {
            tracing::info!(key = %schema.key, version = %schema.version, "schema registered");
            self.catalog.insert(schema);
        }
        Ok(stored)
    }

    pub fn schema(&self, key: &str) -> Option<&Schema> {
        self.catalog.get(key)
    }

    // ====================================================================
    // Versions
    // ====================================================================

    pub fn version(&self, id: &VersionId) -> Result<Version, EngineError> {
        self.storage
            .get_version(id)?
            .ok_or_else(|| EngineError::VersionNotFound(id.to_string()))
    }

    pub fn active_version(&self) -> Result<Version, EngineError> {
        let id = self
            .storage
            .active_version_id()?
            .ok_or_else(|| EngineError::VersionNotFound("no active version".into()))?;
        self.version(&id)
    }

    pub fn version_by_name(&self, name: &str) -> Result<Option<Version>, EngineError> {
        Ok(self.storage.version_by_name(name)?)
    }

    pub fn list_versions(&self) -> Result<Vec<Version>, EngineError> {
        Ok(self.storage.list_versions()?)
    }

    /// Create a version pointing at `from`, or at the active version's commit.
    pub fn create_version(
        &mut self,
        name: &str,
        from: Option<&CommitId>,
    ) -> Result<Version, EngineError> {
        if self.storage.version_by_name(name)?.is_some() {
            return Err(EngineError::VersionExists(name.to_string()));
        }
        let commit_id = match from {
            Some(id) => {
                if self.storage.get_commit(id)?.is_none() {
                    return Err(EngineError::CommitNotFound(id.to_string()));
                }
                id.clone()
            }
            None => self.active_version()?.commit_id,
        };
        let version = Version {
            id: VersionId::new(),
            name: name.to_string(),
            commit_id,
        };
        self.storage.insert_version(&version)?;
        tracing::info!(version = %version.id, name, commit = %version.commit_id, "version created");
        Ok(version)
    }

    pub fn switch_version(&mut self, id: &VersionId) -> Result<(), EngineError> {
        self.version(id)?;
        self.storage.set_active_version(id)?;
        tracing::info!(version = %id, "active version switched");
        Ok(())
    }

    // ====================================================================
    // SQL surface
    // ====================================================================

    /// Execute one statement, rewriting entity and state views first.
    ///
    /// Writes through the views are committed as changes before this returns.
    pub fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, EngineError> {
        let prepared = sql::prepare(sql, &self.catalog, &self.config)?;
        if prepared.kind == StatementKind::Other {
            return self.run(&prepared.sql, params);
        }

        if prepared.stages_writes {
            return self.in_transaction(|engine| {
                engine.ensure_fresh(&prepared.schema_keys)?;
                let result = engine.run(&prepared.sql, params)?;
                let committed = engine.flush_staged_writes()?;
                tracing::debug!(staged = result.rows_affected, committed, "state write applied");
                Ok(result)
            });
        }

        if !prepared.schema_keys.is_empty() {
            self.in_transaction(|engine| engine.ensure_fresh(&prepared.schema_keys))?;
        }
        if prepared.kind.is_write() {
            self.in_transaction(|engine| engine.run(&prepared.sql, params))
        } else {
            self.run(&prepared.sql, params)
        }
    }

    /// Execute a script statement by statement, without parameters.
    pub fn execute_batch(&mut self, script: &str) -> Result<(), EngineError> {
        for statement in sql::split_statements(script)? {
            self.execute(&statement, &[])?;
        }
        Ok(())
    }

    fn run(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, EngineError> {
        let mut stmt = self.storage.conn().prepare(sql)?;
        let expected = stmt.parameter_count();
        if expected != params.len() {
            return Err(EngineError::ParameterCount {
                expected,
                given: params.len(),
            });
        }
        for (index, value) in params.iter().enumerate() {
            stmt.raw_bind_parameter(index + 1, value)?;
        }

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        if columns.is_empty() {
            let rows_affected = stmt.raw_execute()?;
            return Ok(QueryResult {
                columns,
                rows: Vec::new(),
                rows_affected,
            });
        }

        let mut rows = stmt.raw_query();
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for index in 0..columns.len() {
                values.push(row.get::<_, SqlValue>(index)?);
            }
            out.push(values);
        }
        Ok(QueryResult {
            columns,
            rows: out,
            rows_affected: 0,
        })
    }

    // ====================================================================
    // State and caches
    // ====================================================================

    /// Live entities of one schema in a version.
    pub fn state(
        &mut self,
        schema_key: &str,
        version_id: &VersionId,
    ) -> Result<Vec<StateRow>, EngineError> {
        self.version(version_id)?;
        let keys = BTreeSet::from([schema_key.to_string()]);
        self.in_transaction(|engine| engine.ensure_fresh(&keys))?;
        Ok(self.storage.live_state(schema_key, version_id)?)
    }

    pub fn entity(
        &mut self,
        key: &EntityKey,
        version_id: &VersionId,
    ) -> Result<Option<StateRow>, EngineError> {
        Ok(self
            .state(&key.schema_key, version_id)?
            .into_iter()
            .find(|row| row.key() == *key))
    }

    /// Rebuild stale caches of the given schemas in every version.
    ///
    /// A cache is stale when its watermark is not the version's current commit.
    pub(crate) fn ensure_fresh(&mut self, schema_keys: &BTreeSet<String>) -> Result<(), EngineError> {
        if self.refreshing {
            return Ok(());
        }
        self.refreshing = true;
        let result = self.refresh_stale(schema_keys);
        self.refreshing = false;
        result
    }

    fn refresh_stale(&mut self, schema_keys: &BTreeSet<String>) -> Result<(), EngineError> {
        let (graph, tracked): (Vec<&String>, Vec<&String>) = schema_keys
            .iter()
            .filter(|k| self.catalog.contains(k))
            .partition(|k| is_graph_schema(k));
        for key in graph {
            self.storage.ensure_cache_table(key)?;
        }

        for version in self.storage.list_versions()? {
            let mut stale = Vec::new();
            for key in &tracked {
                if self.storage.watermark(key, &version.id)?.as_ref() != Some(&version.commit_id) {
                    stale.push(key.to_string());
                }
            }
            if !stale.is_empty() {
                tracing::debug!(version = %version.id, schemas = ?stale, "rebuilding stale cache");
                self.storage.rebuild_cache(&version, &stale)?;
            }
        }
        Ok(())
    }

    /// Rebuild every cache from the commit graph.
    pub fn rebuild_cache(&mut self) -> Result<(), EngineError> {
        self.in_transaction(|engine| {
            engine.storage.rebuild_graph_cache()?;
            let keys: Vec<String> = engine
                .catalog
                .keys()
                .filter(|k| !is_graph_schema(k))
                .map(String::from)
                .collect();
            for version in engine.storage.list_versions()? {
                engine.storage.rebuild_cache(&version, &keys)?;
            }
            tracing::info!(schemas = keys.len(), "caches rebuilt");
            Ok(())
        })
    }

    /// Rebuild every user schema cache of one version.
    pub fn rebuild_version(&mut self, version_id: &VersionId) -> Result<(), EngineError> {
        let version = self.version(version_id)?;
        let keys: Vec<String> = self
            .catalog
            .keys()
            .filter(|k| !is_graph_schema(k))
            .map(String::from)
            .collect();
        self.in_transaction(|engine| {
            engine.storage.rebuild_cache(&version, &keys)?;
            Ok(())
        })
    }

    pub fn conflicts(&self) -> Result<Vec<ConflictRecord>, EngineError> {
        Ok(self.storage.list_conflicts()?)
    }

    pub fn logs(&self) -> Result<Vec<LogRecord>, EngineError> {
        Ok(self.storage.list_logs()?)
    }

    pub fn plugins(&self) -> &[Plugin] {
        &self.plugins
    }
}
