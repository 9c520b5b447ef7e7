use verstate_core::CoreError;
use verstate_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(CoreError),

    #[error("schema validation failed for '{key}': {reason}")]
    SchemaValidation { key: String, reason: String },

    #[error("schema '{schema_key}' is immutable")]
    ImmutableSchemaViolation { schema_key: String },

    #[error("cannot rewrite statement: {0}")]
    UnresolvedRewrite(String),

    #[error("plugin '{plugin_key}' failed: {message}")]
    PluginExecution { plugin_key: String, message: String },

    #[error("version not found: {0}")]
    VersionNotFound(String),

    #[error("a version named '{0}' already exists")]
    VersionExists(String),

    #[error("commit not found: {0}")]
    CommitNotFound(String),

    #[error("sql syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("statement expects {expected} parameter(s), got {given}")]
    ParameterCount { expected: usize, given: usize },
}

impl EngineError {
    pub(crate) fn schema(key: &str, reason: impl Into<String>) -> Self {
        Self::SchemaValidation {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<CoreError> for EngineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::SchemaValidation { key, reason } => Self::SchemaValidation { key, reason },
            other => Self::Core(other),
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StorageError::Sqlite(err))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(StorageError::from(err))
    }
}
