use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate change id: {change_id}")]
    DuplicateChangeId { change_id: String },

    #[error("commit {commit_id} references unknown parent {parent_id}")]
    DanglingParentCommit { commit_id: String, parent_id: String },

    #[error("commit {commit_id} lists itself as a parent")]
    SelfReferencingCommit { commit_id: String },

    #[error("change set {change_set_id} already belongs to a commit")]
    ChangeSetAlreadyCommitted { change_set_id: String },

    #[error("schema {key}@{version} already exists with a different definition")]
    SchemaRedefinition { key: String, version: String },

    #[error("cache consistency violated: {0}")]
    CacheConsistency(String),

    #[error("core error: {0}")]
    Core(#[from] verstate_core::CoreError),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// True for UNIQUE / PRIMARY KEY / CHECK failures reported by SQLite.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
