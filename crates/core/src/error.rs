use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("schema validation failed for '{key}': {reason}")]
    SchemaValidation { key: String, reason: String },

    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl CoreError {
    pub(crate) fn schema(key: &str, reason: impl Into<String>) -> Self {
        Self::SchemaValidation {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
