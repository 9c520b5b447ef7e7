use serde::{Deserialize, Serialize};
use verstate_core::change::{DEFAULT_FILE_ID, DEFAULT_PLUGIN_KEY, ENTITY_ID_SEPARATOR};

/// Engine settings. Every field has a default, so partial JSON is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Joins the values of composite primary keys into an entity id.
    pub entity_id_separator: String,
    /// Commits searched per side when merging before giving up on a common ancestor.
    pub history_search_limit: usize,
    /// File id for entity-view writes that do not name one.
    pub default_file_id: String,
    /// Plugin key for entity-view writes that do not name one.
    pub default_plugin_key: String,
    /// Also write log events into the `log` table, not only to `tracing`.
    pub persist_log_events: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            entity_id_separator: ENTITY_ID_SEPARATOR.to_string(),
            history_search_limit: 1024,
            default_file_id: DEFAULT_FILE_ID.to_string(),
            default_plugin_key: DEFAULT_PLUGIN_KEY.to_string(),
            persist_log_events: true,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = EngineConfig::from_json(r#"{"history_search_limit": 16}"#).unwrap();
        assert_eq!(config.history_search_limit, 16);
        assert_eq!(config.entity_id_separator, "~");
        assert!(config.persist_log_events);
    }
}
