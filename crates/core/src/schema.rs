//! Entity schema definitions.
//!
//! A schema describes one entity type: its properties, the properties that
//! form its primary key, references to other schemas, uniqueness rules,
//! defaults applied on insert and routing overrides. Schemas are identified
//! by `(key, version)` and never change once stored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

pub const COMMIT_SCHEMA_KEY: &str = "sys_commit";
pub const COMMIT_EDGE_SCHEMA_KEY: &str = "sys_commit_edge";
pub const CHANGE_SET_SCHEMA_KEY: &str = "sys_change_set";

/// Routing columns a schema may pin to a fixed value.
pub const ROUTING_OVERRIDES: [&str; 3] = ["sys_file_id", "sys_plugin_key", "sys_version_id"];

/// Names owned by the store's own tables and views.
const RESERVED_KEYS: [&str; 9] = [
    "state",
    "state_by_version",
    "version",
    "active_version",
    "change",
    "commit",
    "conflict",
    "log",
    "sqlite_master",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl PropertyType {
    /// Null is accepted by every type; primary keys are checked separately.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) | (Self::Any, _) => true,
            (Self::String, Value::String(_)) => true,
            (Self::Number, Value::Number(_)) => true,
            (Self::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Self::Boolean, Value::Bool(_)) => true,
            // SQLite has no boolean type, values written through SQL arrive as 0/1
            (Self::Boolean, Value::Number(n)) => matches!(n.as_i64(), Some(0 | 1)),
            (Self::Object, Value::Object(_)) => true,
            (Self::Array, Value::Array(_)) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PropertyDef {
    #[serde(rename = "type", default)]
    pub kind: PropertyType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyTarget {
    pub schema_key: String,
    pub properties: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    pub properties: Vec<String>,
    pub references: ForeignKeyTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub key: String,
    pub version: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyDef>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub unique_sets: Vec<Vec<String>>,
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
    #[serde(default)]
    pub overrides: BTreeMap<String, Value>,
    #[serde(default)]
    pub immutable: bool,
}

impl Schema {
    pub fn new(key: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version: version.into(),
            properties: BTreeMap::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
            unique_sets: Vec::new(),
            defaults: BTreeMap::new(),
            overrides: BTreeMap::new(),
            immutable: false,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn property(mut self, name: &str, kind: PropertyType) -> Self {
        self.properties.insert(name.to_string(), PropertyDef { kind });
        self
    }

    pub fn primary_key(mut self, properties: &[&str]) -> Self {
        self.primary_key = properties.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn foreign_key(mut self, properties: &[&str], schema_key: &str, references: &[&str]) -> Self {
        self.foreign_keys.push(ForeignKey {
            properties: properties.iter().map(|p| p.to_string()).collect(),
            references: ForeignKeyTarget {
                schema_key: schema_key.to_string(),
                properties: references.iter().map(|p| p.to_string()).collect(),
            },
        });
        self
    }

    pub fn unique(mut self, properties: &[&str]) -> Self {
        self.unique_sets
            .push(properties.iter().map(|p| p.to_string()).collect());
        self
    }

    pub fn default_value(mut self, property: &str, value: Value) -> Self {
        self.defaults.insert(property.to_string(), value);
        self
    }

    pub fn with_override(mut self, column: &str, value: Value) -> Self {
        self.overrides.insert(column.to_string(), value);
        self
    }

    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    /// Stable content hash, used to detect redefinitions and stale cache handles.
    pub fn fingerprint(&self) -> Result<String, CoreError> {
        let bytes = serde_json::to_vec(self)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }

    pub fn override_str(&self, column: &str) -> Option<&str> {
        self.overrides.get(column).and_then(Value::as_str)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let key = self.key.as_str();
        if key.is_empty() {
            return Err(CoreError::schema(key, "key must not be empty"));
        }
        if !is_plain_identifier(key) {
            return Err(CoreError::schema(
                key,
                "key may only contain ASCII letters, digits and underscores",
            ));
        }
        if RESERVED_KEYS.iter().any(|r| r.eq_ignore_ascii_case(key))
            || key.to_ascii_lowercase().starts_with("internal_")
            || key.to_ascii_lowercase().ends_with("_by_version")
        {
            return Err(CoreError::schema(key, "key is reserved"));
        }
        if self.version.is_empty() {
            return Err(CoreError::schema(key, "version must not be empty"));
        }

        for name in self.properties.keys() {
            if name.is_empty() {
                return Err(CoreError::schema(key, "property names must not be empty"));
            }
            if name.starts_with("sys_") {
                return Err(CoreError::schema(
                    key,
                    format!("property '{name}' uses the reserved sys_ prefix"),
                ));
            }
        }

        if self.primary_key.is_empty() {
            return Err(CoreError::schema(key, "primaryKey must name at least one property"));
        }
        self.check_known(&self.primary_key, "primaryKey")?;

        for fk in &self.foreign_keys {
            if fk.properties.is_empty() {
                return Err(CoreError::schema(key, "foreign key without properties"));
            }
            self.check_known(&fk.properties, "foreignKeys")?;
            if fk.references.schema_key.is_empty() {
                return Err(CoreError::schema(key, "foreign key without target schema"));
            }
            if fk.references.properties.len() != fk.properties.len() {
                return Err(CoreError::schema(
                    key,
                    format!(
                        "foreign key to '{}' maps {} properties onto {}",
                        fk.references.schema_key,
                        fk.properties.len(),
                        fk.references.properties.len()
                    ),
                ));
            }
        }

        for set in &self.unique_sets {
            if set.is_empty() {
                return Err(CoreError::schema(key, "empty unique set"));
            }
            self.check_known(set, "uniqueSets")?;
        }

        for (name, value) in &self.defaults {
            let Some(def) = self.properties.get(name) else {
                return Err(CoreError::schema(
                    key,
                    format!("default for unknown property '{name}'"),
                ));
            };
            if !def.kind.accepts(value) {
                return Err(CoreError::schema(
                    key,
                    format!("default for '{name}' is not a {}", def.kind.as_str()),
                ));
            }
        }

        for (column, value) in &self.overrides {
            if !ROUTING_OVERRIDES.contains(&column.as_str()) {
                return Err(CoreError::schema(
                    key,
                    format!("'{column}' cannot be overridden"),
                ));
            }
            if !value.is_string() {
                return Err(CoreError::schema(
                    key,
                    format!("override for '{column}' must be a string"),
                ));
            }
        }

        Ok(())
    }

    fn check_known(&self, names: &[String], field: &str) -> Result<(), CoreError> {
        for name in names {
            if !self.properties.contains_key(name) {
                return Err(CoreError::schema(
                    &self.key,
                    format!("{field} references unknown property '{name}'"),
                ));
            }
        }
        Ok(())
    }

    /// Check a snapshot against the declared properties.
    pub fn validate_snapshot(&self, snapshot: &Value) -> Result<(), CoreError> {
        let Some(object) = snapshot.as_object() else {
            return Err(CoreError::schema(&self.key, "snapshot must be a JSON object"));
        };
        for pk in &self.primary_key {
            match object.get(pk) {
                None | Some(Value::Null) => {
                    return Err(CoreError::schema(
                        &self.key,
                        format!("primary key property '{pk}' is missing"),
                    ));
                }
                Some(_) => {}
            }
        }
        for (name, value) in object {
            let Some(def) = self.properties.get(name) else {
                return Err(CoreError::schema(
                    &self.key,
                    format!("unknown property '{name}'"),
                ));
            };
            if !def.kind.accepts(value) {
                return Err(CoreError::schema(
                    &self.key,
                    format!("property '{name}' is not a {}", def.kind.as_str()),
                ));
            }
        }
        Ok(())
    }

    /// Derive the entity id from the primary-key values of a snapshot.
    pub fn entity_id(&self, snapshot: &Value, separator: &str) -> Result<String, CoreError> {
        let mut parts = Vec::with_capacity(self.primary_key.len());
        for pk in &self.primary_key {
            let part = match snapshot.get(pk) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::Bool(b)) => String::from(if *b { "1" } else { "0" }),
                _ => {
                    return Err(CoreError::schema(
                        &self.key,
                        format!("primary key property '{pk}' must be a scalar"),
                    ));
                }
            };
            parts.push(part);
        }
        Ok(parts.join(separator))
    }

    /// Values of `properties` in a snapshot, `None` when any of them is null or absent.
    pub fn tuple<'a>(snapshot: &'a Value, properties: &[String]) -> Option<Vec<&'a Value>> {
        properties
            .iter()
            .map(|p| snapshot.get(p).filter(|v| !v.is_null()))
            .collect()
    }
}

pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Schemas whose rows are derived from the commit graph and always live in the global scope.
pub fn is_graph_schema(key: &str) -> bool {
    matches!(
        key,
        COMMIT_SCHEMA_KEY | COMMIT_EDGE_SCHEMA_KEY | CHANGE_SET_SCHEMA_KEY
    )
}

pub fn builtin_schemas() -> Vec<Schema> {
    vec![
        Schema::new(COMMIT_SCHEMA_KEY, "1.0")
            .property("id", PropertyType::String)
            .property("change_set_id", PropertyType::String)
            .property("parent_commit_ids", PropertyType::Array)
            .primary_key(&["id"])
            .immutable(),
        Schema::new(COMMIT_EDGE_SCHEMA_KEY, "1.0")
            .property("parent_id", PropertyType::String)
            .property("child_id", PropertyType::String)
            .primary_key(&["parent_id", "child_id"])
            .immutable(),
        Schema::new(CHANGE_SET_SCHEMA_KEY, "1.0")
            .property("id", PropertyType::String)
            .primary_key(&["id"])
            .immutable(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn todo_schema() -> Schema {
        Schema::new("todo", "1.0")
            .property("id", PropertyType::String)
            .property("title", PropertyType::String)
            .property("done", PropertyType::Boolean)
            .primary_key(&["id"])
    }

    #[test]
    fn parses_camel_case_json() {
        let schema = Schema::from_json(
            r#"{
                "key": "file_line",
                "version": "1.0",
                "properties": {"file": {"type": "string"}, "line": {"type": "integer"}},
                "primaryKey": ["file", "line"],
                "uniqueSets": [["file", "line"]],
                "overrides": {"sys_plugin_key": "plugin_text"},
                "immutable": true
            }"#,
        )
        .unwrap();
        assert_eq!(schema.primary_key, vec!["file", "line"]);
        assert_eq!(schema.override_str("sys_plugin_key"), Some("plugin_text"));
        assert!(schema.immutable);
        schema.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_primary_key() {
        let schema = todo_schema().primary_key(&["missing"]);
        let err = schema.validate().unwrap_err();
        assert!(matches!(err, CoreError::SchemaValidation { .. }));
    }

    #[test]
    fn rejects_reserved_and_malformed_keys() {
        for key in ["state", "internal_x", "todo_by_version", "has-dash", "", "1abc"] {
            let mut schema = todo_schema();
            schema.key = key.to_string();
            assert!(schema.validate().is_err(), "{key} should be rejected");
        }
    }

    #[test]
    fn rejects_mismatched_foreign_key() {
        let schema = todo_schema()
            .property("owner", PropertyType::String)
            .foreign_key(&["owner"], "user", &["id", "org"]);
        assert!(schema.validate().is_err());
    }

    #[test]
    fn rejects_bad_defaults_and_overrides() {
        let schema = todo_schema().default_value("done", json!("nope"));
        assert!(schema.validate().is_err());

        let schema = todo_schema().with_override("sys_change_id", json!("x"));
        assert!(schema.validate().is_err());
    }

    #[test]
    fn snapshot_validation() {
        let schema = todo_schema();
        schema
            .validate_snapshot(&json!({"id": "a", "title": "t", "done": false}))
            .unwrap();
        schema.validate_snapshot(&json!({"id": "a", "done": 1})).unwrap();
        assert!(schema.validate_snapshot(&json!({"title": "t"})).is_err());
        assert!(schema.validate_snapshot(&json!({"id": "a", "title": 3})).is_err());
        assert!(schema.validate_snapshot(&json!({"id": "a", "extra": 1})).is_err());
        assert!(schema.validate_snapshot(&json!([1, 2])).is_err());
    }

    #[test]
    fn composite_entity_id() {
        let schema = Schema::new("cell", "1.0")
            .property("row", PropertyType::Integer)
            .property("col", PropertyType::String)
            .primary_key(&["row", "col"]);
        let id = schema.entity_id(&json!({"row": 4, "col": "b"}), "~").unwrap();
        assert_eq!(id, "4~b");
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = todo_schema();
        let b = todo_schema().immutable();
        assert_eq!(a.fingerprint().unwrap(), todo_schema().fingerprint().unwrap());
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn builtins_are_immutable_graph_schemas() {
        for schema in builtin_schemas() {
            assert!(schema.immutable);
            assert!(is_graph_schema(&schema.key));
        }
    }
}
