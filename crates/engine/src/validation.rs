//! Foreign key and unique checks over the live state of a version.
//!
//! Checks run after a write is applied, inside its transaction; a failure
//! rolls the write back.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;
use verstate_core::{change::EntityKey, ids::VersionId, schema::Schema};
use verstate_storage::{CacheStore, StateRow};

use crate::Engine;
use crate::error::EngineError;

fn matches(row: &StateRow, properties: &[String], values: &[&Value]) -> bool {
    Schema::tuple(&row.snapshot_content, properties).is_some_and(|t| t == values)
}

impl Engine {
    pub(crate) fn validate_constraints(
        &mut self,
        version_id: &VersionId,
        touched: &[(EntityKey, Option<Value>)],
    ) -> Result<(), EngineError> {
        // 1. Collect every schema a check will read
        let mut needed = BTreeSet::new();
        for (key, snapshot) in touched {
            let Some(schema) = self.catalog.get(&key.schema_key) else {
                continue;
            };
            if snapshot.is_some() {
                if !schema.unique_sets.is_empty() {
                    needed.insert(schema.key.clone());
                }
                needed.extend(schema.foreign_keys.iter().map(|fk| fk.references.schema_key.clone()));
            } else {
                let referencing = self.catalog.referencing(&key.schema_key);
                if !referencing.is_empty() {
                    needed.insert(key.schema_key.clone());
                    needed.extend(referencing.iter().map(|s| s.key.clone()));
                }
            }
        }
        if needed.is_empty() {
            return Ok(());
        }

        // 2. Load their live state once
        self.ensure_fresh(&needed)?;
        let mut live: HashMap<String, Vec<StateRow>> = HashMap::new();
        for key in &needed {
            live.insert(key.clone(), self.storage.live_state(key, version_id)?);
        }
        let rows = |key: &str| live.get(key).map(Vec::as_slice).unwrap_or(&[]);

        // 3. Forward checks on written entities
        for (key, snapshot) in touched {
            let (Some(snapshot), Some(schema)) = (snapshot, self.catalog.get(&key.schema_key)) else {
                continue;
            };
            for fk in &schema.foreign_keys {
                let Some(values) = Schema::tuple(snapshot, &fk.properties) else {
                    continue;
                };
                let target = &fk.references;
                if !rows(&target.schema_key)
                    .iter()
                    .any(|row| matches(row, &target.properties, &values))
                {
                    return Err(EngineError::schema(
                        &schema.key,
                        format!(
                            "entity '{}' references a missing '{}' entity through ({})",
                            key.entity_id,
                            target.schema_key,
                            fk.properties.join(", ")
                        ),
                    ));
                }
            }
            for set in &schema.unique_sets {
                let Some(values) = Schema::tuple(snapshot, set) else {
                    continue;
                };
                if rows(&schema.key)
                    .iter()
                    .any(|row| row.key() != *key && matches(row, set, &values))
                {
                    return Err(EngineError::schema(
                        &schema.key,
                        format!("unique constraint ({}) violated by '{}'", set.join(", "), key.entity_id),
                    ));
                }
            }
        }

        // 4. Deleted entities must not be referenced anymore
        for (key, _) in touched.iter().filter(|(_, s)| s.is_none()) {
            for schema in self.catalog.referencing(&key.schema_key) {
                for fk in schema
                    .foreign_keys
                    .iter()
                    .filter(|fk| fk.references.schema_key == key.schema_key)
                {
                    for row in rows(&schema.key) {
                        let Some(values) = Schema::tuple(&row.snapshot_content, &fk.properties) else {
                            continue;
                        };
                        let target = &fk.references;
                        if !rows(&target.schema_key)
                            .iter()
                            .any(|t| matches(t, &target.properties, &values))
                        {
                            return Err(EngineError::schema(
                                &key.schema_key,
                                format!(
                                    "entity '{}' is still referenced by '{}' entity '{}'",
                                    key.entity_id, schema.key, row.entity_id
                                ),
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
