//! Capability interface for file-format plugins.
//!
//! A plugin owns a path glob and may offer change detection, conflict
//! detection, or both. Each capability is optional and checked explicitly
//! by the caller.

use std::fmt;

use serde_json::Value;

use crate::change::{Change, EntityKey};
use crate::ids::VersionId;

pub type PluginError = Box<dyn std::error::Error + Send + Sync>;
pub type PluginResult<T> = Result<T, PluginError>;

pub type DetectChangesFn =
    Box<dyn Fn(Option<&[u8]>, Option<&[u8]>) -> PluginResult<Vec<DetectedChange>> + Send + Sync>;
pub type DetectConflictsFn =
    Box<dyn Fn(&ConflictContext<'_>) -> PluginResult<Vec<DetectedConflict>> + Send + Sync>;

/// An entity state reported by a plugin for one file.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedChange {
    /// Derived from the schema's primary key when absent.
    pub entity_id: Option<String>,
    pub schema_key: String,
    pub snapshot_content: Option<Value>,
}

impl DetectedChange {
    pub fn upsert(schema_key: impl Into<String>, snapshot: Value) -> Self {
        Self {
            entity_id: None,
            schema_key: schema_key.into(),
            snapshot_content: Some(snapshot),
        }
    }

    pub fn delete(schema_key: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            schema_key: schema_key.into(),
            snapshot_content: None,
        }
    }
}

/// Both sides of an entity modified independently in two versions.
#[derive(Debug, Clone, Copy)]
pub struct ConflictContext<'a> {
    pub key: &'a EntityKey,
    pub source: &'a Change,
    pub target: &'a Change,
    pub ancestor: Option<&'a Change>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedConflict {
    pub key: String,
    pub message: String,
}

/// A file write waiting for change detection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileChange {
    pub file_id: String,
    pub path: String,
    pub before: Option<Vec<u8>>,
    pub after: Option<Vec<u8>>,
    pub skip_change_detection: bool,
    /// Active version when `None`.
    pub version_id: Option<VersionId>,
}

pub struct Plugin {
    pub key: String,
    pub detect_changes_glob: String,
    detect_changes: Option<DetectChangesFn>,
    detect_conflicts: Option<DetectConflictsFn>,
}

impl Plugin {
    pub fn new(key: impl Into<String>, detect_changes_glob: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            detect_changes_glob: detect_changes_glob.into(),
            detect_changes: None,
            detect_conflicts: None,
        }
    }

    pub fn with_detect_changes<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&[u8]>, Option<&[u8]>) -> PluginResult<Vec<DetectedChange>>
            + Send
            + Sync
            + 'static,
    {
        self.detect_changes = Some(Box::new(f));
        self
    }

    pub fn with_detect_conflicts<F>(mut self, f: F) -> Self
    where
        F: Fn(&ConflictContext<'_>) -> PluginResult<Vec<DetectedConflict>> + Send + Sync + 'static,
    {
        self.detect_conflicts = Some(Box::new(f));
        self
    }

    pub fn can_detect_changes(&self) -> bool {
        self.detect_changes.is_some()
    }

    pub fn can_detect_conflicts(&self) -> bool {
        self.detect_conflicts.is_some()
    }

    /// `None` when the plugin lacks the capability.
    pub fn detect_changes(
        &self,
        before: Option<&[u8]>,
        after: Option<&[u8]>,
    ) -> Option<PluginResult<Vec<DetectedChange>>> {
        self.detect_changes.as_ref().map(|f| f(before, after))
    }

    pub fn detect_conflicts(
        &self,
        ctx: &ConflictContext<'_>,
    ) -> Option<PluginResult<Vec<DetectedConflict>>> {
        self.detect_conflicts.as_ref().map(|f| f(ctx))
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("key", &self.key)
            .field("detect_changes_glob", &self.detect_changes_glob)
            .field("detect_changes", &self.can_detect_changes())
            .field("detect_conflicts", &self.can_detect_conflicts())
            .finish()
    }
}
