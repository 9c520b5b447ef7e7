//! Plugins and the file queue.
//!
//! Files are queued with their content before and after an edit. Draining
//! the queue hands each file to the plugin whose glob matches its path and
//! commits the entity changes the plugin reports. A file whose processing
//! fails is logged and dropped; the rest of the queue still drains.

use verstate_core::{
    change::{Change, EntityKey},
    log::{LogEvent, LogLevel},
    plugin::{FileChange, Plugin},
};

use crate::Engine;
use crate::error::EngineError;

pub const LOG_SKIPPED: &str = "file_queue.skipped";
pub const LOG_NO_PLUGIN: &str = "file_queue.no_plugin";
pub const LOG_NO_CHANGES: &str = "file_queue.no_changes";
pub const LOG_PLUGIN_FAILED: &str = "file_queue.plugin_failed";

/// Counts from one drain of the file queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueReport {
    pub processed: usize,
    pub committed: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum FileOutcome {
    Committed,
    Skipped,
}

impl Engine {
    /// Register a plugin, replacing any plugin with the same key.
    pub fn register_plugin(&mut self, plugin: Plugin) {
        tracing::info!(plugin = %plugin.key, glob = %plugin.detect_changes_glob, "plugin registered");
        self.plugins.retain(|p| p.key != plugin.key);
        self.plugins.push(plugin);
    }

    pub fn enqueue_file(&mut self, file: FileChange) -> Result<i64, EngineError> {
        let id = self.storage.enqueue_file(&file)?;
        tracing::debug!(id, path = %file.path, "file queued");
        Ok(id)
    }

    pub fn queued_files(&self) -> Result<u64, EngineError> {
        Ok(self.storage.queued_file_count()?)
    }

    /// Process queued files oldest first until the queue is empty.
    pub fn process_file_queue(&mut self) -> Result<QueueReport, EngineError> {
        let mut report = QueueReport::default();
        while let Some(entry) = self.storage.next_queued_file()? {
            report.processed += 1;
            let outcome = self.in_transaction(|engine| {
                engine.storage.remove_queued_file(entry.id)?;
                match engine.in_transaction(|engine| engine.ingest_file(&entry.file)) {
                    Ok(outcome) => Ok(Some(outcome)),
                    Err(err) => {
                        engine.log_event(LogEvent::new(
                            LOG_PLUGIN_FAILED,
                            LogLevel::Error,
                            format!("processing {} failed: {err}", entry.file.path),
                        ))?;
                        Ok(None)
                    }
                }
            })?;
            match outcome {
                Some(FileOutcome::Committed) => report.committed += 1,
                Some(FileOutcome::Skipped) => report.skipped += 1,
                None => report.failed += 1,
            }
        }
        tracing::debug!(?report, "file queue drained");
        Ok(report)
    }

    fn matching_plugin(&self, path: &str) -> Result<Option<usize>, EngineError> {
        for (index, plugin) in self.plugins.iter().enumerate() {
            if !plugin.can_detect_changes() {
                continue;
            }
            let matched: bool = self.storage.conn().query_row(
                "SELECT ?1 GLOB ?2",
                rusqlite::params![path, plugin.detect_changes_glob],
                |row| row.get(0),
            )?;
            if matched {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    fn ingest_file(&mut self, file: &FileChange) -> Result<FileOutcome, EngineError> {
        if file.skip_change_detection {
            self.log_event(LogEvent::new(
                LOG_SKIPPED,
                LogLevel::Info,
                format!("change detection skipped for {}", file.path),
            ))?;
            return Ok(FileOutcome::Skipped);
        }

        let Some(index) = self.matching_plugin(&file.path)? else {
            self.log_event(LogEvent::new(
                LOG_NO_PLUGIN,
                LogLevel::Warn,
                format!("no plugin detects changes for {}", file.path),
            ))?;
            return Ok(FileOutcome::Skipped);
        };
        let plugin = &self.plugins[index];
        let plugin_key = plugin.key.clone();
        let detected = match plugin.detect_changes(file.before.as_deref(), file.after.as_deref()) {
            Some(Ok(detected)) => detected,
            Some(Err(err)) => {
                return Err(EngineError::PluginExecution {
                    plugin_key,
                    message: err.to_string(),
                });
            }
            None => Vec::new(),
        };
        if detected.is_empty() {
            self.log_event(LogEvent::new(
                LOG_NO_CHANGES,
                LogLevel::Info,
                format!("no changes detected in {}", file.path),
            ))?;
            return Ok(FileOutcome::Skipped);
        }

        let mut changes = Vec::with_capacity(detected.len());
        for found in detected {
            let schema = self
                .catalog
                .get(&found.schema_key)
                .ok_or_else(|| EngineError::schema(&found.schema_key, "schema is not registered"))?;
            let entity_id = match (&found.entity_id, &found.snapshot_content) {
                (Some(id), _) => id.clone(),
                (None, Some(snapshot)) => schema.entity_id(snapshot, &self.config.entity_id_separator)?,
                (None, None) => {
                    return Err(EngineError::schema(
                        &schema.key,
                        "a deletion must name its entity",
                    ));
                }
            };
            if let Some(snapshot) = &found.snapshot_content {
                schema.validate_snapshot(snapshot)?;
            }
            changes.push(Change::new(
                &EntityKey::new(entity_id, &schema.key, &file.file_id),
                &schema.version,
                &plugin_key,
                found.snapshot_content,
            ));
        }

        let version_id = match &file.version_id {
            Some(id) => id.clone(),
            None => self.active_version()?.id,
        };
        let commit_id = self.commit_tracked(&version_id, changes)?;
        tracing::info!(path = %file.path, plugin = %plugin_key, commit = ?commit_id, "file ingested");
        Ok(FileOutcome::Committed)
    }
}
