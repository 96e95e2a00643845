//! Change Log
//!
//! Every mutating manager call records one [`ChangeLogEntry`]. Entries go to a
//! [`ChangeLog`] sink; the default sink emits structured tracing events, and
//! [`MemoryChangeLog`] keeps entries around for inspection in tests.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use steward_core::EntityType;

/// A single recorded change.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeLogEntry {
    pub entity_type: EntityType,
    pub entity_id: String,
    /// `create`, `update`, `delete`, or a dotted sub-action such as `status.active`
    pub action: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ChangeLogEntry {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        action: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            action: action.into(),
            username: username.into(),
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Destination for change-log entries.
pub trait ChangeLog: Send + Sync {
    fn record(&self, entry: ChangeLogEntry);
}

/// Emits each entry as an `info` event on the `steward::change_log` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingChangeLog;

impl ChangeLog for TracingChangeLog {
    fn record(&self, entry: ChangeLogEntry) {
        let details = entry
            .details
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_default();
        tracing::info!(
            target: "steward::change_log",
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            action = %entry.action,
            username = %entry.username,
            details = %details,
            "change recorded"
        );
    }
}

/// Keeps entries in memory.
#[derive(Debug, Default)]
pub struct MemoryChangeLog {
    entries: Mutex<Vec<ChangeLogEntry>>,
}

impl MemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ChangeLogEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Actions recorded for one entity, oldest first.
    pub fn actions_for(&self, entity_id: &str) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.entity_id == entity_id)
            .map(|e| e.action.clone())
            .collect()
    }
}

impl ChangeLog for MemoryChangeLog {
    fn record(&self, entry: ChangeLogEntry) {
        self.entries.lock().push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_change_log_records_in_order() {
        let log = MemoryChangeLog::new();
        assert!(log.is_empty());

        log.record(ChangeLogEntry::new(EntityType::Project, "p1", "create", "alice"));
        log.record(
            ChangeLogEntry::new(EntityType::Project, "p1", "update", "bob")
                .with_details(serde_json::json!({"title": "New"})),
        );
        log.record(ChangeLogEntry::new(EntityType::DataDomain, "d1", "create", "alice"));

        assert_eq!(log.len(), 3);
        assert_eq!(log.actions_for("p1"), vec!["create", "update"]);
        assert_eq!(log.entries()[1].details.as_ref().unwrap()["title"], "New");
    }

    #[test]
    fn test_tracing_change_log_does_not_panic_without_subscriber() {
        TracingChangeLog.record(ChangeLogEntry::new(
            EntityType::DataContract,
            "c1",
            "delete",
            "carol",
        ));
    }
}
