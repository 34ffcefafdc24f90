//! Append-only Alert/LogEntry storage (§3). Acks toggle a flag on an
//! otherwise-immutable alert record, so this is a `JsonStore` map keyed
//! by a generated id rather than the agent's capped list spool.

use chrono::{DateTime, Utc};
use fleet_persist::JsonStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: String,
    pub agent_id: String,
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default)]
    pub acknowledged_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: String,
    pub agent_id: String,
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

pub struct AlertStore {
    store: Mutex<JsonStore>,
}

impl AlertStore {
    pub fn new(path: &Path) -> Self {
        Self {
            store: Mutex::new(JsonStore::at_path(path.to_path_buf())),
        }
    }

    pub fn append(&self, agent_id: &str, level: &str, message: &str, details: Option<Value>) -> AlertRecord {
        let record = AlertRecord {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            level: level.to_string(),
            message: message.to_string(),
            details,
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_by: None,
        };
        let store = self.store.lock();
        let mut all: HashMap<String, AlertRecord> = store.load();
        all.insert(record.id.clone(), record.clone());
        if let Err(e) = store.save(&all) {
            tracing::warn!(error = %e, "failed to persist alert");
        }
        record
    }

    pub fn acknowledge(&self, id: &str, by: &str) -> bool {
        let store = self.store.lock();
        let mut all: HashMap<String, AlertRecord> = store.load();
        let Some(record) = all.get_mut(id) else {
            return false;
        };
        record.acknowledged = true;
        record.acknowledged_by = Some(by.to_string());
        store.save(&all).is_ok()
    }

    pub fn all(&self) -> Vec<AlertRecord> {
        let store = self.store.lock();
        let all: HashMap<String, AlertRecord> = store.load();
        all.into_values().collect()
    }
}

pub struct LogStore {
    store: Mutex<JsonStore>,
}

impl LogStore {
    pub fn new(path: &Path) -> Self {
        Self {
            store: Mutex::new(JsonStore::at_path(path.to_path_buf())),
        }
    }

    pub fn append(&self, agent_id: &str, level: &str, message: &str, details: Option<Value>) {
        let record = LogRecord {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            level: level.to_string(),
            message: message.to_string(),
            details,
            created_at: Utc::now(),
        };
        let store = self.store.lock();
        let mut all: HashMap<String, LogRecord> = store.load();
        all.insert(record.id.clone(), record);
        if let Err(e) = store.save(&all) {
            tracing::warn!(error = %e, "failed to persist log entry");
        }
    }

    pub fn all(&self) -> Vec<LogRecord> {
        let store = self.store.lock();
        let all: HashMap<String, LogRecord> = store.load();
        all.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appended_alert_is_unacknowledged() {
        let dir = tempfile::tempdir().unwrap();
        let store = AlertStore::new(&dir.path().join("alerts.json"));
        let record = store.append("a1", "error", "disk full", None);
        assert!(!record.acknowledged);
    }

    #[test]
    fn acknowledge_sets_flag_and_actor() {
        let dir = tempfile::tempdir().unwrap();
        let store = AlertStore::new(&dir.path().join("alerts.json"));
        let record = store.append("a1", "warn", "disk at 80%", None);
        assert!(store.acknowledge(&record.id, "operator-1"));

        let reloaded = store.all();
        let found = reloaded.iter().find(|a| a.id == record.id).unwrap();
        assert!(found.acknowledged);
        assert_eq!(found.acknowledged_by.as_deref(), Some("operator-1"));
    }

    #[test]
    fn acknowledge_unknown_id_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let store = AlertStore::new(&dir.path().join("alerts.json"));
        assert!(!store.acknowledge("missing", "operator-1"));
    }
}
