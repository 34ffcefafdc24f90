//! StateStore (§4.8): a JSON file mapping `workflowId -> WorkflowRunState`,
//! written under a single mutex so two runs completing steps at the same
//! moment never interleave writes.

use chrono::{DateTime, Utc};
use fleet_persist::JsonStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

/// A single workflow's latest run state. `context` is snapshotted by
/// value at every save — `serde_json::Value` is always a fully owned
/// tree, so cloning it at the call site already gives the "deep copy
/// taken at the save point" the design calls for; nothing here can
/// observe a step goroutine still mutating the live map mid-serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunState {
    pub status: RunStatus,
    pub context: Value,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub completed_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

pub struct StateStore {
    store: Mutex<JsonStore>,
}

impl StateStore {
    pub fn new(path: &Path) -> Self {
        Self {
            store: Mutex::new(JsonStore::at_path(path.to_path_buf())),
        }
    }

    pub fn save(&self, workflow_id: &str, state: WorkflowRunState) -> std::io::Result<()> {
        let store = self.store.lock();
        let mut all: HashMap<String, WorkflowRunState> = store.load();
        all.insert(workflow_id.to_string(), state);
        store.save(&all)
    }

    pub fn get(&self, workflow_id: &str) -> Option<WorkflowRunState> {
        let store = self.store.lock();
        let all: HashMap<String, WorkflowRunState> = store.load();
        all.get(workflow_id).cloned()
    }

    pub fn all(&self) -> HashMap<String, WorkflowRunState> {
        self.store.lock().load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(&dir.path().join("state.json"));
        let now = Utc::now();
        store
            .save(
                "wf-1",
                WorkflowRunState {
                    status: RunStatus::Running,
                    context: serde_json::json!({"file": "a.csv"}),
                    started_at: now,
                    updated_at: now,
                    last_error: None,
                    completed_steps: Vec::new(),
                    end_time: None,
                },
            )
            .unwrap();

        let loaded = store.get("wf-1").unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.context["file"], "a.csv");
    }

    #[test]
    fn save_preserves_other_workflows() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(&dir.path().join("state.json"));
        let now = Utc::now();
        for id in ["wf-a", "wf-b"] {
            store
                .save(
                    id,
                    WorkflowRunState {
                        status: RunStatus::Succeeded,
                        context: serde_json::json!({}),
                        started_at: now,
                        updated_at: now,
                        last_error: None,
                        completed_steps: Vec::new(),
                        end_time: None,
                    },
                )
                .unwrap();
        }
        assert_eq!(store.all().len(), 2);
    }
}
