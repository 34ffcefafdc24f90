//! JSON file-backed persistence shared by the agent and the manager.
//!
//! Provides [`JsonStore`], a generic key-value snapshot store, and
//! [`JsonListStore`], a capped append-only list snapshot store (used for
//! the agent's disconnected-alert spool). Both keep data in memory and
//! write a full snapshot to disk on every mutation — simple, and cheap
//! enough at the sizes these stores see (hundreds to low thousands of
//! entries).

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A JSON file-backed map store for a single domain of data.
///
/// Snapshots to `{state_path}/state/{domain}.json` on every write, mirroring
/// the layout `state.json` and friends use under the agent's config dir.
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    /// Create a new store for the given domain under `state_path`.
    pub fn new(state_path: &Path, domain: &str) -> Self {
        let path = state_path.join("state").join(format!("{domain}.json"));
        Self { path }
    }

    /// Create a store rooted at an exact file path rather than
    /// `state_path/state/{domain}.json` — used for the fixed filenames in
    /// the agent's persistent state layout (`state.json`, `alerts.json`).
    pub fn at_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load data from disk. Returns an empty map if the file doesn't exist
    /// or is corrupt — corruption is logged, never fatal.
    pub fn load<T: for<'de> Deserialize<'de>>(&self) -> HashMap<String, T> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "corrupt state file, starting fresh");
                HashMap::new()
            }),
            Err(_) => {
                debug!(path = %self.path.display(), "no state file, starting fresh");
                HashMap::new()
            }
        }
    }

    /// Save data to disk. Creates parent directories as needed.
    pub fn save<T: Serialize>(&self, data: &HashMap<String, T>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(data).map_err(std::io::Error::other)?;
        std::fs::write(&self.path, content)
    }
}

/// A capped, append-only JSON list snapshot store.
///
/// Used for the agent's `alerts.json` spool: alerts generated while the
/// WebSocket is disconnected are appended here, capped at `max_len` most
/// recent entries, and drained once the connection comes back.
pub struct JsonListStore {
    path: PathBuf,
    max_len: usize,
}

impl JsonListStore {
    pub fn new(path: PathBuf, max_len: usize) -> Self {
        Self { path, max_len }
    }

    pub fn load<T: for<'de> Deserialize<'de>>(&self) -> Vec<T> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "corrupt list store, starting fresh");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        }
    }

    /// Append one entry, capping the stored list at `max_len` most recent.
    pub fn append<T: Serialize + for<'de> Deserialize<'de>>(
        &self,
        entry: T,
    ) -> std::io::Result<()> {
        let mut items: Vec<T> = self.load();
        items.push(entry);
        if items.len() > self.max_len {
            let overflow = items.len() - self.max_len;
            items.drain(0..overflow);
        }
        self.save(&items)
    }

    pub fn save<T: Serialize>(&self, items: &[T]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(items).map_err(std::io::Error::other)?;
        std::fs::write(&self.path, content)
    }

    /// Replace the stored list with an empty one (used after a successful
    /// flush of buffered alerts over the wire).
    pub fn clear(&self) -> std::io::Result<()> {
        self.save::<serde_json::Value>(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_store_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path(), "test");

        let mut data = HashMap::new();
        data.insert("key1".to_string(), "value1".to_string());
        data.insert("key2".to_string(), "value2".to_string());
        store.save(&data).expect("save");

        let loaded: HashMap<String, String> = store.load();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("key1").unwrap(), "value1");
    }

    #[test]
    fn test_json_store_empty_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path(), "nonexistent");
        let loaded: HashMap<String, String> = store.load();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_json_store_corrupt_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state_dir = dir.path().join("state");
        std::fs::create_dir_all(&state_dir).expect("mkdir");
        std::fs::write(state_dir.join("corrupt.json"), "not json").expect("write");

        let store = JsonStore::new(dir.path(), "corrupt");
        let loaded: HashMap<String, String> = store.load();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_json_list_store_caps_at_max_len() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonListStore::new(dir.path().join("alerts.json"), 3);

        for i in 0..5 {
            store.append(format!("alert-{i}")).expect("append");
        }

        let loaded: Vec<String> = store.load();
        assert_eq!(loaded, vec!["alert-2", "alert-3", "alert-4"]);
    }

    #[test]
    fn test_json_list_store_clear() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonListStore::new(dir.path().join("alerts.json"), 10);
        store.append("a".to_string()).expect("append");
        store.clear().expect("clear");
        let loaded: Vec<String> = store.load();
        assert!(loaded.is_empty());
    }
}
