//! AgentRegistry (manager, §3, §4.4): the `AgentRecord` table plus the
//! liveness sweep that demotes agents whose heartbeat has gone stale.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use fleet_persist::JsonStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("agent not found: {0}")]
    NotFound(String),
    #[error("public key already registered to a different agent")]
    DuplicatePublicKey,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub hostname: String,
    pub platform: String,
    pub public_key: String,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub connection_ip: Option<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub metadata: Value,
}

pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Persisted to `agents.json`, a map `agentId -> AgentRecord`.
pub struct AgentRegistry {
    store: Mutex<JsonStore>,
}

impl AgentRegistry {
    pub fn new(path: &Path) -> Self {
        Self {
            store: Mutex::new(JsonStore::at_path(path.to_path_buf())),
        }
    }

    /// Insert a brand-new agent or replace an existing record at the same
    /// `id`; `publicKey` must remain unique across other agent ids.
    pub fn register(
        &self,
        id: &str,
        hostname: &str,
        platform: &str,
        public_key: &str,
    ) -> RegistryResult<AgentRecord> {
        let store = self.store.lock();
        let mut all: HashMap<String, AgentRecord> = store.load();

        if let Some((other_id, _)) = all
            .iter()
            .find(|(other_id, record)| record.public_key == public_key && other_id.as_str() != id)
        {
            warn!(id, other_id, "public key already claimed by another agent");
            return Err(RegistryError::DuplicatePublicKey);
        }

        let record = AgentRecord {
            id: id.to_string(),
            hostname: hostname.to_string(),
            platform: platform.to_string(),
            public_key: public_key.to_string(),
            status: AgentStatus::Online,
            last_heartbeat: Utc::now(),
            connection_ip: None,
            config: all.get(id).map(|r| r.config.clone()).unwrap_or(Value::Null),
            metadata: all.get(id).map(|r| r.metadata.clone()).unwrap_or(Value::Null),
        };

        all.insert(id.to_string(), record.clone());
        store.save(&all)?;
        info!(id, hostname, "agent registered");
        Ok(record)
    }

    /// Verify the stored public key matches before marking an agent back
    /// online on reconnection.
    pub fn reconnect(
        &self,
        id: &str,
        public_key: &str,
        hostname: &str,
        platform: &str,
        connection_ip: Option<&str>,
    ) -> RegistryResult<AgentRecord> {
        let store = self.store.lock();
        let mut all: HashMap<String, AgentRecord> = store.load();
        let record = all.get_mut(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if record.public_key != public_key {
            warn!(id, "reconnection public key mismatch");
            return Err(RegistryError::DuplicatePublicKey);
        }

        record.status = AgentStatus::Online;
        record.last_heartbeat = Utc::now();
        record.hostname = hostname.to_string();
        record.platform = platform.to_string();
        record.connection_ip = connection_ip.map(str::to_string);

        let updated = record.clone();
        store.save(&all)?;
        Ok(updated)
    }

    /// Overwrite the managed-from-Git config blob for an existing agent
    /// (used by the manager's post-push reconciliation hook).
    pub fn update_config(&self, id: &str, config: Value) -> RegistryResult<()> {
        let store = self.store.lock();
        let mut all: HashMap<String, AgentRecord> = store.load();
        let record = all.get_mut(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        record.config = config;
        store.save(&all)?;
        Ok(())
    }

    pub fn heartbeat(&self, id: &str) -> RegistryResult<()> {
        let store = self.store.lock();
        let mut all: HashMap<String, AgentRecord> = store.load();
        let record = all.get_mut(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        record.last_heartbeat = Utc::now();
        record.status = AgentStatus::Online;
        store.save(&all)?;
        Ok(())
    }

    pub fn mark_offline(&self, id: &str) -> RegistryResult<()> {
        let store = self.store.lock();
        let mut all: HashMap<String, AgentRecord> = store.load();
        let record = all.get_mut(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        record.status = AgentStatus::Offline;
        store.save(&all)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<AgentRecord> {
        let store = self.store.lock();
        let all: HashMap<String, AgentRecord> = store.load();
        all.get(id).cloned()
    }

    pub fn all(&self) -> Vec<AgentRecord> {
        let store = self.store.lock();
        let all: HashMap<String, AgentRecord> = store.load();
        all.into_values().collect()
    }

    /// Demote every online agent whose last heartbeat is older than
    /// `stale_threshold`. Returns the ids that were demoted.
    pub fn sweep_stale(&self, stale_threshold: Duration) -> Vec<String> {
        let store = self.store.lock();
        let mut all: HashMap<String, AgentRecord> = store.load();
        let now = Utc::now();
        let mut demoted = Vec::new();

        for (id, record) in all.iter_mut() {
            if record.status != AgentStatus::Online {
                continue;
            }
            let age = now.signed_duration_since(record.last_heartbeat);
            if age.to_std().unwrap_or(Duration::ZERO) > stale_threshold {
                record.status = AgentStatus::Offline;
                demoted.push(id.clone());
            }
        }

        if !demoted.is_empty() {
            if let Err(e) = store.save(&all) {
                warn!(error = %e, "failed to persist stale sweep results");
            }
            info!(count = demoted.len(), "agents marked offline by liveness sweep");
        }
        demoted
    }
}

/// Runs `registry.sweep_stale` every `interval` until `shutdown` fires.
pub async fn run_liveness_sweep(
    registry: std::sync::Arc<AgentRegistry>,
    interval: Duration,
    stale_threshold: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                registry.sweep_stale(stale_threshold);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_reconnect_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AgentRegistry::new(&dir.path().join("agents.json"));
        registry.register("a1", "host-a", "linux", "ssh-rsa AAAA").unwrap();

        let record = registry
            .reconnect("a1", "ssh-rsa AAAA", "host-a", "linux", Some("10.0.0.5"))
            .unwrap();
        assert_eq!(record.status, AgentStatus::Online);
        assert_eq!(record.connection_ip.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn reconnect_with_wrong_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AgentRegistry::new(&dir.path().join("agents.json"));
        registry.register("a1", "host-a", "linux", "ssh-rsa AAAA").unwrap();

        let result = registry.reconnect("a1", "ssh-rsa WRONG", "host-a", "linux", None);
        assert!(matches!(result, Err(RegistryError::DuplicatePublicKey)));
    }

    #[test]
    fn duplicate_public_key_across_different_ids_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AgentRegistry::new(&dir.path().join("agents.json"));
        registry.register("a1", "host-a", "linux", "ssh-rsa AAAA").unwrap();

        let result = registry.register("a2", "host-b", "linux", "ssh-rsa AAAA");
        assert!(matches!(result, Err(RegistryError::DuplicatePublicKey)));
    }

    #[test]
    fn sweep_stale_demotes_old_heartbeats() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AgentRegistry::new(&dir.path().join("agents.json"));
        registry.register("a1", "host-a", "linux", "ssh-rsa AAAA").unwrap();

        // Force the heartbeat far enough into the past to be stale.
        {
            let store = registry.store.lock();
            let mut all: HashMap<String, AgentRecord> = store.load();
            all.get_mut("a1").unwrap().last_heartbeat = Utc::now() - chrono::Duration::seconds(120);
            store.save(&all).unwrap();
        }

        let demoted = registry.sweep_stale(Duration::from_secs(60));
        assert_eq!(demoted, vec!["a1".to_string()]);
        assert_eq!(registry.get("a1").unwrap().status, AgentStatus::Offline);
    }
}
