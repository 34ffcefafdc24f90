//! `ManagerConfig` (§0 ambient stack): JSON-on-disk settings for the
//! manager binary, with `FLEET_MANAGER_*` environment overrides applied
//! after load — the same file-then-env merge `LocalConfig` uses
//! agent-side, minus the managed-from-Git layer that only makes sense
//! for an agent.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type ManagerConfigResult<T> = Result<T, ManagerConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerConfig {
    #[serde(default = "default_ws_addr")]
    pub ws_addr: SocketAddr,
    #[serde(default = "default_git_ssh_addr")]
    pub git_ssh_addr: SocketAddr,
    #[serde(default)]
    pub alert_webhook_urls: Vec<String>,
    #[serde(default = "default_sweep_interval_secs")]
    pub liveness_sweep_interval_secs: u64,
    #[serde(default = "default_stale_threshold_secs")]
    pub liveness_stale_threshold_secs: u64,
}

fn default_ws_addr() -> SocketAddr {
    "0.0.0.0:7900".parse().unwrap()
}

fn default_git_ssh_addr() -> SocketAddr {
    "0.0.0.0:8022".parse().unwrap()
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_stale_threshold_secs() -> u64 {
    60
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            ws_addr: default_ws_addr(),
            git_ssh_addr: default_git_ssh_addr(),
            alert_webhook_urls: Vec::new(),
            liveness_sweep_interval_secs: default_sweep_interval_secs(),
            liveness_stale_threshold_secs: default_stale_threshold_secs(),
        }
    }
}

impl ManagerConfig {
    /// Load `path` if present, falling back to defaults; then apply
    /// `FLEET_MANAGER_*` environment overrides regardless of which path
    /// was taken.
    pub fn load(path: &Path) -> ManagerConfigResult<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| ManagerConfigError::Read {
                path: path.display().to_string(),
                source: e,
            })?;
            serde_json::from_str(&content).map_err(|e| ManagerConfigError::Parse {
                path: path.display().to_string(),
                source: e,
            })?
        } else {
            ManagerConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("FLEET_MANAGER_WS_ADDR") {
            if let Ok(parsed) = addr.parse() {
                self.ws_addr = parsed;
            }
        }
        if let Ok(addr) = std::env::var("FLEET_MANAGER_GIT_SSH_ADDR") {
            if let Ok(parsed) = addr.parse() {
                self.git_ssh_addr = parsed;
            }
        }
        if let Ok(urls) = std::env::var("FLEET_MANAGER_ALERT_WEBHOOK_URLS") {
            self.alert_webhook_urls = urls.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ManagerConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.ws_addr, default_ws_addr());
    }

    #[test]
    fn file_values_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manager.json");
        std::fs::write(&path, r#"{"wsAddr":"127.0.0.1:9000","gitSshAddr":"127.0.0.1:9001"}"#).unwrap();
        let config = ManagerConfig::load(&path).unwrap();
        assert_eq!(config.ws_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.git_ssh_addr, "127.0.0.1:9001".parse().unwrap());
    }
}
