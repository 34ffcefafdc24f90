//! Agent-local configuration: the three-source merge described in the
//! design (managed-from-Git fields, local-only fields, environment
//! overrides) and the bit-exact `AgentConfig` JSON shape persisted to
//! `agent-config.json`.

#![forbid(unsafe_code)]

pub mod types;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use types::{FileBrowserSettings, FileWatcherRule, FileWatcherSettings, LogSettings, Workflow};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("write {path}: {source}")]
    Write {
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

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Fields owned by the Git config repository (`agents/<id>.json`). Agent
/// code must never mutate these directly outside the GitSync backup/merge
/// flow (§3 invariant on `AgentConfig`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedConfig {
    #[serde(default)]
    pub ssh_server_port: u16,
    #[serde(default)]
    pub authorized_ssh_keys: Vec<String>,
    #[serde(default)]
    pub file_watcher_settings: FileWatcherSettings,
    #[serde(default)]
    pub file_watcher_rules: Vec<FileWatcherRule>,
    #[serde(default)]
    pub file_browser_settings: FileBrowserSettings,
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub workflows: Vec<Workflow>,
}

/// Bit-exact agent config JSON shape (§6). Combines the managed fields
/// above with the local-only fields (`agentId`, `registered`,
/// `managerUrl`) in one file, matching the original tool's single config
/// file layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub agent_id: String,
    pub registered: bool,
    pub manager_url: String,
    /// Present only while the agent has not yet completed registration;
    /// cleared and omitted once `registered` flips true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_token: Option<String>,
    #[serde(flatten)]
    pub managed: ManagedConfig,
}

impl AgentConfig {
    pub fn new(agent_id: String, manager_url: String) -> Self {
        Self {
            agent_id,
            registered: false,
            manager_url,
            registration_token: None,
            managed: ManagedConfig::default(),
        }
    }
}

/// Owns the on-disk `agent-config.json` and applies the three-source
/// merge: file contents, then environment overrides, applied on every
/// load.
pub struct LocalConfig {
    path: PathBuf,
    config: AgentConfig,
}

const ENV_MANAGER_URL: &str = "FLEET_AGENT_MANAGER_URL";
const ENV_SCAN_DIR: &str = "FLEET_AGENT_SCAN_DIR";
const ENV_LOG_LEVEL: &str = "FLEET_AGENT_LOG_LEVEL";

impl LocalConfig {
    /// Load from `path`, or synthesize a fresh unregistered config around
    /// `agent_id`/`manager_url` if the file does not yet exist.
    pub fn load_or_init(
        path: &Path,
        agent_id: &str,
        default_manager_url: &str,
    ) -> ConfigResult<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                source: e,
            })?;
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                source: e,
            })?
        } else {
            debug!(path = %path.display(), "no local config found, initializing default");
            AgentConfig::new(agent_id.to_string(), default_manager_url.to_string())
        };

        apply_env_overrides(&mut config);

        Ok(Self {
            path: path.to_path_buf(),
            config,
        })
    }

    pub fn get(&self) -> &AgentConfig {
        &self.config
    }

    pub fn save(&self) -> ConfigResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        let content = serde_json::to_string_pretty(&self.config).map_err(|e| {
            ConfigError::Parse {
                path: self.path.display().to_string(),
                source: e,
            }
        })?;
        std::fs::write(&self.path, content).map_err(|e| ConfigError::Write {
            path: self.path.display().to_string(),
            source: e,
        })
    }

    /// Mark registration complete: `registered=true`, token erased,
    /// persisted atomically (write-then-rename would be overkill at this
    /// scale — a single `fs::write` is what the teacher's config does).
    pub fn mark_registered(&mut self) -> ConfigResult<()> {
        self.config.registered = true;
        self.config.registration_token = None;
        info!(agent_id = %self.config.agent_id, "registration complete, token cleared");
        self.save()
    }

    /// Clear `registered` after a reconnection is rejected with "agent not
    /// found" (§4.3).
    pub fn clear_registered(&mut self) -> ConfigResult<()> {
        self.config.registered = false;
        self.save()
    }

    /// Apply an updated managed-config blob received via Git pull or a
    /// `config` command push. Local-only fields are untouched.
    pub fn apply_managed_update(&mut self, managed: ManagedConfig) -> ConfigResult<()> {
        self.config.managed = managed;
        self.save()
    }

    pub fn set_token(&mut self, token: String) -> ConfigResult<()> {
        self.config.registration_token = Some(token);
        self.save()
    }
}

fn apply_env_overrides(config: &mut AgentConfig) {
    if let Ok(url) = std::env::var(ENV_MANAGER_URL) {
        config.manager_url = url;
    }
    if let Ok(dir) = std::env::var(ENV_SCAN_DIR) {
        config.managed.file_watcher_settings.scan_dir = dir;
    }
    if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
        config.managed.log_settings.level = level;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_default_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent-config.json");
        let local = LocalConfig::load_or_init(&path, "agent-1", "wss://mgr").unwrap();
        assert_eq!(local.get().agent_id, "agent-1");
        assert!(!local.get().registered);
    }

    #[test]
    fn mark_registered_clears_token_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent-config.json");
        let mut local = LocalConfig::load_or_init(&path, "agent-1", "wss://mgr").unwrap();
        local.set_token("tok-abc".to_string()).unwrap();
        local.mark_registered().unwrap();

        assert!(local.get().registered);
        assert!(local.get().registration_token.is_none());

        let reloaded = LocalConfig::load_or_init(&path, "agent-1", "wss://mgr").unwrap();
        assert!(reloaded.get().registered);
        assert!(reloaded.get().registration_token.is_none());
    }

    #[test]
    fn env_override_wins_over_file_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent-config.json");
        std::env::set_var(ENV_MANAGER_URL, "wss://override");
        let local = LocalConfig::load_or_init(&path, "agent-1", "wss://mgr").unwrap();
        assert_eq!(local.get().manager_url, "wss://override");
        std::env::remove_var(ENV_MANAGER_URL);
    }

    #[test]
    fn agent_config_json_shape_is_bit_exact() {
        let config = AgentConfig::new("a1".into(), "wss://mgr".into());
        let v: serde_json::Value = serde_json::to_value(&config).unwrap();
        for key in [
            "agentId",
            "registered",
            "managerUrl",
            "sshServerPort",
            "authorizedSSHKeys",
            "fileWatcherSettings",
            "fileWatcherRules",
            "fileBrowserSettings",
            "logSettings",
            "workflows",
        ] {
            assert!(v.get(key).is_some(), "missing key {key}");
        }
    }
}
