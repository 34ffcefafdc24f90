//! Persistent state layout (§6): every path the agent owns hangs off a
//! single configured directory.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AgentPaths {
    root: PathBuf,
}

impl AgentPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn agent_config(&self) -> PathBuf {
        self.root.join("agent-config.json")
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn alerts_file(&self) -> PathBuf {
        self.root.join("alerts.json")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("agent.log")
    }

    pub fn private_key(&self) -> PathBuf {
        self.root.join("agent_key")
    }

    pub fn agent_id_file(&self) -> PathBuf {
        self.root.join("agent-id.json")
    }

    pub fn config_repo(&self) -> PathBuf {
        self.root.join("config-repo")
    }
}
