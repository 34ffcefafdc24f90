//! Persistent state layout (manager side): everything the manager owns
//! hangs off a single configured data directory, mirroring
//! `fleet_agent::paths::AgentPaths`.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ManagerPaths {
    root: PathBuf,
}

impl ManagerPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("manager-config.json")
    }

    pub fn tokens_file(&self) -> PathBuf {
        self.root.join("tokens.json")
    }

    pub fn agents_file(&self) -> PathBuf {
        self.root.join("agents.json")
    }

    pub fn alerts_file(&self) -> PathBuf {
        self.root.join("alerts.json")
    }

    pub fn logs_file(&self) -> PathBuf {
        self.root.join("logs.json")
    }

    pub fn config_repo(&self) -> PathBuf {
        self.root.join("config-repo")
    }
}
