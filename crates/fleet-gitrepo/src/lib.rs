//! GitRepo (manager, §3, §4.6): owns the single working tree that
//! agents push configuration to over `GitSSHServer`, and reconciles the
//! agent registry from `agents/<id>.json` after every successful push.

#![forbid(unsafe_code)]

use fleet_registry::AgentRegistry;
use git2::{Repository, RepositoryInitOptions};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum GitRepoError {
    #[error("git error: {0}")]
    Git(#[from] git2::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type GitRepoResult<T> = Result<T, GitRepoError>;

const README: &str = "# Fleet configuration repository\n\nManaged by the control-plane manager. Agent and workflow files are\nwritten by agents over Git-SSH and reconciled into the registry after\nevery push.\n";

/// The single working tree this manager owns. Every SSH session that
/// runs `git-receive-pack` against it must be serialized by the caller
/// (`GitSSHServer`) since `git2` operations are not safe to interleave
/// across threads on the same repository.
pub struct GitRepo {
    path: PathBuf,
}

impl GitRepo {
    /// Open the repository at `path`, initializing it (bare working
    /// layout with the standard directory skeleton) if it doesn't exist
    /// yet.
    pub fn open_or_init(path: &Path) -> GitRepoResult<Self> {
        if path.join(".git").exists() {
            return Ok(Self { path: path.to_path_buf() });
        }

        std::fs::create_dir_all(path)?;
        // Pin the initial branch to "main" regardless of the host's
        // `init.defaultBranch`, since `fleet-gitsync` assumes that name.
        let mut init_opts = RepositoryInitOptions::new();
        init_opts.initial_head("main");
        let repo = Repository::init_opts(path, &init_opts)?;
        std::fs::create_dir_all(path.join("agents"))?;
        std::fs::create_dir_all(path.join("workflows"))?;
        std::fs::create_dir_all(path.join("templates"))?;
        std::fs::write(path.join("README.md"), README)?;

        let mut index = repo.index()?;
        index.add_path(Path::new("README.md"))?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let signature = git2::Signature::now("Fleet Manager", "manager@controlcenter.local")?;
        repo.commit(Some("HEAD"), &signature, &signature, "initial commit", &tree, &[])?;

        info!(path = %path.display(), "initialized manager config repository");
        Ok(Self { path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn git_dir(&self) -> PathBuf {
        self.path.join(".git")
    }

    /// Read `agents/<id>.json` as raw JSON, if present.
    pub fn read_agent_config(&self, agent_id: &str) -> GitRepoResult<Option<Value>> {
        let file = self.path.join("agents").join(format!("{agent_id}.json"));
        match std::fs::read_to_string(&file) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GitRepoError::Io(e)),
        }
    }

    /// Post-push hook (§4.6): after a successful `receive-pack`,
    /// re-read the pushing agent's config file from the now-updated
    /// working tree and merge it into the registry's `config` field.
    pub fn reconcile_after_push(
        &self,
        registry: &Arc<AgentRegistry>,
        agent_id: &str,
    ) -> GitRepoResult<()> {
        let Some(config) = self.read_agent_config(agent_id)? else {
            warn!(agent_id, "post-push reconcile found no config file for agent");
            return Ok(());
        };

        match registry.get(agent_id) {
            Some(_) => {
                if let Err(e) = registry.update_config(agent_id, config) {
                    warn!(agent_id, error = %e, "failed to reconcile agent record after push");
                }
            }
            None => warn!(agent_id, "post-push reconcile found no registry record for agent"),
        }

        info!(agent_id, "reconciled agent config from pushed working tree");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_or_init_creates_skeleton_once() {
        let dir = tempfile::tempdir().unwrap();
        let repo = GitRepo::open_or_init(dir.path()).unwrap();
        assert!(dir.path().join("README.md").exists());
        assert!(dir.path().join("agents").exists());

        // Reopening an existing repo must not reinitialize it.
        let repo2 = GitRepo::open_or_init(dir.path()).unwrap();
        assert_eq!(repo.path(), repo2.path());
    }

    #[test]
    fn read_agent_config_returns_none_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let repo = GitRepo::open_or_init(dir.path()).unwrap();
        assert!(repo.read_agent_config("unknown").unwrap().is_none());
    }

    #[test]
    fn reconcile_merges_pushed_config_into_registry() {
        let dir = tempfile::tempdir().unwrap();
        let repo = GitRepo::open_or_init(dir.path()).unwrap();
        let registry = Arc::new(AgentRegistry::new(&dir.path().join("agents.json")));
        registry.register("a1", "host-a", "linux", "ssh-rsa AAAA").unwrap();

        std::fs::write(
            dir.path().join("agents/a1.json"),
            serde_json::json!({"sshServerPort": 2222}).to_string(),
        )
        .unwrap();

        repo.reconcile_after_push(&registry, "a1").unwrap();
        let record = registry.get("a1").unwrap();
        assert_eq!(record.config["sshServerPort"], 2222);
    }
}
