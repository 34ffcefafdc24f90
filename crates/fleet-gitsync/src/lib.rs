//! Agent-side Git config sync (§4.5).
//!
//! Owns the agent's working copy of the manager's config repository,
//! accessed over SSH with the agent's own identity key. Every operation
//! that could discard local work creates a backup first — either a
//! tagged stash or a `backup/<id>/<ts>` branch — before it resets the
//! working tree, matching the "never discard local changes without a
//! backup first" invariant.
//!
//! Grounded on the `git2`-based `GitOperations` trait used elsewhere in
//! this codebase family for git plumbing that would otherwise shell out.

#![forbid(unsafe_code)]

use chrono::Utc;
use git2::{
    Cred, FetchOptions, PushOptions, RemoteCallbacks, Repository, ResetType, Signature,
    StashFlags,
};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum GitSyncError {
    #[error("authentication failed (agent public key not yet authorized by manager): {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("working tree and remote have diverged — manual merge required")]
    Diverged,
    #[error("merge conflict — repository left in conflicted state: {0}")]
    Conflict(String),
    #[error("git error: {0}")]
    Git(#[from] git2::Error),
}

impl GitSyncError {
    /// Transient-transport classification (§7 error kind 1): safe to
    /// retry with backoff rather than surface to the operator.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GitSyncError::Network(_))
    }
}

pub type GitSyncResult<T> = Result<T, GitSyncError>;

#[derive(Debug, Clone, Default)]
pub struct DivergenceStatus {
    pub ahead: usize,
    pub behind: usize,
    pub dirty: bool,
}

impl DivergenceStatus {
    pub fn diverged(&self) -> bool {
        self.ahead > 0 && self.behind > 0
    }
}

#[derive(Debug, Clone)]
pub enum BackupRef {
    Stash { index: usize, message: String },
    Branch { name: String },
}

pub struct GitSync {
    repo_path: PathBuf,
    remote_url: String,
    agent_id: String,
    ssh_private_key: PathBuf,
}

impl GitSync {
    pub fn new(
        repo_path: PathBuf,
        remote_url: String,
        agent_id: String,
        ssh_private_key: PathBuf,
    ) -> Self {
        Self {
            repo_path,
            remote_url,
            agent_id,
            ssh_private_key,
        }
    }

    fn callbacks(&self) -> RemoteCallbacks<'_> {
        let mut callbacks = RemoteCallbacks::new();
        let key_path = self.ssh_private_key.clone();
        callbacks.credentials(move |url, username_from_url, _allowed| {
            let username = username_from_url.unwrap_or("git");
            Cred::ssh_key(username, None, &key_path, None).map_err(|e| {
                git2::Error::from_str(&format!("ssh credential error for {url}: {e}"))
            })
        });
        callbacks
    }

    fn open_or_none(&self) -> Option<Repository> {
        Repository::open(&self.repo_path).ok()
    }

    /// Clone if the working copy does not exist yet. Per §4.5, a clone
    /// failure at first boot (the agent's key is not yet authorized) is
    /// not fatal — it is reported as `Auth`/`Network` for the caller to
    /// retry on a later tick.
    pub fn initialize(&self) -> GitSyncResult<()> {
        if self.open_or_none().is_some() {
            return Ok(());
        }
        info!(remote = %self.remote_url, "cloning config repository");
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(self.callbacks());
        let mut builder = git2::build::RepoBuilder::new();
        builder.fetch_options(fetch_opts);
        builder
            .clone(&self.remote_url, &self.repo_path)
            .map_err(classify_clone_error)?;
        Ok(())
    }

    fn repo(&self) -> GitSyncResult<Repository> {
        Ok(Repository::open(&self.repo_path)?)
    }

    fn signature(&self) -> GitSyncResult<Signature<'static>> {
        Ok(Signature::now(
            &format!("Agent-{}", self.agent_id),
            &format!("{}@controlcenter.local", self.agent_id),
        )?)
    }

    /// `ahead/behind` plus working-tree dirty flag, as `git status -sb`
    /// would report (§4.5 divergence detection).
    pub fn status(&self) -> GitSyncResult<DivergenceStatus> {
        let repo = self.repo()?;
        let local = repo.head()?.peel_to_commit()?.id();
        let upstream_ref = repo.find_branch(
            "main",
            git2::BranchType::Local,
        );
        let (ahead, behind) = match upstream_ref.ok().and_then(|b| b.upstream().ok()) {
            Some(upstream) => {
                let remote_oid = upstream.get().target();
                match remote_oid {
                    Some(remote_oid) => repo.graph_ahead_behind(local, remote_oid)?,
                    None => (0, 0),
                }
            }
            None => (0, 0),
        };

        let dirty = repo.statuses(None)?.iter().any(|s| !s.status().is_ignored());

        Ok(DivergenceStatus {
            ahead,
            behind,
            dirty,
        })
    }

    /// Create a backup of uncommitted and/or unpushed work, tagged
    /// `Agent-<id>-backup-<ts>`. Returns `None` if there was nothing to
    /// back up.
    pub fn backup(&self) -> GitSyncResult<Option<BackupRef>> {
        let status = self.status()?;
        if !status.dirty && status.ahead == 0 {
            return Ok(None);
        }

        let ts = Utc::now().format("%Y%m%d%H%M%S");
        let message = format!("Agent-{}-backup-{}", self.agent_id, ts);

        if status.dirty {
            let mut repo = self.repo()?;
            let sig = self.signature()?;
            let oid = repo.stash_save(&sig, &message, Some(StashFlags::INCLUDE_UNTRACKED))?;
            info!(stash = %oid, %message, "created stash backup before destructive sync");
            return Ok(Some(BackupRef::Stash { index: 0, message }));
        }

        // Ahead but clean: snapshot as a branch instead of a stash.
        let branch_name = format!("backup/{}/{}", self.agent_id, ts);
        let repo = self.repo()?;
        let head_commit = repo.head()?.peel_to_commit()?;
        repo.branch(&branch_name, &head_commit, false)?;
        info!(branch = %branch_name, "created backup branch before destructive sync");
        Ok(Some(BackupRef::Branch { name: branch_name }))
    }

    /// Safe pull (§4.5): backup first if needed, fetch, hard-reset to
    /// remote HEAD. Never discards local work without a backup.
    pub fn pull_safe(&self, branch: &str) -> GitSyncResult<Option<BackupRef>> {
        let backup = self.backup()?;

        let repo = self.repo()?;
        let mut remote = repo.find_remote("origin")?;
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(self.callbacks());
        remote
            .fetch(&[branch], Some(&mut fetch_opts), None)
            .map_err(classify_clone_error)?;

        let fetch_head = repo.find_reference("FETCH_HEAD")?;
        let fetch_commit = repo.reference_to_annotated_commit(&fetch_head)?;
        let target_commit = repo.find_commit(fetch_commit.id())?;

        repo.reset(target_commit.as_object(), ResetType::Hard, None)?;
        info!(branch, "reset working tree to remote HEAD");

        Ok(backup)
    }

    /// Stage all, commit with the agent's attributed identity, push HEAD.
    pub fn push(&self, branch: &str, message: &str) -> GitSyncResult<()> {
        let repo = self.repo()?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = self.signature()?;
        let parent = repo.head()?.peel_to_commit()?;

        repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            message,
            &tree,
            &[&parent],
        )?;

        let mut remote = repo.find_remote("origin")?;
        let mut push_opts = PushOptions::new();
        push_opts.remote_callbacks(self.callbacks());
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote
            .push(&[&refspec], Some(&mut push_opts))
            .map_err(classify_clone_error)?;
        info!(branch, "pushed config changes");
        Ok(())
    }

    /// Backup -> pull -> re-apply backup. On conflict, the repository is
    /// left in a conflicted state with `GitSyncError::Conflict`
    /// describing next steps; it is never auto-resolved.
    pub fn merge(&self, branch: &str) -> GitSyncResult<()> {
        let backup = self.backup()?;
        self.pull_safe(branch)?;

        match backup {
            Some(BackupRef::Stash { .. }) => {
                let mut repo = self.repo()?;
                let mut found = None;
                repo.stash_foreach(|idx, msg, _oid| {
                    if msg.contains(&format!("Agent-{}-backup-", self.agent_id)) {
                        found = Some(idx);
                        false
                    } else {
                        true
                    }
                })?;
                if let Some(idx) = found {
                    if let Err(e) = repo.stash_pop(idx, None) {
                        return Err(GitSyncError::Conflict(format!(
                            "stash re-apply failed: {e}. Resolve conflicts manually, then run \
                             `git stash drop` once satisfied."
                        )));
                    }
                }
                Ok(())
            }
            Some(BackupRef::Branch { name }) => {
                warn!(
                    branch = %name,
                    "ahead-only backup created during merge; branch left for manual cherry-pick"
                );
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Enumerate stashes and `backup/<id>/*` branches belonging to this
    /// agent, most recent first.
    pub fn list_backups(&self) -> GitSyncResult<Vec<BackupRef>> {
        let mut repo = self.repo()?;
        let mut backups = Vec::new();

        let prefix = format!("Agent-{}-backup-", self.agent_id);
        repo.stash_foreach(|idx, msg, _oid| {
            if msg.contains(&prefix) {
                backups.push(BackupRef::Stash {
                    index: idx,
                    message: msg.to_string(),
                });
            }
            true
        })?;

        let branch_prefix = format!("backup/{}/", self.agent_id);
        let branches = repo.branches(Some(git2::BranchType::Local))?;
        for entry in branches {
            let (branch, _) = entry?;
            if let Some(name) = branch.name()? {
                if name.starts_with(&branch_prefix) {
                    backups.push(BackupRef::Branch {
                        name: name.to_string(),
                    });
                }
            }
        }

        Ok(backups)
    }

    /// Restore the most recently created agent-tagged stash (`recover
    /// latest`), or a specific stash/branch by name.
    pub fn recover_latest(&self) -> GitSyncResult<bool> {
        let mut repo = self.repo()?;
        let prefix = format!("Agent-{}-backup-", self.agent_id);
        let mut found = None;
        repo.stash_foreach(|idx, msg, _oid| {
            if found.is_none() && msg.contains(&prefix) {
                found = Some(idx);
            }
            true
        })?;

        match found {
            Some(idx) => {
                repo.stash_apply(idx, None)
                    .map_err(|e| GitSyncError::Conflict(e.to_string()))?;
                info!(index = idx, "recovered latest agent backup");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn classify_clone_error(e: git2::Error) -> GitSyncError {
    use git2::ErrorClass;
    match e.class() {
        ErrorClass::Ssh | ErrorClass::Net if e.message().to_lowercase().contains("auth") => {
            GitSyncError::Auth(e.message().to_string())
        }
        ErrorClass::Ssh | ErrorClass::Net => GitSyncError::Network(e.message().to_string()),
        _ => GitSyncError::Git(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn init_bare_repo(path: &Path) {
        Command::new("git")
            .args(["init", "--bare"])
            .arg(path)
            .output()
            .expect("git init --bare");
    }

    fn init_repo_with_commit(path: &Path, origin: &Path) -> Repository {
        let repo = Repository::init(path).expect("init");
        {
            let sig = Signature::now("Test", "test@example.com").unwrap();
            let mut index = repo.index().unwrap();
            std::fs::write(path.join("README.md"), "hello").unwrap();
            index.add_path(Path::new("README.md")).unwrap();
            index.write().unwrap();
            let tree_id = index.write_tree().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
                .unwrap();
        }
        repo.remote("origin", origin.to_str().unwrap()).unwrap();
        repo
    }

    #[test]
    fn divergence_status_reports_clean_repo() {
        let dir = tempfile::tempdir().unwrap();
        let origin_dir = dir.path().join("origin.git");
        init_bare_repo(&origin_dir);

        let work_dir = dir.path().join("work");
        std::fs::create_dir_all(&work_dir).unwrap();
        init_repo_with_commit(&work_dir, &origin_dir);

        let sync = GitSync::new(
            work_dir.clone(),
            origin_dir.to_str().unwrap().to_string(),
            "a1".to_string(),
            dir.path().join("key"),
        );
        let status = sync.status().unwrap();
        assert!(!status.dirty);
    }

    #[test]
    fn backup_returns_none_when_clean_and_not_ahead() {
        let dir = tempfile::tempdir().unwrap();
        let origin_dir = dir.path().join("origin.git");
        init_bare_repo(&origin_dir);
        let work_dir = dir.path().join("work");
        std::fs::create_dir_all(&work_dir).unwrap();
        init_repo_with_commit(&work_dir, &origin_dir);

        let sync = GitSync::new(
            work_dir,
            origin_dir.to_str().unwrap().to_string(),
            "a1".to_string(),
            dir.path().join("key"),
        );
        assert!(sync.backup().unwrap().is_none());
    }

    #[test]
    fn backup_creates_stash_when_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let origin_dir = dir.path().join("origin.git");
        init_bare_repo(&origin_dir);
        let work_dir = dir.path().join("work");
        std::fs::create_dir_all(&work_dir).unwrap();
        init_repo_with_commit(&work_dir, &origin_dir);

        std::fs::write(work_dir.join("README.md"), "dirty edit").unwrap();

        let sync = GitSync::new(
            work_dir,
            origin_dir.to_str().unwrap().to_string(),
            "a1".to_string(),
            dir.path().join("key"),
        );
        let backup = sync.backup().unwrap();
        assert!(matches!(backup, Some(BackupRef::Stash { .. })));

        let backups = sync.list_backups().unwrap();
        assert_eq!(backups.len(), 1);
    }
}
