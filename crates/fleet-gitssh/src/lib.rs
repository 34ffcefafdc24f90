//! GitSSHServer (manager, §4.6): authenticates pushes/fetches by agent
//! public key and spawns the matching git helper process against the
//! manager's single working tree.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use fleet_gitrepo::GitRepo;
use fleet_registry::AgentRegistry;
use russh::server::{Auth, Config, Handler, Msg, Server as RusshServer, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::{KeyPair, PublicKey};
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum GitSshError {
    #[error("ssh error: {0}")]
    Russh(#[from] russh::Error),
}

/// Constant-time byte comparison, used for the public-key match so
/// timing doesn't leak how many leading bytes matched.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[derive(Clone)]
struct GitSshServerInner {
    repo: Arc<GitRepo>,
    registry: Arc<AgentRegistry>,
    session_lock: Arc<AsyncMutex<()>>,
}

#[derive(Clone)]
pub struct FleetGitSshServer {
    inner: GitSshServerInner,
}

impl FleetGitSshServer {
    pub fn new(repo: Arc<GitRepo>, registry: Arc<AgentRegistry>) -> Self {
        Self {
            inner: GitSshServerInner {
                repo,
                registry,
                session_lock: Arc::new(AsyncMutex::new(())),
            },
        }
    }
}

impl RusshServer for FleetGitSshServer {
    type Handler = GitSshSession;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> Self::Handler {
        if let Some(addr) = peer {
            info!(peer = %addr, "inbound git-ssh connection");
        }
        GitSshSession {
            inner: self.inner.clone(),
            authenticated_agent_id: None,
            stdin_tx: None,
        }
    }
}

pub struct GitSshSession {
    inner: GitSshServerInner,
    authenticated_agent_id: Option<String>,
    stdin_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

#[async_trait]
impl Handler for GitSshSession {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        _user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let Ok(offered) = public_key.public_key_bytes() else {
            return Ok(Auth::Reject { proceed_with_methods: None });
        };

        for record in self.inner.registry.all() {
            let Ok(stored) = russh_keys::parse_public_key_base64(key_material(&record.public_key))
            else {
                continue;
            };
            let Ok(stored_bytes) = stored.public_key_bytes() else {
                continue;
            };
            if constant_time_eq(&offered, &stored_bytes) {
                self.authenticated_agent_id = Some(record.id.clone());
                info!(agent_id = %record.id, "git-ssh auth accepted");
                return Ok(Auth::Accept);
            }
        }

        warn!("git-ssh auth rejected: no matching agent public key");
        Ok(Auth::Reject { proceed_with_methods: None })
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        let Some(agent_id) = self.authenticated_agent_id.clone() else {
            let _ = session.exit_status_request(channel, 126);
            session.close(channel);
            return Ok(());
        };

        let Some((git_command, requested_path)) = parse_git_command(&command) else {
            warn!(command, "rejected git-ssh exec command");
            let _ = session.exit_status_request(channel, 126);
            session.close(channel);
            return Ok(());
        };

        let repo_path = self.inner.repo.path().to_path_buf();
        if !path_matches_repo(&requested_path, &repo_path) {
            warn!(requested_path, "git-ssh command path does not match canonical repo");
            let _ = session.exit_status_request(channel, 126);
            session.close(channel);
            return Ok(());
        }

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        self.stdin_tx = Some(stdin_tx);

        let handle = session.handle();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _guard = inner.session_lock.lock().await;
            run_git_helper(&inner, &handle, channel, git_command, &repo_path, &agent_id, stdin_rx).await;
        });

        Ok(())
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(tx) = &self.stdin_tx {
            let _ = tx.send(data.to_vec());
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Dropping the sender closes the git helper's stdin-forwarding
        // loop, which then shuts down the child's stdin.
        self.stdin_tx.take();
        Ok(())
    }
}

fn key_material(line: &str) -> &str {
    line.split_whitespace().nth(1).unwrap_or(line)
}

enum GitCommand {
    UploadPack,
    ReceivePack,
}

/// Only `git-upload-pack <path>` and `git-receive-pack <path>` are
/// accepted; anything else (including shell metacharacters in `<path>`)
/// is rejected outright.
fn parse_git_command(command: &str) -> Option<(GitCommand, String)> {
    let command = command.trim();
    let (verb, rest) = command.split_once(' ')?;
    let git_command = match verb {
        "git-upload-pack" => GitCommand::UploadPack,
        "git-receive-pack" => GitCommand::ReceivePack,
        _ => return None,
    };
    let path = rest.trim().trim_matches('\'').trim_matches('"').to_string();
    if path.is_empty() || path.contains(['\n', '\r', ';', '|', '&']) {
        return None;
    }
    Some((git_command, path))
}

fn path_matches_repo(requested: &str, repo_path: &std::path::Path) -> bool {
    let requested = requested.trim_start_matches('/');
    let canonical_name = repo_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    requested == canonical_name || requested.ends_with(&format!("/{canonical_name}"))
}

async fn run_git_helper(
    inner: &GitSshServerInner,
    handle: &russh::server::Handle,
    channel: ChannelId,
    git_command: GitCommand,
    repo_path: &std::path::Path,
    agent_id: &str,
    mut stdin_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let binary = match git_command {
        GitCommand::UploadPack => "git-upload-pack",
        GitCommand::ReceivePack => "git-receive-pack",
    };

    let spawned = Command::new(binary)
        .arg(repo_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            warn!(error = %e, binary, "failed to spawn git helper process");
            let _ = handle.exit_status_request(channel, 127).await;
            let _ = handle.close(channel).await;
            return;
        }
    };

    let mut stdin = child.stdin.take();
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let stdout_handle = handle.clone();
    let stdout_task = tokio::spawn(async move {
        if let Some(mut out) = stdout.take() {
            let mut buf = [0u8; 8192];
            loop {
                match out.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let _ = stdout_handle.data(channel, CryptoVec::from_slice(&buf[..n])).await;
                    }
                }
            }
        }
    });

    let stderr_handle = handle.clone();
    let stderr_task = tokio::spawn(async move {
        if let Some(mut err) = stderr.take() {
            let mut buf = [0u8; 8192];
            loop {
                match err.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let _ = stderr_handle.extended_data(channel, 1, CryptoVec::from_slice(&buf[..n])).await;
                    }
                }
            }
        }
    });

    let stdin_task = tokio::spawn(async move {
        if let Some(mut input) = stdin.take() {
            while let Some(chunk) = stdin_rx.recv().await {
                if input.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            let _ = input.shutdown().await;
        }
    });

    let status = child.wait().await;
    let _ = stdout_task.await;
    let _ = stderr_task.await;
    let _ = stdin_task.await;

    let exit_code = match &status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(_) => -1,
    };

    if matches!(git_command, GitCommand::ReceivePack) && exit_code == 0 {
        if let Err(e) = inner.repo.reconcile_after_push(&inner.registry, agent_id) {
            warn!(agent_id, error = %e, "post-push reconciliation failed");
        }
    }

    let _ = handle.exit_status_request(channel, exit_code as u32).await;
    let _ = handle.close(channel).await;
}

pub async fn run(
    bind_addr: SocketAddr,
    repo: Arc<GitRepo>,
    registry: Arc<AgentRegistry>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), GitSshError> {
    let host_key = KeyPair::generate_ed25519().ok_or(russh::Error::CouldNotReadKey)?;
    let config = Arc::new(Config {
        inactivity_timeout: Some(Duration::from_secs(600)),
        auth_rejection_time: Duration::from_secs(1),
        keys: vec![host_key],
        ..Default::default()
    });

    let server = FleetGitSshServer::new(repo, registry);
    info!(addr = %bind_addr, "git-ssh server listening");

    tokio::select! {
        result = russh::server::run(config, bind_addr, server) => {
            result.map_err(GitSshError::Russh)
        }
        _ = shutdown.changed() => {
            info!("git-ssh server shutting down");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_rejects_different_lengths() {
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn constant_time_eq_accepts_identical_bytes() {
        assert!(constant_time_eq(b"matching", b"matching"));
    }

    #[test]
    fn parse_git_command_accepts_upload_pack() {
        let (cmd, path) = parse_git_command("git-upload-pack '/fleet-config.git'").unwrap();
        assert!(matches!(cmd, GitCommand::UploadPack));
        assert_eq!(path, "fleet-config.git");
    }

    #[test]
    fn parse_git_command_rejects_other_verbs() {
        assert!(parse_git_command("git-shell -c ls").is_none());
    }

    #[test]
    fn parse_git_command_rejects_shell_metacharacters() {
        assert!(parse_git_command("git-upload-pack /repo; rm -rf /").is_none());
    }

    #[test]
    fn path_matches_repo_accepts_canonical_suffix() {
        let repo_path = std::path::Path::new("/srv/fleet/fleet-config");
        assert!(path_matches_repo("fleet-config", repo_path));
        assert!(path_matches_repo("/some/path/fleet-config", repo_path));
        assert!(!path_matches_repo("other-repo", repo_path));
    }
}
