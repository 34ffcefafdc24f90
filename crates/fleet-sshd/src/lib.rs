//! SSHServer (agent, inbound, §4.9): pubkey auth against an allowlist
//! sourced from config, with `exec` (no shell) and a minimal `sftp`
//! subsystem.

#![forbid(unsafe_code)]

mod allowlist;
mod exec;
mod sftp;

pub use sftp::{DEFAULT_MAX_FILENAME_LEN, DEFAULT_MAX_UPLOAD_BYTES};

use async_trait::async_trait;
use parking_lot::RwLock;
use russh::server::{Auth, Config, Handler, Msg, Server as RusshServer, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::{KeyPair, PublicKey};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SshdError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ssh error: {0}")]
    Russh(#[from] russh::Error),
}

#[derive(Clone)]
pub struct SshdSettings {
    pub bind_addr: SocketAddr,
    pub allowed_keys: Arc<RwLock<Vec<PublicKey>>>,
    pub sftp_roots: Vec<PathBuf>,
    pub max_upload_bytes: u64,
    pub max_filename_len: usize,
}

impl SshdSettings {
    pub fn new(bind_addr: SocketAddr, authorized_keys: &[String], sftp_roots: Vec<String>) -> Self {
        Self {
            bind_addr,
            allowed_keys: Arc::new(RwLock::new(allowlist::parse_allowed_keys(authorized_keys))),
            sftp_roots: allowlist::canonicalize_roots(&sftp_roots),
            max_upload_bytes: sftp::DEFAULT_MAX_UPLOAD_BYTES,
            max_filename_len: sftp::DEFAULT_MAX_FILENAME_LEN,
        }
    }

    /// Hot-reload the allowlist after a `reload-config`/Git pull command
    /// without restarting the listener.
    pub fn replace_allowed_keys(&self, authorized_keys: &[String]) {
        *self.allowed_keys.write() = allowlist::parse_allowed_keys(authorized_keys);
    }
}

#[derive(Clone)]
struct FleetSshServer {
    settings: SshdSettings,
}

impl RusshServer for FleetSshServer {
    type Handler = FleetSshSession;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> Self::Handler {
        if let Some(addr) = peer {
            info!(peer = %addr, "inbound ssh connection");
        }
        FleetSshSession {
            settings: self.settings.clone(),
            sftp_session: None,
        }
    }
}

struct FleetSshSession {
    settings: SshdSettings,
    sftp_session: Option<sftp::SftpSession>,
}

#[async_trait]
impl Handler for FleetSshSession {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let allowed = self.settings.allowed_keys.read();
        if allowlist::is_allowed(public_key, &allowed) {
            info!(user, fingerprint = %public_key.fingerprint(), "ssh auth accepted");
            Ok(Auth::Accept)
        } else {
            warn!(user, fingerprint = %public_key.fingerprint(), "ssh auth rejected: key not in allowlist");
            Ok(Auth::Reject { proceed_with_methods: None })
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name == "sftp" {
            self.sftp_session = Some(sftp::SftpSession::new(
                self.settings.sftp_roots.clone(),
                self.settings.max_upload_bytes,
                self.settings.max_filename_len,
            ));
            session.channel_success(channel);
        } else {
            session.channel_failure(channel);
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        let handle = session.handle();
        tokio::spawn(async move {
            match exec::run(&command).await {
                Ok(outcome) => {
                    if !outcome.stdout.is_empty() {
                        let _ = handle
                            .data(channel, CryptoVec::from_slice(&outcome.stdout))
                            .await;
                    }
                    if !outcome.stderr.is_empty() {
                        let _ = handle
                            .extended_data(channel, 1, CryptoVec::from_slice(&outcome.stderr))
                            .await;
                    }
                    let _ = handle.exit_status_request(channel, outcome.exit_code).await;
                }
                Err(e) => {
                    warn!(error = %e, "exec subsystem failed to spawn command");
                    let _ = handle.exit_status_request(channel, 127).await;
                }
            }
            let _ = handle.close(channel).await;
        });
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(sftp_session) = &mut self.sftp_session {
            let reply = sftp_session.feed(data);
            if !reply.is_empty() {
                session.data(channel, CryptoVec::from_slice(&reply));
            }
        }
        Ok(())
    }
}

/// Run the inbound SSH server until `shutdown` resolves. A fresh host
/// key is generated per process start (the agent's own identity key is
/// reserved for outbound Git-SSH auth and not reused here).
pub async fn run(
    settings: SshdSettings,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), SshdError> {
    let host_key = KeyPair::generate_ed25519().ok_or(russh::Error::CouldNotReadKey)?;
    let config = Arc::new(Config {
        inactivity_timeout: Some(Duration::from_secs(600)),
        auth_rejection_time: Duration::from_secs(1),
        keys: vec![host_key],
        ..Default::default()
    });

    let server = FleetSshServer { settings: settings.clone() };
    info!(addr = %settings.bind_addr, "ssh server listening");

    tokio::select! {
        result = russh::server::run(config, settings.bind_addr, server) => {
            result.map_err(SshdError::Russh)
        }
        _ = shutdown.changed() => {
            info!("ssh server shutting down");
            Ok(())
        }
    }
}
