//! Agent identity: a persistent RSA 2048 keypair plus a stable `agentId`.
//!
//! The keypair authenticates the agent to the manager's Git-over-SSH
//! server (§4.6) and, in the other direction, seeds the inbound SSH
//! server's client allowlist is managed separately in `fleet-sshd`. This
//! crate only owns generation, persistence, and OpenSSH export of the
//! agent's own identity.

#![forbid(unsafe_code)]

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use ssh_key::{Algorithm, HashAlg, LineEnding, PrivateKey};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ssh key error: {0}")]
    SshKey(#[from] ssh_key::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type IdentityResult<T> = Result<T, IdentityError>;

fn io_err(path: &Path, source: std::io::Error) -> IdentityError {
    IdentityError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Persistent, stable agent identity.
///
/// `agentId` is generated once (UUID v4) and never changes for the life of
/// the install; the RSA keypair is likewise generated once and loaded on
/// every subsequent start.
pub struct AgentIdentity {
    pub agent_id: String,
    private_key: PrivateKey,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredAgentId {
    #[serde(rename = "agentId")]
    agent_id: String,
}

impl AgentIdentity {
    /// Load the keypair and agent id from `key_path`/`id_path`, generating
    /// and persisting either one that is missing. Private key file is
    /// written with owner-only (`0600`) permissions on Unix.
    pub fn load_or_create(key_path: &Path, id_path: &Path) -> IdentityResult<Self> {
        let private_key = if key_path.exists() {
            debug!(path = %key_path.display(), "loading existing agent key");
            PrivateKey::read_openssh_file(key_path)?
        } else {
            debug!(path = %key_path.display(), "generating new agent RSA keypair");
            let key = PrivateKey::random(
                &mut OsRng,
                Algorithm::Rsa {
                    hash: Some(HashAlg::Sha256),
                },
            )?;
            if let Some(parent) = key_path.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
            key.write_openssh_file(key_path, LineEnding::LF)?;
            restrict_permissions(key_path)?;
            info!(path = %key_path.display(), "generated and saved agent identity key");
            key
        };

        let agent_id = if id_path.exists() {
            let content = fs::read_to_string(id_path).map_err(|e| io_err(id_path, e))?;
            let stored: StoredAgentId = serde_json::from_str(&content)?;
            stored.agent_id
        } else {
            let id = Uuid::new_v4().to_string();
            let stored = StoredAgentId {
                agent_id: id.clone(),
            };
            if let Some(parent) = id_path.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
            fs::write(id_path, serde_json::to_string_pretty(&stored)?)
                .map_err(|e| io_err(id_path, e))?;
            info!(agent_id = %id, "generated new agent id");
            id
        };

        Ok(Self {
            agent_id,
            private_key,
        })
    }

    /// Public key in OpenSSH `authorized_keys` form, e.g. `ssh-rsa AAAA...`.
    pub fn public_key_authorized_keys(&self) -> IdentityResult<String> {
        Ok(self
            .private_key
            .public_key()
            .to_openssh()
            .map(|s| s.trim().to_string())?)
    }

    /// Underlying public key fingerprint (SHA256, OpenSSH form), useful for
    /// log lines and diagnostics.
    pub fn fingerprint(&self) -> String {
        self.private_key
            .public_key()
            .fingerprint(HashAlg::Sha256)
            .to_string()
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> IdentityResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path).map_err(|e| io_err(path, e))?.permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> IdentityResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_persists_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key_path = dir.path().join("agent_key");
        let id_path = dir.path().join("agent-id.json");

        let id1 = AgentIdentity::load_or_create(&key_path, &id_path).expect("create");
        assert!(key_path.exists());
        assert!(id_path.exists());
        assert!(!id1.agent_id.is_empty());

        let id2 = AgentIdentity::load_or_create(&key_path, &id_path).expect("reload");
        assert_eq!(id1.agent_id, id2.agent_id);
        assert_eq!(
            id1.public_key_authorized_keys().unwrap(),
            id2.public_key_authorized_keys().unwrap()
        );
    }

    #[test]
    fn public_key_is_rsa_authorized_keys_form() {
        let dir = tempfile::tempdir().expect("tempdir");
        let identity =
            AgentIdentity::load_or_create(&dir.path().join("k"), &dir.path().join("id.json"))
                .expect("create");
        let pk = identity.public_key_authorized_keys().expect("pubkey");
        assert!(pk.starts_with("ssh-rsa "));
    }

    #[cfg(unix)]
    #[test]
    fn private_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let key_path = dir.path().join("agent_key");
        AgentIdentity::load_or_create(&key_path, &dir.path().join("id.json")).expect("create");
        let mode = fs::metadata(&key_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
