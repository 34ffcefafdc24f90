//! TokenStore (manager): registration-token lifecycle (§3, §4.4).
//!
//! A token is valid iff `usedAt == None && now < expiresAt`; consumption
//! is atomic under the store's own lock so two racing registrations
//! can never both succeed against the same token.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use fleet_persist::JsonStore;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token not found")]
    NotFound,
    #[error("token already used")]
    AlreadyUsed,
    #[error("token expired")]
    Expired,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TokenResult<T> = Result<T, TokenError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationToken {
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub used_by: Option<String>,
}

impl RegistrationToken {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.used_at.is_none() && now < self.expires_at
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Persisted to `tokens.json`, a map `token -> RegistrationToken`.
pub struct TokenStore {
    store: Mutex<JsonStore>,
}

impl TokenStore {
    pub fn new(path: &Path) -> Self {
        Self {
            store: Mutex::new(JsonStore::at_path(path.to_path_buf())),
        }
    }

    /// Mint and persist a new token valid for `ttl`.
    pub fn create(&self, ttl: chrono::Duration, metadata: Option<Value>) -> TokenResult<RegistrationToken> {
        let now = Utc::now();
        let token = RegistrationToken {
            token: random_token(),
            created_at: now,
            expires_at: now + ttl,
            metadata,
            used_at: None,
            used_by: None,
        };

        let store = self.store.lock();
        let mut all: HashMap<String, RegistrationToken> = store.load();
        all.insert(token.token.clone(), token.clone());
        store.save(&all)?;
        Ok(token)
    }

    /// Validate and atomically consume `token` for `agent_id`. The check
    /// and the write happen under the same lock acquisition so two
    /// concurrent registrations racing on the same token can't both win.
    pub fn validate_and_consume(&self, token: &str, agent_id: &str) -> TokenResult<()> {
        let store = self.store.lock();
        let mut all: HashMap<String, RegistrationToken> = store.load();
        let entry = all.get_mut(token).ok_or(TokenError::NotFound)?;

        let now = Utc::now();
        if entry.used_at.is_some() {
            return Err(TokenError::AlreadyUsed);
        }
        if now >= entry.expires_at {
            return Err(TokenError::Expired);
        }

        entry.used_at = Some(now);
        entry.used_by = Some(agent_id.to_string());
        store.save(&all)?;
        Ok(())
    }

    pub fn get(&self, token: &str) -> Option<RegistrationToken> {
        let store = self.store.lock();
        let all: HashMap<String, RegistrationToken> = store.load();
        all.get(token).cloned()
    }

    pub fn all(&self) -> Vec<RegistrationToken> {
        let store = self.store.lock();
        let all: HashMap<String, RegistrationToken> = store.load();
        all.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_token_validates_and_consumes_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(&dir.path().join("tokens.json"));
        let token = store.create(chrono::Duration::hours(1), None).unwrap();

        store.validate_and_consume(&token.token, "agent-1").unwrap();
        let result = store.validate_and_consume(&token.token, "agent-2");
        assert!(matches!(result, Err(TokenError::AlreadyUsed)));
    }

    #[test]
    fn expired_token_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(&dir.path().join("tokens.json"));
        let token = store.create(chrono::Duration::seconds(-1), None).unwrap();

        let result = store.validate_and_consume(&token.token, "agent-1");
        assert!(matches!(result, Err(TokenError::Expired)));
    }

    #[test]
    fn unknown_token_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(&dir.path().join("tokens.json"));
        let result = store.validate_and_consume("does-not-exist", "agent-1");
        assert!(matches!(result, Err(TokenError::NotFound)));
    }

    #[test]
    fn consumed_token_records_used_by() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(&dir.path().join("tokens.json"));
        let token = store.create(chrono::Duration::hours(1), None).unwrap();
        store.validate_and_consume(&token.token, "agent-7").unwrap();

        let reloaded = store.get(&token.token).unwrap();
        assert_eq!(reloaded.used_by.as_deref(), Some("agent-7"));
    }
}
