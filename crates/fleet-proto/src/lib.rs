//! Wire types shared by the agent and the manager.
//!
//! Defines the WebSocket envelope, its payload kinds, and the command
//! vocabulary the manager can dispatch to a connected agent. Both
//! `fleet-transport` (agent side) and `fleet-wshub` (manager side) depend
//! on this crate so the two ends never drift apart on frame shape.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every message on the wire is one envelope: `{ type, agentId, payload }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(rename = "agentId")]
    pub agent_id: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: MessageKind, agent_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            agent_id: agent_id.into(),
            payload,
        }
    }
}

/// Envelope kinds. Kept as an open string-backed enum rather than a closed
/// Rust enum with `#[serde(other)]`, since the manager must be able to log
/// and ignore kinds it does not yet understand rather than fail to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Registration,
    Reconnection,
    Heartbeat,
    HeartbeatAck,
    Status,
    Alert,
    Log,
    Command,
    Config,
    Error,
}

/// `registration` payload, agent -> manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationPayload {
    pub public_key: String,
    pub token: String,
    pub hostname: String,
    pub platform: String,
}

/// `reconnection` payload, agent -> manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectionPayload {
    pub public_key: String,
    pub hostname: String,
    pub platform: String,
}

/// Reply to both `registration` and `reconnection`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RegisterReply {
    pub fn ok(agent_id: impl Into<String>) -> Self {
        Self {
            success: true,
            agent_id: Some(agent_id.into()),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            agent_id: None,
            error: Some(message.into()),
        }
    }
}

/// `heartbeat` payload, agent -> manager. Empty on the wire but kept as a
/// named type so callers don't reach for `serde_json::json!({})` ad hoc.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatPayload {}

/// `status` payload, agent -> manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

/// `alert` payload, agent -> manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertPayload {
    pub level: AlertLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warn,
    Error,
}

/// `log` payload, agent -> manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPayload {
    pub level: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// `command` payload, manager -> agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: CommandKind,
    #[serde(default)]
    pub args: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    ReloadConfig,
    GitPull,
    RemoveWorkflow,
    ReloadFilewatcher,
    SetLogLevel,
}

/// `config` payload, manager -> agent (post-push notification, or a direct
/// push of the agent's managed-from-git config fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPayload {
    pub config: Value,
}

/// `error` payload, either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_round_trips_registration() {
        let payload = RegistrationPayload {
            public_key: "ssh-rsa AAAA".to_string(),
            token: "tok-123".to_string(),
            hostname: "host-a".to_string(),
            platform: "linux amd64".to_string(),
        };
        let env = Envelope::new(
            MessageKind::Registration,
            "unassigned",
            serde_json::to_value(&payload).unwrap(),
        );
        let s = serde_json::to_string(&env).unwrap();
        assert!(s.contains(r#""type":"registration""#));
        let back: Envelope = serde_json::from_str(&s).unwrap();
        assert_eq!(back.kind, MessageKind::Registration);
    }

    #[test]
    fn register_reply_omits_error_on_success() {
        let reply = RegisterReply::ok("agent-1");
        let s = serde_json::to_string(&reply).unwrap();
        assert!(!s.contains("error"));
        assert!(s.contains("agent-1"));
    }

    #[test]
    fn register_reply_omits_agent_id_on_failure() {
        let reply = RegisterReply::err("Public key mismatch");
        let s = serde_json::to_string(&reply).unwrap();
        assert!(!s.contains("agentId"));
        assert!(s.contains("Public key mismatch"));
    }

    #[test]
    fn command_payload_uses_kebab_case_kind() {
        let cmd = CommandPayload {
            command: CommandKind::ReloadFilewatcher,
            args: json!({}),
            level: None,
        };
        let s = serde_json::to_string(&cmd).unwrap();
        assert!(s.contains("reload-filewatcher"));
    }

    #[test]
    fn message_kind_round_trips_snake_case() {
        let s = serde_json::to_string(&MessageKind::HeartbeatAck).unwrap();
        assert_eq!(s, r#""heartbeat_ack""#);
        let back: MessageKind = serde_json::from_str(&s).unwrap();
        assert_eq!(back, MessageKind::HeartbeatAck);
    }
}
