//! WSHub (manager, §4.4): the axum WebSocket endpoint agents connect to.
//!
//! Tracks `agentId -> session` so outbound commands can be routed to a
//! specific connected agent, dispatches every inbound envelope kind to
//! `TokenStore`/`AgentRegistry`/`GitRepo`, and runs the liveness sweep
//! that demotes agents whose heartbeat has gone stale. Mirrors the
//! session-handle-map pattern used for WebSocket gateways elsewhere in
//! this codebase family: one task per connection, a shared registry of
//! per-session senders, and a single `ws_handler` doing the upgrade.

#![forbid(unsafe_code)]

pub mod store;
pub mod webhook;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use fleet_gitrepo::GitRepo;
use fleet_proto::{
    AlertLevel, AlertPayload, CommandPayload, ConfigPayload, Envelope, ErrorPayload,
    HeartbeatPayload, LogPayload, MessageKind, ReconnectionPayload, RegisterReply,
    RegistrationPayload, StatusPayload,
};
use fleet_registry::{AgentRegistry, RegistryError};
use fleet_tokens::{TokenError, TokenStore};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use store::{AlertStore, LogStore};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};
use webhook::AlertSink;

#[derive(Debug, Error)]
pub enum WsHubError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A connected agent's outbound channel. The hub never writes to a
/// socket directly — every send goes through this channel so the
/// per-connection task remains the single writer to its socket.
type SessionMap = Arc<Mutex<HashMap<String, mpsc::Sender<Message>>>>;

pub struct WsHub {
    tokens: Arc<TokenStore>,
    registry: Arc<AgentRegistry>,
    repo: Arc<GitRepo>,
    alert_store: Arc<AlertStore>,
    log_store: Arc<LogStore>,
    alert_sink: Arc<dyn AlertSink>,
    sessions: SessionMap,
}

impl WsHub {
    pub fn new(
        tokens: Arc<TokenStore>,
        registry: Arc<AgentRegistry>,
        repo: Arc<GitRepo>,
        alert_store: Arc<AlertStore>,
        log_store: Arc<LogStore>,
        alert_sink: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            tokens,
            registry,
            repo,
            alert_store,
            log_store,
            alert_sink,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(self)
    }

    /// Send a command envelope to a specific connected agent, if it
    /// currently has an open session. Returns `false` if the agent is
    /// not connected.
    pub fn send_command(&self, agent_id: &str, command: CommandPayload) -> bool {
        let Ok(payload) = serde_json::to_value(command) else {
            return false;
        };
        let env = Envelope::new(MessageKind::Command, agent_id, payload);
        self.send_envelope(agent_id, env)
    }

    pub fn send_config(&self, agent_id: &str, config: serde_json::Value) -> bool {
        let payload = ConfigPayload { config };
        let Ok(value) = serde_json::to_value(payload) else {
            return false;
        };
        let env = Envelope::new(MessageKind::Config, agent_id, value);
        self.send_envelope(agent_id, env)
    }

    fn send_envelope(&self, agent_id: &str, env: Envelope) -> bool {
        let Ok(text) = serde_json::to_string(&env) else {
            return false;
        };
        let tx = self.sessions.lock().get(agent_id).cloned();
        match tx {
            Some(tx) => tx.try_send(Message::Text(text)).is_ok(),
            None => false,
        }
    }

    fn register_session(&self, agent_id: &str, tx: mpsc::Sender<Message>) {
        self.sessions.lock().insert(agent_id.to_string(), tx);
    }

    fn remove_session(&self, agent_id: &str) {
        self.sessions.lock().remove(agent_id);
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<WsHub>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

/// Drives one agent connection end to end: the handshake (registration
/// or reconnection) gates entry into the steady-state loop, after which
/// every inbound frame is dispatched by kind and outbound frames are
/// drained from a per-session channel. Mirrors `WsClient::connect_once`
/// on the agent side so neither end can desync on frame shape.
async fn handle_socket(mut socket: WebSocket, hub: Arc<WsHub>) {
    let agent_id = match handshake(&mut socket, &hub).await {
        Some(id) => id,
        None => {
            let _ = socket.close().await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel::<Message>(64);
    hub.register_session(&agent_id, tx);
    info!(agent_id = %agent_id, "agent session established");

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                match outgoing {
                    Some(msg) => {
                        use futures_util::SinkExt;
                        if socket.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = futures_next(&mut socket) => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&hub, &agent_id, &text, &mut socket).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(agent_id = %agent_id, error = %e, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    hub.remove_session(&agent_id);
    if let Err(e) = hub.registry.mark_offline(&agent_id) {
        warn!(agent_id = %agent_id, error = %e, "failed to mark agent offline on disconnect");
    }
    info!(agent_id = %agent_id, "agent session closed");
}

async fn futures_next(socket: &mut WebSocket) -> Option<Result<Message, axum::Error>> {
    use futures_util::StreamExt;
    socket.next().await
}

/// Consumes the first frame as either a `registration` or `reconnection`
/// envelope and replies with a `RegisterReply`. Returns the resolved
/// `agentId` on success, `None` if the handshake failed or the socket
/// closed before one arrived — the caller closes the connection either
/// way.
async fn handshake(socket: &mut WebSocket, hub: &Arc<WsHub>) -> Option<String> {
    use futures_util::{SinkExt, StreamExt};

    let frame = socket.next().await?.ok()?;
    let Message::Text(text) = frame else {
        return None;
    };
    let env: Envelope = serde_json::from_str(&text).ok()?;

    let (agent_id, reply) = match env.kind {
        MessageKind::Registration => {
            let payload: RegistrationPayload = serde_json::from_value(env.payload).ok()?;
            handle_registration(hub, &env.agent_id, payload)
        }
        MessageKind::Reconnection => {
            let payload: ReconnectionPayload = serde_json::from_value(env.payload).ok()?;
            handle_reconnection(hub, &env.agent_id, payload)
        }
        other => {
            warn!(kind = ?other, "first frame was not a registration or reconnection");
            return None;
        }
    };

    let reply_env = Envelope::new(env.kind, &agent_id, serde_json::to_value(&reply).ok()?);
    let text = serde_json::to_string(&reply_env).ok()?;
    if socket.send(Message::Text(text)).await.is_err() {
        return None;
    }

    if reply.success {
        Some(agent_id)
    } else {
        None
    }
}

fn handle_registration(
    hub: &Arc<WsHub>,
    agent_id: &str,
    payload: RegistrationPayload,
) -> (String, RegisterReply) {
    if let Err(e) = hub.tokens.validate_and_consume(&payload.token, agent_id) {
        let reason = match e {
            TokenError::NotFound => "unknown registration token",
            TokenError::AlreadyUsed => "registration token already used",
            TokenError::Expired => "registration token expired",
            TokenError::Io(_) => "token store error",
        };
        warn!(agent_id, reason, "registration rejected");
        return (agent_id.to_string(), RegisterReply::err(reason));
    }

    match hub
        .registry
        .register(agent_id, &payload.hostname, &payload.platform, &payload.public_key)
    {
        Ok(_) => {
            // Preserve any config the agent already pushed to Git before
            // it first registered; otherwise leave a blank slate for the
            // operator to populate via `agents/<id>.json`.
            match hub.repo.read_agent_config(agent_id) {
                Ok(Some(config)) => {
                    if let Err(e) = hub.registry.update_config(agent_id, config) {
                        warn!(agent_id, error = %e, "failed to apply preexisting git config on registration");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(agent_id, error = %e, "failed to read agent git config on registration"),
            }
            info!(agent_id, "agent registered");
            (agent_id.to_string(), RegisterReply::ok(agent_id))
        }
        Err(RegistryError::DuplicatePublicKey) => {
            warn!(agent_id, "registration rejected: public key already claimed");
            (agent_id.to_string(), RegisterReply::err("public key already registered to another agent"))
        }
        Err(e) => {
            warn!(agent_id, error = %e, "registration failed");
            (agent_id.to_string(), RegisterReply::err("registration failed"))
        }
    }
}

fn handle_reconnection(
    hub: &Arc<WsHub>,
    agent_id: &str,
    payload: ReconnectionPayload,
) -> (String, RegisterReply) {
    match hub.registry.reconnect(agent_id, &payload.public_key, &payload.hostname, &payload.platform, None) {
        Ok(_) => {
            info!(agent_id, "agent reconnected");
            (agent_id.to_string(), RegisterReply::ok(agent_id))
        }
        Err(RegistryError::NotFound(_)) => {
            warn!(agent_id, "reconnection rejected: agent not found");
            (agent_id.to_string(), RegisterReply::err("agent not found"))
        }
        Err(RegistryError::DuplicatePublicKey) => {
            warn!(agent_id, "reconnection rejected: public key mismatch");
            (agent_id.to_string(), RegisterReply::err("Public key mismatch"))
        }
        Err(e) => {
            warn!(agent_id, error = %e, "reconnection failed");
            (agent_id.to_string(), RegisterReply::err("reconnection failed"))
        }
    }
}

async fn handle_frame(hub: &Arc<WsHub>, agent_id: &str, text: &str, socket: &mut WebSocket) {
    let env: Envelope = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(e) => {
            warn!(agent_id, error = %e, "malformed inbound frame");
            return;
        }
    };

    match env.kind {
        MessageKind::Heartbeat => {
            let _: Result<HeartbeatPayload, _> = serde_json::from_value(env.payload);
            if let Err(e) = hub.registry.heartbeat(agent_id) {
                warn!(agent_id, error = %e, "failed to record heartbeat");
            }
            let ack = Envelope::new(MessageKind::HeartbeatAck, agent_id, serde_json::Value::Null);
            if let Ok(text) = serde_json::to_string(&ack) {
                use futures_util::SinkExt;
                let _ = socket.send(Message::Text(text)).await;
            }
        }
        MessageKind::Status => {
            if let Ok(payload) = serde_json::from_value::<StatusPayload>(env.payload) {
                hub.log_store.append(agent_id, "info", &payload.status, payload.detail);
            }
        }
        MessageKind::Alert => {
            if let Ok(payload) = serde_json::from_value::<AlertPayload>(env.payload) {
                let level = alert_level_str(payload.level);
                hub.alert_store.append(agent_id, level, &payload.message, payload.details.clone());
                hub.alert_sink.notify(agent_id, level, &payload.message).await;
            }
        }
        MessageKind::Log => {
            if let Ok(payload) = serde_json::from_value::<LogPayload>(env.payload) {
                hub.log_store.append(agent_id, &payload.level, &payload.message, payload.details);
            }
        }
        MessageKind::Error => {
            if let Ok(payload) = serde_json::from_value::<ErrorPayload>(env.payload) {
                warn!(agent_id, message = %payload.message, "agent reported error");
            }
        }
        other => {
            warn!(agent_id, kind = ?other, "ignoring unexpected inbound message kind");
        }
    }
}

fn alert_level_str(level: AlertLevel) -> &'static str {
    match level {
        AlertLevel::Info => "info",
        AlertLevel::Warn => "warn",
        AlertLevel::Error => "error",
    }
}

/// Runs `registry.sweep_stale` every `interval` until `shutdown` fires.
/// A thin wrapper so the manager binary doesn't need to depend on
/// `fleet-registry` directly just to start the sweep.
pub async fn run_liveness_sweep(
    registry: Arc<AgentRegistry>,
    interval: std::time::Duration,
    stale_threshold: std::time::Duration,
    shutdown: tokio::sync::watch::Receiver<bool>,
) {
    fleet_registry::run_liveness_sweep(registry, interval, stale_threshold, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_command_to_unconnected_agent_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = Arc::new(TokenStore::new(&dir.path().join("tokens.json")));
        let registry = Arc::new(AgentRegistry::new(&dir.path().join("agents.json")));
        let repo = Arc::new(GitRepo::open_or_init(&dir.path().join("repo")).unwrap());
        let alert_store = Arc::new(AlertStore::new(&dir.path().join("alerts.json")));
        let log_store = Arc::new(LogStore::new(&dir.path().join("logs.json")));
        let hub = WsHub::new(tokens, registry, repo, alert_store, log_store, Arc::new(webhook::NoopAlertSink));

        assert!(!hub.send_command("unknown-agent", CommandPayload {
            command: fleet_proto::CommandKind::GitPull,
            args: serde_json::json!({}),
            level: None,
        }));
    }

    #[test]
    fn registration_rejects_unknown_token() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = Arc::new(TokenStore::new(&dir.path().join("tokens.json")));
        let registry = Arc::new(AgentRegistry::new(&dir.path().join("agents.json")));
        let repo = Arc::new(GitRepo::open_or_init(&dir.path().join("repo")).unwrap());
        let alert_store = Arc::new(AlertStore::new(&dir.path().join("alerts.json")));
        let log_store = Arc::new(LogStore::new(&dir.path().join("logs.json")));
        let hub = Arc::new(WsHub::new(tokens, registry, repo, alert_store, log_store, Arc::new(webhook::NoopAlertSink)));

        let (_, reply) = handle_registration(
            &hub,
            "agent-1",
            RegistrationPayload {
                public_key: "ssh-rsa AAAA".to_string(),
                token: "does-not-exist".to_string(),
                hostname: "host-a".to_string(),
                platform: "linux".to_string(),
            },
        );
        assert!(!reply.success);
    }

    #[test]
    fn registration_with_valid_token_succeeds_and_applies_preexisting_config() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = Arc::new(TokenStore::new(&dir.path().join("tokens.json")));
        let registry = Arc::new(AgentRegistry::new(&dir.path().join("agents.json")));
        let repo = Arc::new(GitRepo::open_or_init(&dir.path().join("repo")).unwrap());
        std::fs::create_dir_all(dir.path().join("repo/agents")).unwrap();
        std::fs::write(
            dir.path().join("repo/agents/agent-1.json"),
            serde_json::json!({"sshServerPort": 2200}).to_string(),
        )
        .unwrap();
        let alert_store = Arc::new(AlertStore::new(&dir.path().join("alerts.json")));
        let log_store = Arc::new(LogStore::new(&dir.path().join("logs.json")));
        let hub = Arc::new(WsHub::new(tokens.clone(), registry.clone(), repo, alert_store, log_store, Arc::new(webhook::NoopAlertSink)));

        let token = tokens.create(chrono::Duration::hours(1), None).unwrap();
        let (agent_id, reply) = handle_registration(
            &hub,
            "agent-1",
            RegistrationPayload {
                public_key: "ssh-rsa AAAA".to_string(),
                token: token.token,
                hostname: "host-a".to_string(),
                platform: "linux".to_string(),
            },
        );
        assert!(reply.success);
        let record = registry.get(&agent_id).unwrap();
        assert_eq!(record.config["sshServerPort"], 2200);
    }

    #[test]
    fn reconnection_with_unknown_agent_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = Arc::new(TokenStore::new(&dir.path().join("tokens.json")));
        let registry = Arc::new(AgentRegistry::new(&dir.path().join("agents.json")));
        let repo = Arc::new(GitRepo::open_or_init(&dir.path().join("repo")).unwrap());
        let alert_store = Arc::new(AlertStore::new(&dir.path().join("alerts.json")));
        let log_store = Arc::new(LogStore::new(&dir.path().join("logs.json")));
        let hub = Arc::new(WsHub::new(tokens, registry, repo, alert_store, log_store, Arc::new(webhook::NoopAlertSink)));

        let (_, reply) = handle_reconnection(
            &hub,
            "ghost",
            ReconnectionPayload {
                public_key: "ssh-rsa AAAA".to_string(),
                hostname: "host-a".to_string(),
                platform: "linux".to_string(),
            },
        );
        assert!(!reply.success);
    }

    #[test]
    fn alert_level_str_matches_wire_values() {
        assert_eq!(alert_level_str(AlertLevel::Info), "info");
        assert_eq!(alert_level_str(AlertLevel::Warn), "warn");
        assert_eq!(alert_level_str(AlertLevel::Error), "error");
    }
}
