//! HealthAPI (agent, §4.10): read-only HTTP surface for logs, workflow
//! execution state, metrics, log-level control, and (when enabled) the
//! file-browser. Every route here is a window onto state owned by other
//! components (`StateStore`, the log ring buffer, `ManagedConfig`) — this
//! crate holds no authoritative state of its own besides the log buffer.

#![forbid(unsafe_code)]

pub mod filebrowser;
pub mod logstore;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get, post};
use axum::Router;
use fleet_config::types::FileBrowserSettings;
use fleet_workflow::state::StateStore;
use logstore::LogRingBuffer;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Implemented by whatever owns the live `tracing_subscriber::EnvFilter`
/// (the agent binary, via `tracing_subscriber::reload::Handle`) so this
/// crate can expose log-level control without depending on the exact
/// subscriber wiring.
pub trait LogLevelControl: Send + Sync {
    fn get(&self) -> String;
    fn set(&self, level: &str) -> Result<(), String>;
}

pub struct NoopLogLevelControl;

impl LogLevelControl for NoopLogLevelControl {
    fn get(&self) -> String {
        "info".to_string()
    }
    fn set(&self, _level: &str) -> Result<(), String> {
        Err("log level control not wired up".to_string())
    }
}

#[derive(Clone)]
pub struct Identity {
    pub agent_id: String,
    pub hostname: String,
    pub platform: String,
    pub public_key: String,
    pub ssh_port: u16,
}

pub struct AppState {
    pub identity: Identity,
    pub state_store: Arc<StateStore>,
    pub logs: LogRingBuffer,
    pub log_level: Arc<dyn LogLevelControl>,
    pub log_file_path: PathBuf,
    pub state_file_path: PathBuf,
    pub workflow_count: Arc<parking_lot::RwLock<usize>>,
    pub file_browser: Arc<parking_lot::RwLock<FileBrowserSettings>>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/info", get(info))
        .route("/api/logs", get(get_logs))
        .route("/api/logs/download", get(download_logs))
        .route("/api/workflows/executions", get(workflow_executions))
        .route("/api/workflows/state", get(workflow_state))
        .route("/api/metrics", get(metrics))
        .route("/api/loglevel", get(get_loglevel).post(post_loglevel))
        .route("/api/files/browse", get(filebrowser::browse))
        .route("/api/files/download", get(filebrowser::download))
        .route("/api/files/upload", post(filebrowser::upload))
        .route("/api/files/mkdir", post(filebrowser::mkdir))
        .route("/api/files/delete", delete(filebrowser::remove))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "agentId": state.identity.agent_id,
        "time": chrono::Utc::now(),
    }))
}

async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "agentId": state.identity.agent_id,
        "publicKey": state.identity.public_key,
        "workflows": *state.workflow_count.read(),
        "sshPort": state.identity.ssh_port,
    }))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_page_size")]
    page_size: usize,
    level: Option<String>,
    search: Option<String>,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    50
}

async fn get_logs(State(state): State<Arc<AppState>>, Query(q): Query<LogsQuery>) -> impl IntoResponse {
    let (items, total) = state.logs.query(q.page, q.page_size, q.level.as_deref(), q.search.as_deref());
    Json(json!({
        "items": items,
        "total": total,
        "page": q.page,
        "pageSize": q.page_size,
    }))
}

async fn download_logs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match std::fs::read(&state.log_file_path) {
        Ok(bytes) => (StatusCode::OK, bytes).into_response(),
        Err(e) => {
            warn!(error = %e, path = %state.log_file_path.display(), "failed to read agent log file");
            (StatusCode::NOT_FOUND, "log file unavailable").into_response()
        }
    }
}

async fn workflow_executions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let all = state.state_store.all();
    let executions: Vec<_> = all
        .into_iter()
        .map(|(workflow_id, run)| json!({ "workflowId": workflow_id, "run": run }))
        .collect();
    Json(json!({ "executions": executions }))
}

async fn workflow_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.state_store.all())
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let log_size = std::fs::metadata(&state.log_file_path).map(|m| m.len()).unwrap_or(0);
    let state_size = std::fs::metadata(&state.state_file_path).map(|m| m.len()).unwrap_or(0);
    Json(json!({
        "agentId": state.identity.agent_id,
        "hostname": state.identity.hostname,
        "platform": state.identity.platform,
        "workflowCount": *state.workflow_count.read(),
        "logFileSizeBytes": log_size,
        "stateFileSizeBytes": state_size,
    }))
}

async fn get_loglevel(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "level": state.log_level.get() }))
}

#[derive(Debug, Deserialize)]
struct SetLogLevel {
    level: String,
}

async fn post_loglevel(State(state): State<Arc<AppState>>, Json(body): Json<SetLogLevel>) -> impl IntoResponse {
    match state.log_level.set(&body.level) {
        Ok(()) => Json(json!({ "ok": true, "level": body.level })).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({ "ok": false, "error": e }))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct PathQuery {
    pub(crate) path: Option<String>,
}

pub(crate) fn browser_roots(state: &AppState) -> Vec<PathBuf> {
    state
        .file_browser
        .read()
        .allowed_paths
        .iter()
        .map(PathBuf::from)
        .collect()
}

pub(crate) fn browser_enabled(state: &AppState) -> bool {
    state.file_browser.read().enabled
}

pub(crate) fn max_upload_bytes(state: &AppState) -> u64 {
    state.file_browser.read().max_upload_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_page_values_are_sane() {
        assert_eq!(default_page(), 1);
        assert_eq!(default_page_size(), 50);
    }
}
