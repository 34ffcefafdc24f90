//! Auto-dispatch loops for workflow trigger types that fire independent
//! of the file-watcher's own `WF:` post-program hook (§4.8): `schedule`
//! and `file`. `webhook` triggers are served from [`webhook_router`]
//! instead since they need an HTTP listener; `filewatcher` and `manual`
//! never auto-dispatch.

use axum::extract::{Path as AxPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use fleet_config::types::{TriggerType, Workflow};
use fleet_workflow::WorkflowExecutor;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use regex::Regex;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub fn spawn_trigger_loops(
    workflows: &[Workflow],
    executor: Arc<WorkflowExecutor>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();
    for workflow in workflows {
        if !workflow.enabled {
            continue;
        }
        match &workflow.trigger.trigger_type {
            TriggerType::Schedule { interval_secs, cron } => {
                if let Some(secs) = interval_secs {
                    tasks.push(spawn_schedule_loop(
                        workflow.clone(),
                        *secs,
                        executor.clone(),
                        shutdown.clone(),
                    ));
                } else if cron.is_some() {
                    warn!(
                        workflow = %workflow.id,
                        "cron scheduling is not implemented, set intervalSecs instead"
                    );
                }
            }
            TriggerType::File { path, pattern } => {
                match spawn_file_trigger(
                    workflow.clone(),
                    path.clone(),
                    pattern.clone(),
                    executor.clone(),
                    shutdown.clone(),
                ) {
                    Ok(task) => tasks.push(task),
                    Err(e) => warn!(
                        workflow = %workflow.id, path = %path, error = %e,
                        "failed to start file trigger watch"
                    ),
                }
            }
            TriggerType::Webhook { .. } | TriggerType::Filewatcher | TriggerType::Manual => {}
        }
    }
    tasks
}

fn spawn_schedule_loop(
    workflow: Workflow,
    interval_secs: u64,
    executor: Arc<WorkflowExecutor>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let context = json!({ "trigger": "schedule", "workflowId": workflow.id });
                    executor.run(&workflow, context).await;
                }
            }
        }
        debug!(workflow = %workflow.id, "schedule trigger loop exiting");
    })
}

fn spawn_file_trigger(
    workflow: Workflow,
    path: String,
    pattern: String,
    executor: Arc<WorkflowExecutor>,
    mut shutdown: watch::Receiver<bool>,
) -> notify::Result<JoinHandle<()>> {
    let (tx, mut rx) = mpsc::channel::<Event>(64);
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            let _ = tx.blocking_send(event);
        }
    })?;
    watcher.watch(Path::new(&path), RecursiveMode::NonRecursive)?;
    let regex = Regex::new(&pattern).ok();
    if regex.is_none() && !pattern.is_empty() {
        warn!(workflow = %workflow.id, %pattern, "invalid file trigger pattern, matching nothing");
    }
    info!(workflow = %workflow.id, %path, "file trigger watching directory");

    Ok(tokio::spawn(async move {
        let _watcher = watcher;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        continue;
                    }
                    for changed in event.paths {
                        let matched = regex
                            .as_ref()
                            .and_then(|re| changed.file_name().and_then(|s| s.to_str()).map(|n| re.is_match(n)))
                            .unwrap_or(pattern.is_empty());
                        if !matched {
                            continue;
                        }
                        let context = json!({
                            "trigger": "file",
                            "file": changed.display().to_string(),
                        });
                        executor.run(&workflow, context).await;
                    }
                }
            }
        }
        debug!(workflow = %workflow.id, "file trigger loop exiting");
    }))
}

#[derive(Clone)]
struct WebhookState {
    workflows: Arc<Vec<Workflow>>,
    executor: Arc<WorkflowExecutor>,
}

/// Routes `/api/webhooks/:workflowId` for every enabled webhook-triggered
/// workflow. Merged into the HealthAPI's router so both surfaces share
/// one listener (§6).
pub fn webhook_router(workflows: Vec<Workflow>, executor: Arc<WorkflowExecutor>) -> axum::Router {
    let state = WebhookState {
        workflows: Arc::new(workflows),
        executor,
    };
    axum::Router::new()
        .route("/api/webhooks/:workflow_id", get(handle_webhook).post(handle_webhook))
        .route("/api/webhooks/:workflow_id/", post(handle_webhook))
        .with_state(state)
}

async fn handle_webhook(
    State(state): State<WebhookState>,
    AxPath(workflow_id): AxPath<String>,
    body: Option<axum::extract::Json<Value>>,
) -> impl IntoResponse {
    let Some(workflow) = state
        .workflows
        .iter()
        .find(|w| w.id == workflow_id && w.enabled)
    else {
        return (StatusCode::NOT_FOUND, Json(json!({ "ok": false, "error": "unknown workflow" }))).into_response();
    };

    if !matches!(workflow.trigger.trigger_type, TriggerType::Webhook { .. }) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "ok": false, "error": "workflow is not webhook-triggered" })),
        )
            .into_response();
    }

    let payload = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let context = json!({ "trigger": "webhook", "payload": payload });
    let executor = state.executor.clone();
    let workflow = workflow.clone();
    tokio::spawn(async move {
        executor.run(&workflow, context).await;
    });

    Json(json!({ "ok": true })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_config::types::{Step, Trigger};
    use fleet_workflow::{state::StateStore, StepRegistry};
    use std::collections::HashMap;

    fn manual_workflow(id: &str) -> Workflow {
        Workflow {
            id: id.into(),
            name: id.into(),
            enabled: true,
            trigger: Trigger {
                trigger_type: TriggerType::Manual,
                start_steps: vec![],
            },
            steps: vec![Step {
                id: "a".into(),
                step_type: "alert".into(),
                config: HashMap::from([("message".to_string(), json!("hi"))]),
                next: vec![],
                on_error: vec![],
            }],
        }
    }

    #[test]
    fn manual_and_filewatcher_triggers_spawn_no_loops() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(&dir.path().join("state.json")));
        let executor = Arc::new(WorkflowExecutor::new(StepRegistry::default(), store));
        let (_tx, rx) = watch::channel(false);

        let workflows = vec![manual_workflow("wf-manual")];
        let tasks = spawn_trigger_loops(&workflows, executor, rx);
        assert!(tasks.is_empty());
    }
}
