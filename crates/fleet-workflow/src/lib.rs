//! WorkflowExecutor (§4.8): a DAG runner over [`fleet_config::types::Workflow`]
//! driven by whatever trigger fired it (file, schedule, webhook,
//! filewatcher, manual — the trigger loops themselves live with the
//! component that owns the event source; this crate only runs a
//! workflow once given its starting context).

#![forbid(unsafe_code)]

pub mod state;
pub mod steps;
mod template;

use fleet_config::types::Workflow;
use serde_json::Value;
use state::{RunStatus, StateStore, WorkflowRunState};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use steps::{StepError, StepHandler};
use tracing::{debug, warn};

/// Maps step `type` strings to handlers. Unregistered types fall back to
/// an explicit-failure handler rather than silently succeeding (§4.8).
pub struct StepRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The five always-available step types plus whatever the caller has
    /// registered via `register` (e.g. the optional `s3-upload` step, or
    /// an agent-specific extension).
    pub fn with_builtins(alert_sink: Arc<dyn steps::AlertSink>) -> Self {
        let mut registry = Self::new();
        registry.register("move-file", Arc::new(steps::MoveFileStep));
        registry.register("copy-file", Arc::new(steps::CopyFileStep));
        registry.register("delete-file", Arc::new(steps::DeleteFileStep));
        registry.register("run-command", Arc::new(steps::RunCommandStep));
        registry.register("alert", Arc::new(steps::AlertStep { sink: alert_sink }));
        registry
    }

    pub fn register(&mut self, type_name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(type_name.into(), handler);
    }

    fn lookup(&self, type_name: &str) -> Arc<dyn StepHandler> {
        self.handlers.get(type_name).cloned().unwrap_or_else(|| {
            Arc::new(steps::UnimplementedStep {
                type_name: type_name.to_string(),
            })
        })
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::with_builtins(Arc::new(steps::NoopAlertSink))
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub context: Value,
    pub status: RunStatus,
    pub last_error: Option<String>,
}

pub struct WorkflowExecutor {
    registry: StepRegistry,
    state_store: Arc<StateStore>,
}

impl WorkflowExecutor {
    pub fn new(registry: StepRegistry, state_store: Arc<StateStore>) -> Self {
        Self {
            registry,
            state_store,
        }
    }

    /// Run `workflow` to completion starting from its trigger's start
    /// steps (or all steps in declaration order, per
    /// [`Workflow::start_step_ids`]) with the given initial context.
    pub async fn run(&self, workflow: &Workflow, initial_context: Value) -> RunOutcome {
        let started_at = chrono::Utc::now();
        let mut context = initial_context;
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = workflow.start_step_ids().into_iter().collect();
        let mut failure: Option<String> = None;
        let mut completed_steps: Vec<String> = Vec::new();

        'run: while let Some(step_id) = queue.pop_front() {
            if visited.contains(&step_id) {
                continue;
            }
            visited.insert(step_id.clone());

            let Some(step) = workflow.step(&step_id) else {
                warn!(workflow = %workflow.id, step = %step_id, "step id not found in workflow, skipping");
                continue;
            };

            let resolved_config = resolve_step_config(&step.config, &context);
            let handler = self.registry.lookup(&step.step_type);
            let result = handler.execute(&resolved_config, &mut context).await;

            if result.is_ok() {
                completed_steps.push(step_id.clone());
            }

            self.persist(
                &workflow.id,
                WorkflowRunState {
                    status: RunStatus::Running,
                    context: context.clone(),
                    started_at,
                    updated_at: chrono::Utc::now(),
                    last_error: None,
                    completed_steps: completed_steps.clone(),
                    end_time: None,
                },
            );

            match result {
                Ok(()) => {
                    for next_id in &step.next {
                        queue.push_back(next_id.clone());
                    }
                }
                Err(e) => {
                    debug!(workflow = %workflow.id, step = %step_id, error = %e, "step failed");
                    if step.on_error.is_empty() {
                        failure = Some(format!("step '{step_id}': {e}"));
                        break 'run;
                    }
                    extend_context_with_error(&mut context, &step_id, &e);
                    for err_id in &step.on_error {
                        queue.push_back(err_id.clone());
                    }
                }
            }
        }

        let status = if failure.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        let end_time = chrono::Utc::now();
        self.persist(
            &workflow.id,
            WorkflowRunState {
                status,
                context: context.clone(),
                started_at,
                updated_at: end_time,
                last_error: failure.clone(),
                completed_steps: completed_steps.clone(),
                end_time: Some(end_time),
            },
        );

        RunOutcome {
            context,
            status,
            last_error: failure,
        }
    }

    fn persist(&self, workflow_id: &str, state: WorkflowRunState) {
        if let Err(e) = self.state_store.save(workflow_id, state) {
            warn!(workflow = %workflow_id, error = %e, "failed to persist workflow run state");
        }
    }
}

fn resolve_step_config(config: &HashMap<String, Value>, context: &Value) -> Value {
    let map: serde_json::Map<String, Value> = config
        .iter()
        .map(|(k, v)| (k.clone(), template::resolve(v, context)))
        .collect();
    Value::Object(map)
}

fn extend_context_with_error(context: &mut Value, step_id: &str, error: &StepError) {
    if let Value::Object(map) = context {
        map.insert("error".to_string(), Value::String(error.to_string()));
        map.insert("errorStep".to_string(), Value::String(step_id.to_string()));
        map.insert(
            "errorStepName".to_string(),
            Value::String(step_id.to_string()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_config::types::{Step, Trigger, TriggerType};
    use serde_json::json;
    use std::sync::Arc;

    fn wf(steps: Vec<Step>) -> Workflow {
        Workflow {
            id: "wf-1".into(),
            name: "test".into(),
            enabled: true,
            trigger: Trigger {
                trigger_type: TriggerType::Manual,
                start_steps: vec![],
            },
            steps,
        }
    }

    fn step(id: &str, step_type: &str, config: HashMap<String, Value>, next: Vec<&str>, on_error: Vec<&str>) -> Step {
        Step {
            id: id.into(),
            step_type: step_type.into(),
            config,
            next: next.into_iter().map(String::from).collect(),
            on_error: on_error.into_iter().map(String::from).collect(),
        }
    }

    #[tokio::test]
    async fn successful_chain_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(&dir.path().join("state.json")));
        let executor = WorkflowExecutor::new(StepRegistry::default(), store.clone());

        let mut cfg_a = HashMap::new();
        cfg_a.insert("message".to_string(), json!("step a ran"));
        let mut cfg_b = HashMap::new();
        cfg_b.insert("message".to_string(), json!("step b ran"));

        let workflow = wf(vec![
            step("a", "alert", cfg_a, vec!["b"], vec![]),
            step("b", "alert", cfg_b, vec![], vec![]),
        ]);

        let outcome = executor.run(&workflow, json!({})).await;
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert!(outcome.last_error.is_none());

        let persisted = store.get("wf-1").unwrap();
        assert_eq!(persisted.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn on_error_chain_replaces_main_continuation() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(&dir.path().join("state.json")));
        let executor = WorkflowExecutor::new(StepRegistry::default(), store);

        let mut cfg_fail = HashMap::new();
        cfg_fail.insert("path".to_string(), json!("/nonexistent/does-not-exist"));
        let mut cfg_recover = HashMap::new();
        cfg_recover.insert("message".to_string(), json!("recovered from {{errorStep}}"));

        let workflow = wf(vec![
            step("fail", "delete-file", cfg_fail, vec!["never-reached"], vec!["recover"]),
            step("recover", "alert", cfg_recover, vec![], vec![]),
            step(
                "never-reached",
                "alert",
                HashMap::new(),
                vec![],
                vec![],
            ),
        ]);

        let outcome = executor.run(&workflow, json!({})).await;
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.context["errorStep"], "fail");
    }

    #[tokio::test]
    async fn failure_without_on_error_propagates_and_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(&dir.path().join("state.json")));
        let executor = WorkflowExecutor::new(StepRegistry::default(), store);

        let mut cfg_fail = HashMap::new();
        cfg_fail.insert("path".to_string(), json!("/nonexistent/does-not-exist"));
        let workflow = wf(vec![step("fail", "delete-file", cfg_fail, vec![], vec![])]);

        let outcome = executor.run(&workflow, json!({})).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.last_error.unwrap().contains("fail"));
    }

    #[tokio::test]
    async fn unknown_step_type_fails_explicitly() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(&dir.path().join("state.json")));
        let executor = WorkflowExecutor::new(StepRegistry::default(), store);

        let workflow = wf(vec![step("x", "not-a-real-type", HashMap::new(), vec![], vec![])]);
        let outcome = executor.run(&workflow, json!({})).await;
        assert_eq!(outcome.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn cycle_is_broken_by_per_run_visited_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(&dir.path().join("state.json")));
        let executor = WorkflowExecutor::new(StepRegistry::default(), store);

        // a -> b -> a (cycle)
        let workflow = wf(vec![
            step("a", "alert", HashMap::from([("message".to_string(), json!("a"))]), vec!["b"], vec![]),
            step("b", "alert", HashMap::from([("message".to_string(), json!("b"))]), vec!["a"], vec![]),
        ]);

        let outcome = executor.run(&workflow, json!({})).await;
        assert_eq!(outcome.status, RunStatus::Succeeded);
    }
}
