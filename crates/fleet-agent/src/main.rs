//! fleet-agent — runs on each managed host: watches files, executes
//! workflows, syncs configuration from the manager's Git repository, and
//! answers to the manager over a resilient WebSocket connection.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleet_agent::dispatcher::{AgentDispatcher, ReloadLogLevelControl, TransportAlertSink};
use fleet_agent::paths::AgentPaths;
use fleet_agent::triggers;
use fleet_config::{LocalConfig, ManagedConfig};
use fleet_filewatcher::FileWatcher;
use fleet_gitsync::GitSync;
use fleet_healthapi::{AppState, Identity as HealthIdentity};
use fleet_identity::AgentIdentity;
use fleet_proto::CommandKind;
use fleet_sshd::SshdSettings;
use fleet_transport::{ClientEvent, SharedRegistrationState, WsClient, WsClientParams};
use fleet_workflow::state::StateStore;
use fleet_workflow::{StepRegistry, WorkflowExecutor};
use parking_lot::{Mutex as PlMutex, RwLock};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter};

#[derive(Parser)]
#[command(name = "fleet-agent", about = "Fleet automation agent", version)]
struct Cli {
    /// Directory holding agent-config.json, state.json, keys, and the
    /// Git working copy (§6 persistent state layout).
    #[arg(long, env = "FLEET_AGENT_CONFIG_DIR", default_value = "/etc/fleet-agent")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent: connect to the manager, watch files, execute workflows.
    Run {
        #[arg(long, env = "FLEET_AGENT_MANAGER_URL", default_value = "ws://127.0.0.1:7900/ws")]
        manager_url: String,
        #[arg(long, env = "FLEET_AGENT_HEALTH_ADDR", default_value = "0.0.0.0:8088")]
        health_addr: SocketAddr,
        #[arg(long, env = "FLEET_AGENT_GIT_REMOTE")]
        git_remote: Option<String>,
    },
    /// Stage, commit, and push the local config working copy (§4.11).
    PushConfig,
    /// Print ahead/behind/dirty status; exit 1 if diverged.
    CheckChanges,
    /// Enumerate stash and `backup/<id>/*` branches for this agent.
    ListBackups,
    /// Restore a named backup, or `latest`.
    RecoverBackup { reference: String },
    /// Backup -> pull -> re-apply local changes.
    MergeConfig,
}

static LOG_HANDLE: std::sync::OnceLock<ReloadLogLevelControl> = std::sync::OnceLock::new();
static LOG_RING: std::sync::OnceLock<fleet_healthapi::logstore::LogRingBuffer> =
    std::sync::OnceLock::new();

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { manager_url, health_addr, git_remote } => {
            let _file_guard = init_tracing(&AgentPaths::new(cli.config_dir.clone()));
            match run_agent(cli.config_dir, manager_url, health_addr, git_remote).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    error!(error = %e, "fatal init failure");
                    std::process::exit(1);
                }
            }
        }
        other => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(EnvFilter::from_default_env().add_directive("fleet_agent=info".parse()?))
                .init();
            run_cli_command(&cli.config_dir, other)
        }
    }
}

/// Installs the structured logging stack described in SPEC_FULL.md §0: a
/// stdout `fmt` layer, a rolling file appender under
/// `<config_dir>/agent.log`, and the ring-buffer layer `/api/logs` reads
/// from. The filter is reloadable so `/api/loglevel` and the
/// `set-log-level` command can change verbosity without a restart.
fn init_tracing(paths: &AgentPaths) -> tracing_appender::non_blocking::WorkerGuard {
    let rotation = tracing_appender::rolling::RollingFileAppender::new(
        tracing_appender::rolling::Rotation::DAILY,
        paths.root(),
        "agent.log",
    );
    let (file_writer, guard) = tracing_appender::non_blocking(rotation);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, reload_handle) = reload::Layer::new(filter);

    let ring = fleet_healthapi::logstore::LogRingBuffer::new();
    let _ = LOG_RING.set(ring.clone());
    let _ = LOG_HANDLE.set(ReloadLogLevelControl::new(reload_handle, "info".to_string()));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer())
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .with(fleet_healthapi::logstore::RingBufferLayer::new(ring))
        .init();

    spawn_log_compactor(paths.clone());
    guard
}

/// Background gzip compaction of rotated log files (§6: "agent.log
/// (rotating: size/age/count, gzip of rotated files)"). `tracing-appender`
/// rotates by date but never compresses; this sweeps the config dir once
/// an hour and gzips anything matching `agent.log.YYYY-MM-DD` that isn't
/// already compressed.
fn spawn_log_compactor(paths: AgentPaths) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            if let Err(e) = compact_rotated_logs(paths.root()) {
                warn!(error = %e, "log compaction sweep failed");
            }
        }
    });
}

fn compact_rotated_logs(dir: &std::path::Path) -> std::io::Result<()> {
    use std::io::Write;

    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Ok(()),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if !name.starts_with("agent.log.") || name.ends_with(".gz") {
            continue;
        }
        let contents = std::fs::read(&path)?;
        let gz_path = path.with_extension(format!(
            "{}.gz",
            path.extension().and_then(|e| e.to_str()).unwrap_or_default()
        ));
        let file = std::fs::File::create(&gz_path)?;
        let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        encoder.write_all(&contents)?;
        encoder.finish()?;
        std::fs::remove_file(&path)?;
    }
    Ok(())
}

fn derive_git_remote(manager_url: &str) -> String {
    let host = url::Url::parse(manager_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "127.0.0.1".to_string());
    format!("ssh://git@{host}:8022/config-repo")
}

fn local_hostname() -> String {
    hostname::get().map(|h| h.to_string_lossy().to_string()).unwrap_or_default()
}

async fn run_agent(
    config_dir: PathBuf,
    manager_url: String,
    health_addr: SocketAddr,
    git_remote_override: Option<String>,
) -> Result<()> {
    let paths = AgentPaths::new(config_dir);

    let identity = AgentIdentity::load_or_create(&paths.private_key(), &paths.agent_id_file())
        .context("failed to load or create agent identity")?;
    info!(agent_id = %identity.agent_id, fingerprint = %identity.fingerprint(), "agent identity loaded");

    let mut local_config = LocalConfig::load_or_init(&paths.agent_config(), &identity.agent_id, &manager_url)
        .context("failed to load local agent config")?;

    let public_key = identity
        .public_key_authorized_keys()
        .context("failed to export public key")?;
    let hostname = local_hostname();
    let platform = std::env::consts::OS.to_string();

    let git_remote = git_remote_override.unwrap_or_else(|| derive_git_remote(&manager_url));
    let gitsync = Arc::new(GitSync::new(
        paths.config_repo(),
        git_remote,
        identity.agent_id.clone(),
        paths.private_key(),
    ));
    if let Err(e) = gitsync.initialize() {
        warn!(error = %e, "git config sync not initialized yet (agent may not be registered)");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state_store = Arc::new(StateStore::new(&paths.state_file()));

    let ws_client = WsClient::new(
        WsClientParams::new(manager_url.clone(), identity.agent_id.clone()),
        paths.alerts_file(),
    );
    let (outbound_sink, outbound_rx) = ws_client.new_outbound_sink();
    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel::<ClientEvent>(64);

    let registration_state: SharedRegistrationState = Arc::new(PlMutex::new(fleet_transport::RegistrationState {
        registered: local_config.get().registered,
        token: local_config.get().registration_token.clone(),
        public_key: public_key.clone(),
        hostname: hostname.clone(),
        platform: platform.clone(),
    }));

    let alert_sink = Arc::new(TransportAlertSink { sink: outbound_sink.clone() });
    let step_registry = StepRegistry::with_builtins(alert_sink.clone());
    let executor = Arc::new(WorkflowExecutor::new(step_registry, state_store.clone()));

    let managed = local_config.get().managed.clone();
    let workflows = Arc::new(RwLock::new(managed.workflows.clone()));
    let dispatcher: Arc<AgentDispatcher> = Arc::new(AgentDispatcher {
        executor: executor.clone(),
        workflows: workflows.clone(),
    });

    let dispatcher_dyn: Arc<dyn fleet_filewatcher::pipeline::WorkflowDispatcher> = dispatcher.clone();
    let file_watcher = FileWatcher::new(
        PathBuf::from(&managed.file_watcher_settings.scan_dir),
        managed.file_watcher_settings.scan_sub_dir,
        managed.file_watcher_rules.clone(),
        Some(dispatcher_dyn),
    )
    .start();

    let mut trigger_tasks = triggers::spawn_trigger_loops(&managed.workflows, executor.clone(), shutdown_rx.clone());

    let sshd_settings = SshdSettings::new(
        format!("0.0.0.0:{}", managed.ssh_server_port.max(1)).parse()?,
        &managed.authorized_ssh_keys,
        managed.file_browser_settings.allowed_paths.clone(),
    );
    let sshd_handle = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = fleet_sshd::run(sshd_settings, shutdown).await {
                error!(error = %e, "inbound ssh server exited with error");
            }
        })
    };

    let health_state = Arc::new(AppState {
        identity: HealthIdentity {
            agent_id: identity.agent_id.clone(),
            hostname: hostname.clone(),
            platform: platform.clone(),
            public_key: public_key.clone(),
            ssh_port: managed.ssh_server_port,
        },
        state_store: state_store.clone(),
        logs: LOG_RING.get().cloned().unwrap_or_default(),
        log_level: Arc::new(ClonedLogControl),
        log_file_path: paths.log_file(),
        state_file_path: paths.state_file(),
        workflow_count: Arc::new(parking_lot::RwLock::new(managed.workflows.len())),
        file_browser: Arc::new(parking_lot::RwLock::new(managed.file_browser_settings.clone())),
    });

    let webhook_router = triggers::webhook_router(managed.workflows.clone(), executor.clone());
    let http_router = fleet_healthapi::router(health_state.clone()).merge(webhook_router);

    let health_handle = {
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(health_addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, "failed to bind health api listener");
                    return;
                }
            };
            let server = axum::serve(listener, http_router).with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            });
            if let Err(e) = server.await {
                error!(error = %e, "health api server exited with error");
            }
        })
    };

    let ws_handle = {
        let state = registration_state.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            ws_client.run(state, outbound_rx, event_tx, shutdown).await;
        })
    };

    let git_sync_handle = spawn_git_sync_loop(gitsync.clone(), shutdown_rx.clone());

    let event_loop = {
        let registration_state = registration_state.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                    event = event_rx.recv() => {
                        let Some(event) = event else { break };
                        handle_client_event(event, &mut local_config, &registration_state).await;
                    }
                }
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping agent");
    let _ = shutdown_tx.send(true);

    file_watcher.shutdown().await;
    for task in trigger_tasks.drain(..) {
        let _ = task.await;
    }
    let _ = sshd_handle.await;
    let _ = health_handle.await;
    let _ = ws_handle.await;
    let _ = git_sync_handle.await;
    let _ = event_loop.await;

    info!("agent shutdown complete");
    Ok(())
}

/// Forwards `/api/loglevel` and `set-log-level` to the reload handle
/// stashed by [`init_tracing`] — kept distinct from
/// [`ReloadLogLevelControl`] so `AppState` doesn't need to know about the
/// `OnceLock` wiring that ties the two together at process start.
struct ClonedLogControl;

impl fleet_healthapi::LogLevelControl for ClonedLogControl {
    fn get(&self) -> String {
        LOG_HANDLE.get().map(|h| h.get()).unwrap_or_else(|| "info".to_string())
    }

    fn set(&self, level: &str) -> Result<(), String> {
        match LOG_HANDLE.get() {
            Some(h) => h.set(level),
            None => Err("log control not initialized".to_string()),
        }
    }
}

async fn handle_client_event(
    event: ClientEvent,
    local_config: &mut LocalConfig,
    registration_state: &SharedRegistrationState,
) {
    match event {
        ClientEvent::RegistrationAccepted => {
            if let Err(e) = local_config.mark_registered() {
                warn!(error = %e, "failed to persist registration state");
            }
            let mut state = registration_state.lock();
            state.registered = true;
            state.token = None;
            info!("registration accepted by manager");
        }
        ClientEvent::RegistrationRejected(reason) => {
            warn!(reason = %reason, "registration rejected by manager");
        }
        ClientEvent::ReconnectionAccepted => {
            info!("reconnection accepted by manager");
        }
        ClientEvent::ReconnectionRejected(reason) => {
            warn!(reason = %reason, "reconnection rejected by manager");
            if reason.to_lowercase().contains("not found") {
                if let Err(e) = local_config.clear_registered() {
                    warn!(error = %e, "failed to clear registered flag");
                }
                registration_state.lock().registered = false;
            }
        }
        ClientEvent::Command(cmd) => {
            info!(command = ?cmd.command, "received command from manager");
            match cmd.command {
                CommandKind::SetLogLevel => {
                    if let Some(level) = cmd.level.as_deref() {
                        if let Some(handle) = LOG_HANDLE.get() {
                            if let Err(e) = handle.set(level) {
                                warn!(error = %e, "failed to apply set-log-level command");
                            }
                        }
                    }
                }
                CommandKind::ReloadConfig
                | CommandKind::GitPull
                | CommandKind::RemoveWorkflow
                | CommandKind::ReloadFilewatcher => {
                    warn!(
                        command = ?cmd.command,
                        "command requires a process restart in this build; reload support is coarse-grained (§4.7)"
                    );
                }
            }
        }
        ClientEvent::Config(cfg) => match serde_json::from_value::<ManagedConfig>(cfg.config) {
            Ok(managed) => {
                if let Err(e) = local_config.apply_managed_update(managed) {
                    warn!(error = %e, "failed to persist pushed managed config");
                } else {
                    info!("applied managed config pushed by manager");
                }
            }
            Err(e) => warn!(error = %e, "malformed config payload from manager"),
        },
        ClientEvent::ServerError(err) => {
            warn!(message = %err.message, code = ?err.code, "manager reported an error");
        }
    }
}

fn spawn_git_sync_loop(gitsync: Arc<GitSync>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                _ = ticker.tick() => {
                    match gitsync.pull_safe("main") {
                        Ok(Some(backup)) => info!(?backup, "git pull created a safety backup before reset"),
                        Ok(None) => {}
                        Err(e) if e.is_retryable() => warn!(error = %e, "git pull failed, will retry next tick"),
                        Err(e) => warn!(error = %e, "git pull failed"),
                    }
                }
            }
        }
    })
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("install sigterm handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn run_cli_command(config_dir: &PathBuf, command: Commands) -> Result<()> {
    let paths = AgentPaths::new(config_dir.clone());
    let identity = AgentIdentity::load_or_create(&paths.private_key(), &paths.agent_id_file())
        .context("failed to load agent identity")?;
    let local_config = LocalConfig::load_or_init(&paths.agent_config(), &identity.agent_id, "ws://127.0.0.1:7900/ws")
        .context("failed to load local config")?;
    let git_remote = derive_git_remote(&local_config.get().manager_url);
    let gitsync = GitSync::new(paths.config_repo(), git_remote, identity.agent_id.clone(), paths.private_key());

    let (value, success) = match command {
        Commands::PushConfig => match gitsync.push("main", &format!("agent {} config update", identity.agent_id)) {
            Ok(()) => (json!({"ok": true}), true),
            Err(e) => (json!({"ok": false, "error": e.to_string()}), false),
        },
        Commands::CheckChanges => match gitsync.status() {
            Ok(status) => {
                let diverged = status.diverged();
                (
                    json!({
                        "ok": !diverged,
                        "ahead": status.ahead,
                        "behind": status.behind,
                        "dirty": status.dirty,
                        "diverged": diverged,
                    }),
                    !diverged,
                )
            }
            Err(e) => (json!({"ok": false, "error": e.to_string()}), false),
        },
        Commands::ListBackups => match gitsync.list_backups() {
            Ok(backups) => {
                let list: Vec<_> = backups
                    .iter()
                    .map(|b| match b {
                        fleet_gitsync::BackupRef::Stash { index, message } => {
                            json!({"kind": "stash", "index": index, "message": message})
                        }
                        fleet_gitsync::BackupRef::Branch { name } => json!({"kind": "branch", "name": name}),
                    })
                    .collect();
                (json!({"ok": true, "backups": list}), true)
            }
            Err(e) => (json!({"ok": false, "error": e.to_string()}), false),
        },
        Commands::RecoverBackup { reference } => {
            if reference != "latest" {
                (
                    json!({"ok": false, "error": "only 'latest' backup recovery is supported"}),
                    false,
                )
            } else {
                match gitsync.recover_latest() {
                    Ok(restored) => (json!({"ok": restored}), restored),
                    Err(e) => (json!({"ok": false, "error": e.to_string()}), false),
                }
            }
        }
        Commands::MergeConfig => match gitsync.merge("main") {
            Ok(()) => (json!({"ok": true}), true),
            Err(e) => (json!({"ok": false, "error": e.to_string()}), false),
        },
        Commands::Run { .. } => unreachable!("Run is handled in main before dispatch"),
    };

    println!("{value}");
    if success {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
