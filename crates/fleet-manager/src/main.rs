//! fleet-manager — the central control plane: mints registration tokens,
//! tracks agent sessions over WebSocket, and serves the Git-SSH config
//! repository agents clone/push against.

mod config;
mod paths;

use anyhow::{Context, Result};
use axum::Router;
use clap::{Parser, Subcommand};
use config::ManagerConfig;
use fleet_gitrepo::GitRepo;
use fleet_registry::AgentRegistry;
use fleet_tokens::TokenStore;
use fleet_wshub::store::{AlertStore, LogStore};
use fleet_wshub::webhook::{AlertSink, NoopAlertSink, WebhookAlertSink};
use fleet_wshub::WsHub;
use paths::ManagerPaths;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "fleet-manager", about = "Fleet automation control plane", version)]
struct Cli {
    /// Directory holding manager-config.json, the token/agent stores,
    /// and the Git config repository working tree.
    #[arg(long, env = "FLEET_MANAGER_DATA_DIR", default_value = "/var/lib/fleet-manager")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the manager: serve the WebSocket hub and the Git-SSH server.
    Run,
    /// Mint a registration token, valid for `ttl_secs` (default 3600).
    CreateToken {
        #[arg(long, default_value_t = 3600)]
        ttl_secs: i64,
    },
    /// List known agents and their status.
    ListAgents,
    /// List alerts, optionally only unacknowledged ones.
    ListAlerts {
        #[arg(long)]
        unacknowledged_only: bool,
    },
    /// Acknowledge an alert by id.
    AckAlert { id: String, #[arg(long, default_value = "operator")] by: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            init_tracing();
            match run_manager(cli.data_dir).await {
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
                .with(EnvFilter::from_default_env().add_directive("fleet_manager=info".parse()?))
                .init();
            run_cli_command(&cli.data_dir, other)
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("fleet_manager=info".parse().unwrap()))
        .init();
}

async fn run_manager(data_dir: PathBuf) -> Result<()> {
    let paths = ManagerPaths::new(data_dir);
    std::fs::create_dir_all(paths.root()).context("failed to create manager data directory")?;

    let config = ManagerConfig::load(&paths.config_file()).context("failed to load manager config")?;

    let tokens = Arc::new(TokenStore::new(&paths.tokens_file()));
    let registry = Arc::new(AgentRegistry::new(&paths.agents_file()));
    let repo = Arc::new(GitRepo::open_or_init(&paths.config_repo()).context("failed to open config repository")?);
    let alert_store = Arc::new(AlertStore::new(&paths.alerts_file()));
    let log_store = Arc::new(LogStore::new(&paths.logs_file()));

    let alert_sink: Arc<dyn AlertSink> = if config.alert_webhook_urls.is_empty() {
        Arc::new(NoopAlertSink)
    } else {
        Arc::new(WebhookAlertSink::new(config.alert_webhook_urls.clone()))
    };

    let hub = Arc::new(WsHub::new(
        tokens.clone(),
        registry.clone(),
        repo.clone(),
        alert_store.clone(),
        log_store.clone(),
        alert_sink,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweep_handle = {
        let registry = registry.clone();
        let shutdown_rx = shutdown_rx.clone();
        let interval = std::time::Duration::from_secs(config.liveness_sweep_interval_secs);
        let threshold = std::time::Duration::from_secs(config.liveness_stale_threshold_secs);
        tokio::spawn(fleet_wshub::run_liveness_sweep(registry, interval, threshold, shutdown_rx))
    };

    let git_ssh_handle = {
        let repo = repo.clone();
        let registry = registry.clone();
        let addr = config.git_ssh_addr;
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = fleet_gitssh::run(addr, repo, registry, shutdown_rx).await {
                error!(error = %e, "git-ssh server exited with error");
            }
        })
    };

    let app: Router = hub.clone().router();
    let ws_handle = {
        let addr = config.ws_addr;
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, "failed to bind websocket listener");
                    return;
                }
            };
            info!(%addr, "websocket hub listening");
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(e) = server.await {
                error!(error = %e, "websocket hub exited with error");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping manager");
    let _ = shutdown_tx.send(true);

    let _ = ws_handle.await;
    let _ = git_ssh_handle.await;
    let _ = sweep_handle.await;

    info!("manager shutdown complete");
    Ok(())
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

/// One-shot CLI operations against the on-disk stores, matching the
/// exit-code and structured-JSON-line contract `fleet-agent` uses for
/// its own CLI-mode operations (§6).
fn run_cli_command(data_dir: &PathBuf, command: Commands) -> Result<()> {
    let paths = ManagerPaths::new(data_dir.clone());
    std::fs::create_dir_all(paths.root()).context("failed to create manager data directory")?;

    let (value, success) = match command {
        Commands::CreateToken { ttl_secs } => {
            let tokens = TokenStore::new(&paths.tokens_file());
            match tokens.create(chrono::Duration::seconds(ttl_secs), None) {
                Ok(token) => (
                    json!({"ok": true, "token": token.token, "expiresAt": token.expires_at}),
                    true,
                ),
                Err(e) => (json!({"ok": false, "error": e.to_string()}), false),
            }
        }
        Commands::ListAgents => {
            let registry = AgentRegistry::new(&paths.agents_file());
            let agents: Vec<_> = registry
                .all()
                .into_iter()
                .map(|a| json!({"id": a.id, "hostname": a.hostname, "status": a.status, "lastHeartbeat": a.last_heartbeat}))
                .collect();
            (json!({"ok": true, "agents": agents}), true)
        }
        Commands::ListAlerts { unacknowledged_only } => {
            let store = AlertStore::new(&paths.alerts_file());
            let alerts: Vec<_> = store
                .all()
                .into_iter()
                .filter(|a| !unacknowledged_only || !a.acknowledged)
                .collect();
            (json!({"ok": true, "alerts": alerts}), true)
        }
        Commands::AckAlert { id, by } => {
            let store = AlertStore::new(&paths.alerts_file());
            let acked = store.acknowledge(&id, &by);
            (json!({"ok": acked}), acked)
        }
        Commands::Run => unreachable!("Run is handled in main before dispatch"),
    };

    println!("{value}");
    if success {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
