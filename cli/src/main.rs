mod follow;
mod status_mirror;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use sidelink_core::{
    default_config_path, default_state_dir, AuthGateMiddleware, AuthStatusStore, ClientConfig,
    ConnectionStabilityTracker, EventBus, MemoryStore, MessageRouter, ResourceCache,
    SessionConfig, SidecarHttpClient, WebSocketSession,
};
use sidelink_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use tracing::{info, warn};

use crate::follow::{follow, SignalDispatcher};
use crate::status_mirror::StatusMirror;

#[derive(Parser, Debug)]
#[command(name = "sidelink")]
#[command(about = "Connect to the local sidecar and follow its connection events")]
struct Cli {
    /// JSON config file; defaults to the user config dir.
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Watch {
        #[arg(long, env = "SIDELINK_ACCESS_TOKEN", hide_env_values = true)]
        token: String,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        logs_dir: Option<String>,
    },
    Config {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    match cli.command {
        Command::Watch {
            token,
            host,
            port,
            logs_dir,
        } => {
            let config = ClientConfig::load(Some(&config_path), build_cli_overrides(host, port))
                .await
                .context("failed to load config")?;
            let logs_dir = logs_dir
                .map(PathBuf::from)
                .unwrap_or_else(|| canonical_logs_dir_from_root(&default_state_dir()));
            let (_log_guard, log_info) =
                init_process_logging(ProcessKind::Cli, &logs_dir, config.logs_retention_days)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Cli,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "cli.main",
                    status: Some("ok"),
                    detail: Some("cli jsonl logging initialized"),
                    ..Default::default()
                },
            );
            info!("cli logging initialized: {:?}", log_info);
            watch(config, &token).await
        }
        Command::Config { host, port } => {
            let config =
                ClientConfig::load(Some(&config_path), build_cli_overrides(host, port)).await?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn build_cli_overrides(host: Option<String>, port: Option<u16>) -> Option<Value> {
    let mut overrides = serde_json::Map::new();
    if let Some(host) = host {
        overrides.insert("sidecar_host".to_string(), json!(host));
    }
    if let Some(port) = port {
        overrides.insert("sidecar_port".to_string(), json!(port));
    }
    (!overrides.is_empty()).then_some(Value::Object(overrides))
}

async fn watch(config: ClientConfig, token: &str) -> anyhow::Result<()> {
    let router = MessageRouter::new();
    let events = EventBus::new();
    let statuses = AuthStatusStore::new();
    let cache = Arc::new(ResourceCache::new(Arc::new(MemoryStore::new())));

    let header = config.connection_id_header_name()?;
    let gate = AuthGateMiddleware::new(
        statuses.clone(),
        events.clone(),
        config.ccloud_connection_id.clone(),
        header.clone(),
    )
    .with_max_wait(config.auth_gate_max_wait());
    let http = SidecarHttpClient::new(config.http_base_url(), header).with_middleware(Arc::new(gate));

    let tracker = Arc::new(ConnectionStabilityTracker::new(
        events.clone(),
        Arc::new(StatusMirror::new(statuses, events.clone())),
    ));
    let _stability = tracker.attach(&router);

    let session = WebSocketSession::new(SessionConfig::from_client_config(&config), router);
    let signals = events.subscribe();
    let state = session.subscribe_state();
    session
        .connect(token)
        .await
        .with_context(|| format!("failed to connect to {}", config.websocket_url()))?;
    info!(originator = session.originator(), "sidecar session open");

    let mut dispatcher = SignalDispatcher::new(cache, http);
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };
    let stop = follow(signals, state, &mut dispatcher, interrupt).await;

    dispatcher.shutdown();
    session.close();
    info!(?stop, "watch finished");
    stop.map(|_| ())
}
