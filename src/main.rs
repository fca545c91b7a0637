use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{broadcast, mpsc};

use convoy_core::config::CoreConfig;
use convoy_engine::{ChannelManager, SessionManager, TaskRouter};
use convoy_fleet::{DevProvisioner, InstanceRegistry, PoolController};
use convoy_server::{HandlerState, ServerConfig};
use convoy_store::Database;

#[derive(Parser, Debug)]
#[command(name = "convoy", about = "Worker-instance orchestration server")]
struct Args {
    /// Port for the requester and instance-link WebSocket endpoints.
    #[arg(long, default_value_t = 9810)]
    port: u16,

    /// Directory holding the orchestrator database.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Warm instances the pool controller keeps ready.
    #[arg(long, default_value_t = 5)]
    target_warm: usize,

    /// Human-readable log lines instead of JSON.
    #[arg(long)]
    pretty_logs: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let _telemetry = convoy_telemetry::init_telemetry(convoy_telemetry::TelemetryConfig {
        json_output: !args.pretty_logs,
        ..Default::default()
    });

    tracing::info!("starting convoy orchestrator");

    let data_dir = args
        .data_dir
        .unwrap_or_else(|| dirs_home().join(".convoy").join("database"));
    let db_path = data_dir.join("convoy.db");
    let db = Database::open(&db_path).expect("failed to open database");

    let config = CoreConfig {
        target_warm_count: args.target_warm,
        ..Default::default()
    };

    // Event fabric.
    let (fleet_tx, _) = broadcast::channel(1024);
    let (session_tx, session_rx) = broadcast::channel(1024);
    let (task_tx, task_rx) = broadcast::channel(1024);
    let (inbound_tx, inbound_rx) = mpsc::channel(1024);

    // Core components.
    let registry = Arc::new(InstanceRegistry::new(
        db.clone(),
        fleet_tx.clone(),
        config.clone(),
    ));
    let channels = Arc::new(ChannelManager::new(config.clone()));
    let sessions = Arc::new(SessionManager::new(
        db.clone(),
        Arc::clone(&registry),
        session_tx,
        config.clone(),
    ));
    let router = TaskRouter::new(
        Arc::clone(&sessions),
        Arc::clone(&channels),
        task_tx,
        config.clone(),
    );

    // Reconcile persisted state before accepting claims.
    convoy_server::recovery::recover(&db, &registry, &sessions)
        .expect("recovery failed");

    // Background loops.
    let _fan_in = Arc::clone(&router).spawn_fan_in(inbound_rx);
    let _session_listener = Arc::clone(&router).spawn_session_listener(session_rx);
    let _retention = Arc::clone(&router).spawn_retention_sweeper();
    let _idle_sweeper = Arc::clone(&sessions).spawn_idle_sweeper();
    let _fleet_listener = Arc::clone(&sessions).spawn_fleet_listener(fleet_tx.subscribe());

    let provisioner = Arc::new(DevProvisioner::new());
    let controller = PoolController::new(Arc::clone(&registry), provisioner, config);
    let _pool_loop = controller.spawn();

    // Serve.
    let handler_state = Arc::new(HandlerState::new(
        sessions,
        router,
        registry,
        channels,
        inbound_tx,
    ));

    let server_config = ServerConfig {
        port: args.port,
        ..Default::default()
    };
    let handle = convoy_server::start(server_config, handler_state, task_rx)
        .await
        .expect("failed to start server");

    tracing::info!(port = handle.port, "convoy ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    tracing::info!("shutting down");
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
