//! Broker Replay Simulator - process entry point.
//!
//! Loads config, wires the Fanout, SessionManager and gateway router
//! together, and serves until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use broker_replay_sim::config::{AppConfig, WsConfig};
use broker_replay_sim::fanout::Fanout;
use broker_replay_sim::gateway::{self, state::AppState};
use broker_replay_sim::logging;
use broker_replay_sim::session_manager::SessionManager;

fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.yaml"))
}

#[tokio::main]
async fn main() {
    let path = config_path();
    let app_config = match AppConfig::load(&path) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("using default config, could not load {}: {err}", path.display());
            AppConfig::default()
        }
    };

    let _log_guard = logging::init_logging(&app_config);
    tracing::info!(bind_addr = %app_config.bind_addr, "starting broker-replay-sim");

    let fanout = Arc::new(Fanout::new(&WsConfig::default()));
    fanout.clone().spawn_worker();

    let bind_addr = app_config.bind_addr.clone();
    let sessions = SessionManager::new(app_config.clone(), fanout.clone());
    let state = Arc::new(AppState::new(sessions.clone(), fanout, Arc::new(app_config)));

    let server = tokio::spawn(gateway::run_server(bind_addr, state));

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(err) => tracing::error!(error = %err, "failed to listen for shutdown signal"),
    }

    sessions.shutdown().await;
    server.abort();
}
