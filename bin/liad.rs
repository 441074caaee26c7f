//! `liad` is the VM-API server daemon.
//!
//! It owns every microVM on the host: one per task, provisioned on demand,
//! streamed to observers over WebSockets, suspended when idle, and cleaned up
//! on termination.
//!
//! ## Usage
//!
//! ```bash
//! liad --config-dir config
//! ```
//!
//! Configuration is read from `<config-dir>/default` overlaid by
//! `<config-dir>/local`, then by `LIA__`-prefixed environment variables
//! (e.g. `LIA__SERVER__PORT=9000`).

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use lia::{
    config::AppConfig,
    orchestration::Orchestrator,
    server::{create_router, AppState},
    store::TaskStore,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Arguments for the liad daemon.
#[derive(Debug, Parser)]
#[command(name = "liad", author, version, about)]
struct LiadArgs {
    /// Directory holding the `default` and `local` configuration files.
    #[arg(long, default_value = "config")]
    config_dir: String,
}

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lia=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = LiadArgs::parse();

    let config = Arc::new(AppConfig::load_from(
        &format!("{}/default", args.config_dir),
        &format!("{}/local", args.config_dir),
    )?);

    let store = TaskStore::connect(&config.database.url, config.database.max_connections).await?;
    tracing::info!("database connected and migrations applied");

    let orchestrator = Arc::new(Orchestrator::new(config.clone(), store)?);

    // Clean up whatever a previous process left behind before going live.
    orchestrator.reconcile().await?;
    orchestrator.spawn_idle_watchdog();

    let app = create_router(AppState::new(orchestrator));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
