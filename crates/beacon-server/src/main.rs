//! # beacon-server
//!
//! HTTP server for the beacon presence-tracking system.
//!
//! This binary provides:
//! - REST API for the beacon registry, status and unknown devices
//! - Server-sent events for live status and lost beacons
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development
//! cargo run --package beacon-server -- ./beacon.toml
//!
//! # Production
//! BEACON__SERVER__PRODUCTION=true ./beacon-server
//! ```
//!
//! The configuration file path may also be given through `BEACON_CONFIG`.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use beacon_core::{BeaconEngine, Config, JsonFileStore, LogNotifier};
use beacon_server::{api, logging, state::AppState};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("BEACON_CONFIG"))
        .map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;

    logging::init(&config.server)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting beacon-server");

    let data_dir = config.storage.data_dir();
    let store = Arc::new(JsonFileStore::new(&data_dir));
    info!(data_dir = %data_dir.display(), "Using JSON file store");

    let mut builder = BeaconEngine::builder(store).config(config.engine.clone());
    if config.notifications.enabled {
        builder = builder.notifier(Arc::new(LogNotifier::new(config.notifications.timezone)));
    } else {
        warn!("Lost-beacon notifications are disabled");
    }
    let engine = builder.start().context("Failed to start beacon engine")?;

    let bind_address = config.server.bind_address.clone();
    let state = AppState::new(engine, config);
    let app = api::create_router(state.clone());

    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {bind_address}"))?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.engine.shutdown();
    info!("beacon-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
