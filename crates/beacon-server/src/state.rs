//! Application state shared across handlers.

use std::sync::Arc;

use beacon_core::{BeaconEngine, Config};

/// Shared application state.
pub type SharedState = Arc<AppState>;

/// State owned by the running server.
#[derive(Debug)]
pub struct AppState {
    /// The presence engine.
    pub engine: BeaconEngine,
    /// Configuration the server was started with.
    pub config: Config,
}

impl AppState {
    /// Wrap a started engine.
    pub fn new(engine: BeaconEngine, config: Config) -> SharedState {
        Arc::new(Self { engine, config })
    }
}
