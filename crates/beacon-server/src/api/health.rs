//! Health check API endpoint.
//!
//! Provides a simple health check endpoint for monitoring and load balancers.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::SharedState;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "status": "ok",
    "version": "0.1.0",
    "beacons": 3,
    "in_range": 2,
    "expiry_window_ms": 60000
}))]
pub struct HealthResponse {
    /// Service status.
    #[schema(example = "ok")]
    pub status: String,

    /// Service version from Cargo.toml.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// Number of registered beacons.
    #[schema(example = 3, minimum = 0)]
    pub beacons: usize,

    /// Number of registered beacons currently in range.
    #[schema(example = 2, minimum = 0)]
    pub in_range: usize,

    /// Configured presence expiry window in milliseconds.
    #[schema(example = 60000)]
    pub expiry_window_ms: u64,
}

/// Creates the health router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(health_check))
}

/// Health check endpoint.
///
/// Returns basic service status including how many beacons are registered
/// and how many are in range.
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    operation_id = "healthCheck",
    summary = "Check service health",
    description = "Returns basic service status information. Use this endpoint \
        for load balancer health checks and monitoring.",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    let snapshot = state.engine.status();
    let in_range = snapshot
        .iter()
        .filter(|entry| entry.status.is_in_range())
        .count();

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        beacons: snapshot.len(),
        in_range,
        expiry_window_ms: state.engine.config().expiry_window_ms,
    })
}
