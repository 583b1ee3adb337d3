//! HTTP API routes and handlers.
//!
//! This module contains all HTTP endpoint implementations organized by domain:
//! - `beacons` - Beacon registry and status
//! - `devices` - Unregistered devices in range
//! - `sightings` - Advertisement ingestion
//! - `stream` - Server-sent status and lost events
//! - `health` - Service health checks
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

pub mod beacons;
pub mod devices;
pub mod error;
pub mod health;
pub mod openapi;
pub mod sightings;
pub mod stream;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                  - Health check
/// /api
/// ├── /beacons             - List status, register
/// │   └── /{address}       - Get status, remove
/// ├── /status/stream       - Server-sent status and lost events
/// ├── /devices/unknown     - Unregistered devices in range
/// ├── /sightings           - Advertisement ingestion
/// └── /openapi.json        - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .nest("/beacons", beacons::router())
                .route("/status/stream", get(stream::stream_status))
                .route("/devices/unknown", get(devices::list_unknown_devices))
                .route("/sightings", post(sightings::ingest_sightings))
                .route("/openapi.json", get(openapi::get_openapi_spec)),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
