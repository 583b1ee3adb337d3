//! OpenAPI specification generation for the beacon API.
//!
//! The document is served at `/api/openapi.json` and written to the
//! workspace root by the `gen-openapi` binary for client generation.

use axum::Json;
use beacon_core::{Beacon, BeaconState, BeaconStatus, LostBeacon, Sighting};
use utoipa::OpenApi;

use super::beacons::{AddBeaconRequest, StatusResponse};
use super::devices::UnknownDevicesResponse;
use super::error::ErrorResponse;
use super::health::HealthResponse;
use super::sightings::{IngestRequest, IngestResponse, SightingOutcome};

/// Serve the OpenAPI specification as JSON.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as pretty-printed JSON.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> serde_json::Result<String> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for beacon.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "beacon API",
        version = "0.1.0",
        description = r#"
# beacon API

beacon tracks whether your BLE tags are nearby and tells you when one goes missing.

## Overview

1. **Registry**: Register the beacons you care about by MAC address and name
2. **Status**: Each beacon is `unknown` until first sighted, then `in_range` or `out_of_range`
3. **Lost events**: A beacon that was in range and has not been sighted for the expiry window is reported lost, once
4. **Discovery**: Unregistered devices currently in range are listed to help with registration

## Live updates

`GET /api/status/stream` is a server-sent event stream. It starts with the current
status and then sends every recomputation, plus a `lost` event for each lost beacon.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local beacon server")
    ),
    tags(
        (
            name = "system",
            description = "Health checks"
        ),
        (
            name = "beacons",
            description = "Registered beacons and their presence status"
        ),
        (
            name = "devices",
            description = "Unregistered devices in range"
        ),
        (
            name = "sightings",
            description = "Advertisement ingestion from scanners"
        )
    ),
    paths(
        super::health::health_check,
        super::beacons::list_beacons,
        super::beacons::get_beacon,
        super::beacons::add_beacon,
        super::beacons::remove_beacon,
        super::stream::stream_status,
        super::devices::list_unknown_devices,
        super::sightings::ingest_sightings,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            Beacon,
            BeaconStatus,
            BeaconState,
            LostBeacon,
            Sighting,
            StatusResponse,
            AddBeaconRequest,
            UnknownDevicesResponse,
            IngestRequest,
            IngestResponse,
            SightingOutcome,
        )
    )
)]
pub struct ApiDoc;
