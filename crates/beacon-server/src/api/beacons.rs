//! Beacon registry and status endpoints.
//!
//! Beacons are the devices the user asked to track. Each one is reported as
//! `unknown` until it is first sighted, then `in_range` or `out_of_range`.
//! Registry changes are persisted and reflected in the returned status
//! before the response is sent.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use beacon_core::{normalize_address, Beacon, BeaconState, StatusSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

/// Creates the beacons router with all endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_beacons).post(add_beacon))
        .route("/{address}", get(get_beacon).delete(remove_beacon))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Status of every registered beacon.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "sequence": 42,
    "computed_at": "2025-01-15T03:31:00Z",
    "beacons": [
        {
            "beacon": {
                "name": "Keys",
                "address": "AA:BB:CC:DD:EE:FF",
                "last_seen": "2025-01-15T03:30:00Z"
            },
            "status": { "state": "in_range", "rssi": -52.0, "last_seen": "2025-01-15T03:30:00Z" }
        }
    ]
}))]
pub struct StatusResponse {
    /// Recomputation counter; increases with every published snapshot.
    #[schema(example = 42, minimum = 0)]
    pub sequence: u64,

    /// When the snapshot was computed.
    #[schema(nullable)]
    pub computed_at: Option<DateTime<Utc>>,

    /// Beacons in address order.
    pub beacons: Vec<BeaconState>,
}

impl From<&StatusSnapshot> for StatusResponse {
    fn from(snapshot: &StatusSnapshot) -> Self {
        Self {
            sequence: snapshot.sequence,
            computed_at: snapshot.computed_at,
            beacons: snapshot.iter().cloned().collect(),
        }
    }
}

/// Request body for registering a beacon.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "name": "Keys",
    "address": "AA:BB:CC:DD:EE:FF"
}))]
pub struct AddBeaconRequest {
    /// User-facing name. Required and must be non-empty.
    #[schema(example = "Keys", min_length = 1, max_length = 64)]
    pub name: String,

    /// MAC address in `AA:BB:CC:DD:EE:FF` form. Case-insensitive.
    #[schema(example = "AA:BB:CC:DD:EE:FF")]
    pub address: String,

    /// Last time the beacon was seen, if known from elsewhere.
    #[serde(default)]
    #[schema(nullable)]
    pub last_seen: Option<DateTime<Utc>>,
}

// ============================================================================
// Handlers
// ============================================================================

/// List registered beacons with their current status.
#[utoipa::path(
    get,
    path = "/api/beacons",
    tag = "beacons",
    operation_id = "listBeacons",
    summary = "List beacon status",
    description = "Returns the latest status snapshot: every registered beacon \
        with its status. A beacon never sighted since startup is `unknown`.",
    responses(
        (status = 200, description = "Current status snapshot", body = StatusResponse)
    )
)]
pub async fn list_beacons(State(state): State<SharedState>) -> Json<StatusResponse> {
    Json(StatusResponse::from(&state.engine.status()))
}

/// Get one beacon's status.
#[utoipa::path(
    get,
    path = "/api/beacons/{address}",
    tag = "beacons",
    operation_id = "getBeacon",
    summary = "Get beacon status",
    params(
        ("address" = String, Path, description = "Beacon MAC address", example = "AA:BB:CC:DD:EE:FF")
    ),
    responses(
        (status = 200, description = "Beacon status", body = BeaconState),
        (status = 404, description = "No beacon registered under the address", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn get_beacon(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<Json<BeaconState>> {
    let address = normalize_address(&address);
    state
        .engine
        .status()
        .get(&address)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::beacon_not_found(&address))
}

/// Register or rename a beacon.
///
/// Re-adding an existing address keeps its last-seen time unless the request
/// supplies one.
#[utoipa::path(
    post,
    path = "/api/beacons",
    tag = "beacons",
    operation_id = "addBeacon",
    summary = "Register a beacon",
    description = "Adds the beacon to the registry, or replaces the name of an \
        existing one. The change is persisted before the response is sent.",
    request_body = AddBeaconRequest,
    responses(
        (status = 201, description = "Beacon registered", body = BeaconState),
        (status = 400, description = "Invalid name or address", body = crate::api::error::ErrorResponse),
        (status = 503, description = "Store write failed", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn add_beacon(
    State(state): State<SharedState>,
    Json(request): Json<AddBeaconRequest>,
) -> ApiResult<(StatusCode, Json<BeaconState>)> {
    let address = normalize_address(&request.address);
    let last_seen = request
        .last_seen
        .or_else(|| state.engine.beacon(&address).map(|existing| existing.last_seen))
        .unwrap_or_else(Utc::now);

    state
        .engine
        .add_beacon(Beacon::new(request.name, address.clone(), last_seen))?;

    let entry = state
        .engine
        .status()
        .get(&address)
        .cloned()
        .ok_or_else(|| ApiError::beacon_not_found(&address))?;

    info!(address = %address, name = %entry.beacon.name, "Beacon registered via API");
    Ok((StatusCode::CREATED, Json(entry)))
}

/// Unregister a beacon.
#[utoipa::path(
    delete,
    path = "/api/beacons/{address}",
    tag = "beacons",
    operation_id = "removeBeacon",
    summary = "Remove a beacon",
    description = "Removes the beacon from the registry. Removing an address \
        that is not registered succeeds without changes. If the beacon is added \
        again later it starts over as `unknown`.",
    params(
        ("address" = String, Path, description = "Beacon MAC address", example = "AA:BB:CC:DD:EE:FF")
    ),
    responses(
        (status = 204, description = "Beacon removed or was not registered"),
        (status = 503, description = "Store write failed", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn remove_beacon(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<StatusCode> {
    if state.engine.remove_beacon(&address)?.is_none() {
        debug!(address = %address, "Remove requested for unregistered beacon");
    }
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::BeaconStatus;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    #[test]
    fn test_status_response_from_snapshot() {
        let t = Utc.with_ymd_and_hms(2025, 1, 15, 3, 30, 0).unwrap();
        let mut entries = BTreeMap::new();
        entries.insert(
            "AA:BB:CC:DD:EE:FF".to_string(),
            BeaconState {
                beacon: Beacon::new("Keys", "AA:BB:CC:DD:EE:FF", t),
                status: BeaconStatus::Unknown { last_seen: t },
            },
        );
        let response = StatusResponse::from(&StatusSnapshot::new(7, t, entries));

        assert_eq!(response.sequence, 7);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["beacons"][0]["status"]["state"], "unknown");
    }

    #[test]
    fn test_add_request_deserialization() {
        let request: AddBeaconRequest =
            serde_json::from_str(r#"{"name":"Keys","address":"aa:bb:cc:dd:ee:ff"}"#).unwrap();
        assert_eq!(request.name, "Keys");
        assert!(request.last_seen.is_none());
    }
}
