//! Unknown-device endpoint.
//!
//! Lists devices currently being sighted that are not registered beacons,
//! strongest signal first. Used to pick a device to register.

use axum::extract::State;
use axum::Json;
use beacon_core::Sighting;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::SharedState;

/// Devices in range that are not registered.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "devices": [
        {
            "address": "11:22:33:44:55:66",
            "rssi": -61.0,
            "observed_at": "2025-01-15T03:30:00Z",
            "name": "JDY-23"
        }
    ],
    "count": 1
}))]
pub struct UnknownDevicesResponse {
    /// Latest sighting per unregistered device, strongest signal first.
    pub devices: Vec<Sighting>,

    /// Number of devices.
    #[schema(example = 1, minimum = 0)]
    pub count: usize,
}

/// List unregistered devices in range.
#[utoipa::path(
    get,
    path = "/api/devices/unknown",
    tag = "devices",
    operation_id = "listUnknownDevices",
    summary = "List unregistered devices",
    description = "Returns every device with a non-expired sighting whose \
        address is not in the beacon registry.",
    responses(
        (status = 200, description = "Unregistered devices in range", body = UnknownDevicesResponse)
    )
)]
pub async fn list_unknown_devices(State(state): State<SharedState>) -> Json<UnknownDevicesResponse> {
    let devices = state.engine.unknown_devices();
    Json(UnknownDevicesResponse {
        count: devices.len(),
        devices,
    })
}
