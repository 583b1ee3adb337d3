//! Shared domain types.
//!
//! These are the values that flow between the presence aggregator, the
//! registry, the classifier and the transition detector, and out to the
//! HTTP surface.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// A device address, normalised to upper case (`AA:BB:CC:DD:EE:FF`).
pub type Address = String;

/// Latest non-expired sighting per address.
pub type PresenceMap = BTreeMap<Address, Sighting>;

static MAC_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").expect("static regex is valid")
});

/// Normalise a raw address for use as a map key.
#[must_use]
pub fn normalize_address(raw: &str) -> Address {
    raw.trim().to_ascii_uppercase()
}

/// Returns `true` if `address` is a colon-separated 48-bit MAC address.
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS.is_match(address)
}

/// One timestamped observation of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "address": "AA:BB:CC:DD:EE:FF",
    "rssi": -52.0,
    "observed_at": "2025-01-15T03:30:00Z",
    "name": "JDY-23"
}))]
pub struct Sighting {
    /// Device address.
    #[schema(example = "AA:BB:CC:DD:EE:FF")]
    pub address: Address,

    /// Received signal strength in dBm (never positive).
    #[schema(example = -52.0)]
    pub rssi: f32,

    /// When the advertisement was received.
    pub observed_at: DateTime<Utc>,

    /// Advertised device name, if broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Sighting {
    /// Create a sighting without an advertised name.
    pub fn new(address: impl Into<String>, rssi: f32, observed_at: DateTime<Utc>) -> Self {
        Self {
            address: address.into(),
            rssi,
            observed_at,
            name: None,
        }
    }

    /// Attach the advertised device name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The instant this sighting stops counting as presence.
    ///
    /// `None` when the end of the window is past the representable range.
    #[must_use]
    pub fn expires_at(&self, window: TimeDelta) -> Option<DateTime<Utc>> {
        self.observed_at.checked_add_signed(window)
    }

    /// Returns `true` once `now` has reached the end of the expiry window.
    ///
    /// A window that cannot be represented counts as expired.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>, window: TimeDelta) -> bool {
        !matches!(self.expires_at(window), Some(end) if now < end)
    }

    /// Returns `true` if the sighting carries a usable address and signal.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        !self.address.trim().is_empty() && self.rssi.is_finite() && self.rssi <= 0.0
    }
}

/// A user-registered device of interest. Identity is the address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "name": "Keys",
    "address": "AA:BB:CC:DD:EE:FF",
    "last_seen": "2025-01-15T03:30:00Z"
}))]
pub struct Beacon {
    /// User-facing name.
    #[schema(example = "Keys")]
    pub name: String,

    /// Device address.
    #[schema(example = "AA:BB:CC:DD:EE:FF")]
    pub address: Address,

    /// Last time the beacon was observed in range.
    pub last_seen: DateTime<Utc>,
}

impl Beacon {
    /// Create a beacon record.
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        last_seen: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            last_seen,
        }
    }
}

/// Presence status of a single known beacon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BeaconStatus {
    /// Not yet resolved in this session.
    Unknown {
        /// Last time the beacon was seen, from the registry.
        last_seen: DateTime<Utc>,
    },
    /// Currently sighted.
    InRange {
        /// Signal strength of the latest sighting in dBm.
        rssi: f32,
        /// Time of the latest sighting.
        last_seen: DateTime<Utc>,
    },
    /// Was resolved this session and is no longer sighted.
    OutOfRange {
        /// Last time the beacon was seen, from the registry.
        last_seen: DateTime<Utc>,
    },
}

impl BeaconStatus {
    /// The last-seen time carried by any variant.
    #[must_use]
    pub const fn last_seen(&self) -> DateTime<Utc> {
        match self {
            Self::Unknown { last_seen }
            | Self::InRange { last_seen, .. }
            | Self::OutOfRange { last_seen } => *last_seen,
        }
    }

    /// Returns `true` for [`BeaconStatus::InRange`].
    #[must_use]
    pub const fn is_in_range(&self) -> bool {
        matches!(self, Self::InRange { .. })
    }

    /// Returns `true` for [`BeaconStatus::OutOfRange`].
    #[must_use]
    pub const fn is_out_of_range(&self) -> bool {
        matches!(self, Self::OutOfRange { .. })
    }

    /// Returns `true` for [`BeaconStatus::Unknown`].
    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown { .. })
    }
}

/// A beacon together with its computed status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BeaconState {
    /// The registered beacon.
    pub beacon: Beacon,
    /// Its status at snapshot time.
    pub status: BeaconStatus,
}

/// Computed status of every known beacon at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Monotonic recomputation counter; 0 before the first computation.
    pub sequence: u64,
    /// When this snapshot was computed.
    pub computed_at: Option<DateTime<Utc>>,
    entries: BTreeMap<Address, BeaconState>,
}

impl StatusSnapshot {
    /// Build a snapshot from classified entries.
    #[must_use]
    pub const fn new(
        sequence: u64,
        computed_at: DateTime<Utc>,
        entries: BTreeMap<Address, BeaconState>,
    ) -> Self {
        Self {
            sequence,
            computed_at: Some(computed_at),
            entries,
        }
    }

    /// Look up the state for an address.
    #[must_use]
    pub fn get(&self, address: &str) -> Option<&BeaconState> {
        self.entries.get(address)
    }

    /// Look up just the status for an address.
    #[must_use]
    pub fn status(&self, address: &str) -> Option<&BeaconStatus> {
        self.entries.get(address).map(|state| &state.status)
    }

    /// Iterate entries in address order.
    pub fn iter(&self) -> impl Iterator<Item = &BeaconState> {
        self.entries.values()
    }

    /// Number of beacons in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no beacons are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One-shot signal that a beacon went from in range to out of range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "event_id": "01943a5e-7c1f-7d3a-9a0e-3c9f1b2d4e5f",
    "name": "Keys",
    "address": "AA:BB:CC:DD:EE:FF",
    "last_seen": "2025-01-15T03:30:00Z",
    "detected_at": "2025-01-15T03:31:00Z"
}))]
pub struct LostBeacon {
    /// Unique, time-ordered event identifier.
    pub event_id: Uuid,
    /// Beacon name at detection time.
    #[schema(example = "Keys")]
    pub name: String,
    /// Beacon address.
    #[schema(example = "AA:BB:CC:DD:EE:FF")]
    pub address: Address,
    /// Last time the beacon was seen.
    pub last_seen: DateTime<Utc>,
    /// When the transition was detected.
    pub detected_at: DateTime<Utc>,
}

impl LostBeacon {
    pub(crate) fn from_state(state: &BeaconState, detected_at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            name: state.beacon.name.clone(),
            address: state.beacon.address.clone(),
            last_seen: state.status.last_seen(),
            detected_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address(" aa:bb:cc:dd:ee:ff "), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_mac_address_validation() {
        assert!(is_valid_mac_address("AA:BB:CC:DD:EE:FF"));
        assert!(is_valid_mac_address("0a:1b:2c:3d:4e:5f"));
        assert!(!is_valid_mac_address("AA:BB:CC:DD:EE"));
        assert!(!is_valid_mac_address("AA-BB-CC-DD-EE-FF"));
        assert!(!is_valid_mac_address(""));
    }

    #[test]
    fn test_sighting_expiry_boundary() {
        let window = TimeDelta::milliseconds(60_000);
        let sighting = Sighting::new("AA:BB:CC:DD:EE:FF", -50.0, t(0));
        assert!(!sighting.is_expired_at(t(59_999), window));
        assert!(sighting.is_expired_at(t(60_000), window));
    }

    #[test]
    fn test_sighting_at_end_of_time_does_not_overflow() {
        let window = TimeDelta::milliseconds(60_000);
        let sighting = Sighting::new("AA:BB:CC:DD:EE:FF", -50.0, DateTime::<Utc>::MAX_UTC);
        assert_eq!(sighting.expires_at(window), None);
        assert!(sighting.is_expired_at(t(0), window));
    }

    #[test]
    fn test_sighting_well_formed() {
        assert!(Sighting::new("X", -40.0, t(0)).is_well_formed());
        assert!(Sighting::new("X", 0.0, t(0)).is_well_formed());
        assert!(!Sighting::new("  ", -40.0, t(0)).is_well_formed());
        assert!(!Sighting::new("X", 3.0, t(0)).is_well_formed());
        assert!(!Sighting::new("X", f32::NAN, t(0)).is_well_formed());
    }

    #[test]
    fn test_status_serialization_is_tagged() {
        let status = BeaconStatus::InRange {
            rssi: -50.0,
            last_seen: t(0),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"state\":\"in_range\""));
        assert_eq!(status.last_seen(), t(0));
        assert!(status.is_in_range());
    }
}
