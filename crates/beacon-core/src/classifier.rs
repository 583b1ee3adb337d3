//! Status classification.
//!
//! Pure functions projecting the presence map and the registry into per-beacon
//! statuses and the set of sighted-but-unregistered devices.

use std::collections::BTreeMap;

use crate::registry::BeaconSet;
use crate::types::{Address, Beacon, BeaconState, BeaconStatus, PresenceMap, Sighting, StatusSnapshot};

/// Classify every registered beacon.
///
/// - sighted: `InRange` with the sighting's signal and time
/// - not sighted, never resolved (no previous entry, or previous `Unknown`):
///   `Unknown` with the registry's `last_seen`
/// - not sighted, previously resolved: `OutOfRange` with the registry's
///   `last_seen`
///
/// For in-range beacons the returned [`Beacon::last_seen`] is advanced to the
/// sighting time when newer.
#[must_use]
pub fn classify(
    presence: &PresenceMap,
    beacons: &BeaconSet,
    previous: Option<&StatusSnapshot>,
) -> BTreeMap<Address, BeaconState> {
    beacons
        .iter()
        .map(|(address, beacon)| {
            let state = match presence.get(address) {
                Some(sighting) => in_range(beacon, sighting),
                None => {
                    let resolved = previous
                        .and_then(|snapshot| snapshot.status(address))
                        .is_some_and(|status| !status.is_unknown());
                    let last_seen = beacon.last_seen;
                    BeaconState {
                        beacon: beacon.clone(),
                        status: if resolved {
                            BeaconStatus::OutOfRange { last_seen }
                        } else {
                            BeaconStatus::Unknown { last_seen }
                        },
                    }
                }
            };
            (address.clone(), state)
        })
        .collect()
}

fn in_range(beacon: &Beacon, sighting: &Sighting) -> BeaconState {
    BeaconState {
        beacon: Beacon {
            last_seen: beacon.last_seen.max(sighting.observed_at),
            ..beacon.clone()
        },
        status: BeaconStatus::InRange {
            rssi: sighting.rssi,
            last_seen: sighting.observed_at,
        },
    }
}

/// Sighted devices that are not registered, strongest signal first.
#[must_use]
pub fn unknown_devices(presence: &PresenceMap, beacons: &BeaconSet) -> Vec<Sighting> {
    let mut devices: Vec<Sighting> = presence
        .values()
        .filter(|sighting| !beacons.contains_key(&sighting.address))
        .cloned()
        .collect();
    devices.sort_by(|a, b| {
        b.rssi
            .total_cmp(&a.rssi)
            .then_with(|| a.address.cmp(&b.address))
    });
    devices
}
