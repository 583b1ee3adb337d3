//! Lost-beacon detection.
//!
//! A beacon is lost when, between two consecutive snapshots, its status goes
//! from `InRange` to `OutOfRange`. Every other pair (including anything
//! involving `Unknown`, and beacons absent from the previous snapshot) is
//! silent.

use chrono::{DateTime, Utc};

use crate::types::{BeaconState, LostBeacon, StatusSnapshot};

/// Beacons that left range between `previous` and `current`.
#[must_use]
pub fn lost_between<'a>(
    previous: &StatusSnapshot,
    current: &'a StatusSnapshot,
) -> Vec<&'a BeaconState> {
    current
        .iter()
        .filter(|state| state.status.is_out_of_range())
        .filter(|state| {
            previous
                .status(&state.beacon.address)
                .is_some_and(|status| status.is_in_range())
        })
        .collect()
}

/// Stateful detector over the ordered snapshot sequence.
///
/// It must be fed every snapshot the classifier produces; skipping one can
/// hide a transition.
#[derive(Debug, Default)]
pub struct TransitionDetector {
    previous: Option<StatusSnapshot>,
}

impl TransitionDetector {
    /// Detector with no history.
    #[must_use]
    pub const fn new() -> Self {
        Self { previous: None }
    }

    /// The last snapshot observed.
    #[must_use]
    pub const fn previous(&self) -> Option<&StatusSnapshot> {
        self.previous.as_ref()
    }

    /// Compare `snapshot` with its predecessor and remember it.
    ///
    /// The first snapshot never produces events.
    pub fn observe(
        &mut self,
        snapshot: StatusSnapshot,
        detected_at: DateTime<Utc>,
    ) -> Vec<LostBeacon> {
        let lost = self.previous.as_ref().map_or_else(Vec::new, |previous| {
            lost_between(previous, &snapshot)
                .into_iter()
                .map(|state| LostBeacon::from_state(state, detected_at))
                .collect()
        });
        self.previous = Some(snapshot);
        lost
    }
}
