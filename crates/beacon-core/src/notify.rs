//! Lost-beacon notification collaborator.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::types::LostBeacon;

/// Receives one call per lost beacon.
///
/// Failures are logged by the engine and never affect presence state.
pub trait LostNotifier: Send + Sync {
    /// Deliver a lost-beacon alert.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery failed.
    fn beacon_lost(&self, event: &LostBeacon) -> anyhow::Result<()>;
}

/// Reports lost beacons to the log.
#[derive(Debug, Clone)]
pub struct LogNotifier {
    timezone: Tz,
}

impl LogNotifier {
    /// Notifier rendering times in `timezone`.
    #[must_use]
    pub const fn new(timezone: Tz) -> Self {
        Self { timezone }
    }
}

impl LostNotifier for LogNotifier {
    fn beacon_lost(&self, event: &LostBeacon) -> anyhow::Result<()> {
        let last_seen = format_last_seen(event.last_seen, event.detected_at, self.timezone);
        warn!(
            event_id = %event.event_id,
            address = %event.address,
            "{} is no longer in range. Last seen: {}",
            event.name,
            last_seen
        );
        Ok(())
    }
}

/// Render `last_seen` relative to `now`: time only on the same local day,
/// date and time otherwise.
#[must_use]
pub fn format_last_seen(last_seen: DateTime<Utc>, now: DateTime<Utc>, timezone: Tz) -> String {
    let local = last_seen.with_timezone(&timezone);
    if local.date_naive() == now.with_timezone(&timezone).date_naive() {
        local.format("%H:%M").to_string()
    } else {
        local.format("%Y-%m-%d %H:%M").to_string()
    }
}
