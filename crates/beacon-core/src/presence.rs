//! Presence aggregation.
//!
//! [`PresenceAggregator`] folds the sighting stream into the latest sighting
//! per address and publishes the non-expired subset. [`ExpiryTimer`] is the
//! aggregator's only background activity: it sleeps until the soonest
//! expiry, prunes, and repeats until nothing is left to expire.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::clock::{self, Clock};
use crate::error::{BeaconError, Result};
use crate::types::{normalize_address, Address, PresenceMap, Sighting};

/// What happened to an ingested sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored and published.
    Updated,
    /// Same timestamp and signal as the stored entry.
    Duplicate,
    /// Older than the stored entry for the address.
    Stale,
    /// Already outside the expiry window on arrival.
    Expired,
    /// Empty address, unusable signal strength, or a timestamp too far
    /// ahead of the clock.
    Invalid,
}

impl IngestOutcome {
    /// Returns `true` if the presence map changed.
    #[must_use]
    pub const fn is_updated(self) -> bool {
        matches!(self, Self::Updated)
    }
}

/// How far ahead of the local clock a sighting may be stamped.
///
/// Capped at the expiry window when the window is shorter.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(5);

/// Latest sighting per address with time-based expiry.
#[derive(Debug)]
pub struct PresenceAggregator {
    window: TimeDelta,
    skew: TimeDelta,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<Address, Sighting>>,
    published: watch::Sender<PresenceMap>,
    reschedule: Notify,
}

impl PresenceAggregator {
    /// Create an empty aggregator.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `window` is zero or does not fit in a
    /// `chrono::TimeDelta`.
    pub fn new(window: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        let window = TimeDelta::from_std(window)
            .ok()
            .filter(|window| *window > TimeDelta::zero())
            .ok_or_else(|| {
                BeaconError::ConfigValidationError(format!(
                    "expiry window of {window:?} is out of range"
                ))
            })?;
        let skew = TimeDelta::from_std(MAX_CLOCK_SKEW)
            .unwrap_or(window)
            .min(window);

        let (published, _) = watch::channel(PresenceMap::new());
        Ok(Self {
            window,
            skew,
            clock,
            entries: Mutex::new(HashMap::new()),
            published,
            reschedule: Notify::new(),
        })
    }

    /// The configured expiry window.
    #[must_use]
    pub const fn window(&self) -> TimeDelta {
        self.window
    }

    /// Record a sighting.
    ///
    /// The stored `observed_at` never moves backwards for an address.
    /// Rejected sightings are dropped silently apart from the returned outcome.
    pub fn ingest(&self, sighting: Sighting) -> IngestOutcome {
        if !sighting.is_well_formed() {
            trace!(
                address = %sighting.address,
                rssi = sighting.rssi,
                "Dropping malformed sighting"
            );
            return IngestOutcome::Invalid;
        }

        let now = self.clock.now();
        if sighting.observed_at.signed_duration_since(now) > self.skew
            || sighting.expires_at(self.window).is_none()
        {
            trace!(
                address = %sighting.address,
                observed_at = %sighting.observed_at,
                "Dropping sighting stamped in the future"
            );
            return IngestOutcome::Invalid;
        }
        if sighting.is_expired_at(now, self.window) {
            trace!(address = %sighting.address, "Dropping sighting older than expiry window");
            return IngestOutcome::Expired;
        }

        let sighting = Sighting {
            address: normalize_address(&sighting.address),
            ..sighting
        };

        let mut entries = self.lock_entries();
        if let Some(stored) = entries.get(&sighting.address) {
            if sighting.observed_at < stored.observed_at {
                return IngestOutcome::Stale;
            }
            if *stored == sighting {
                return IngestOutcome::Duplicate;
            }
        }
        entries.insert(sighting.address.clone(), sighting);
        self.publish(&entries, now);
        drop(entries);

        self.reschedule.notify_one();
        IngestOutcome::Updated
    }

    /// Seed from a cached presence map, dropping anything already expired.
    ///
    /// Returns the number of entries kept.
    pub fn seed(&self, cached: impl IntoIterator<Item = Sighting>) -> usize {
        cached
            .into_iter()
            .map(|sighting| self.ingest(sighting))
            .filter(|outcome| outcome.is_updated())
            .count()
    }

    /// Non-expired entries as of now.
    #[must_use]
    pub fn current(&self) -> PresenceMap {
        let now = self.clock.now();
        Self::live(&self.lock_entries(), now, self.window)
    }

    /// Watch the published map. The receiver starts with the latest value.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PresenceMap> {
        self.published.subscribe()
    }

    /// Soonest instant at which a stored entry expires.
    #[must_use]
    pub fn next_expiry(&self) -> Option<DateTime<Utc>> {
        self.lock_entries()
            .values()
            .filter_map(|sighting| sighting.expires_at(self.window))
            .min()
    }

    /// Drop expired entries and republish if any were removed.
    ///
    /// Uses the actual current time, so a late wake-up prunes everything
    /// that expired in the meantime.
    pub fn expire(&self) -> bool {
        let now = self.clock.now();
        let mut entries = self.lock_entries();
        let before = entries.len();
        entries.retain(|_, sighting| !sighting.is_expired_at(now, self.window));
        let removed = before - entries.len();
        if removed == 0 {
            return false;
        }
        debug!(removed, remaining = entries.len(), "Expired sightings");
        self.publish(&entries, now);
        true
    }

    fn publish(&self, entries: &HashMap<Address, Sighting>, now: DateTime<Utc>) {
        self.published.send_replace(Self::live(entries, now, self.window));
    }

    fn live(
        entries: &HashMap<Address, Sighting>,
        now: DateTime<Utc>,
        window: TimeDelta,
    ) -> PresenceMap {
        entries
            .iter()
            .filter(|(_, sighting)| !sighting.is_expired_at(now, window))
            .map(|(address, sighting)| (address.clone(), sighting.clone()))
            .collect()
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<Address, Sighting>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Background task that expires sightings on schedule.
///
/// The task waits passively while the aggregator is empty and re-arms from
/// the minimum remaining expiry whenever a sighting is ingested. It is
/// aborted on drop.
#[derive(Debug)]
pub struct ExpiryTimer {
    handle: JoinHandle<()>,
}

impl ExpiryTimer {
    /// Spawn the timer on the current tokio runtime.
    ///
    /// `on_expire` runs after every pass that removed at least one entry.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn<F>(aggregator: Arc<PresenceAggregator>, on_expire: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let handle = tokio::spawn(async move {
            loop {
                let Some(deadline) = aggregator.next_expiry() else {
                    trace!("Expiry timer idle");
                    aggregator.reschedule.notified().await;
                    continue;
                };

                let wait = clock::until(aggregator.clock.now(), deadline);
                trace!(wait = ?wait, "Expiry timer armed");
                tokio::select! {
                    () = tokio::time::sleep(wait) => {
                        if aggregator.expire() {
                            on_expire();
                        }
                    }
                    () = aggregator.reschedule.notified() => {}
                }
            }
        });
        Self { handle }
    }

    /// Stop the timer. Shared presence state is left untouched.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Returns `true` once the task has stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ExpiryTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
