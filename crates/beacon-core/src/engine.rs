//! The presence engine.
//!
//! [`BeaconEngine`] is the one explicitly constructed owner of the presence
//! aggregator, the registry and the classification pipeline. Every change to
//! presence or registry runs the pipeline synchronously under a single lock:
//!
//! ```text
//! ingest / expiry / add / remove
//!        │
//!        ▼
//!   classify(presence × registry, previous) ──► StatusSnapshot
//!        │                                          │
//!        ▼                                          ▼
//!   TransitionDetector ──► LostBeacon        watch (replay latest)
//!        │
//!        ▼
//!   broadcast + LostNotifier
//! ```
//!
//! Because the detector sits inside the pipeline it sees every snapshot, in
//! order. Observers that only sample the status watch may skip intermediate
//! snapshots, which is fine for display.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};

use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

use crate::classifier::{classify, unknown_devices};
use crate::clock::{self, Clock, SystemClock};
use crate::config::EngineConfig;
use crate::detector::TransitionDetector;
use crate::error::Result;
use crate::notify::LostNotifier;
use crate::presence::{ExpiryTimer, IngestOutcome, PresenceAggregator};
use crate::registry::{BeaconRegistry, BeaconSet};
use crate::storage::BeaconStore;
use crate::types::{Beacon, LostBeacon, PresenceMap, Sighting, StatusSnapshot};

/// What caused a recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Startup,
    Sighting,
    Expiry,
    Registry,
}

/// Builder for [`BeaconEngine`].
pub struct BeaconEngineBuilder {
    config: EngineConfig,
    store: Arc<dyn BeaconStore>,
    clock: Arc<dyn Clock>,
    notifiers: Vec<Arc<dyn LostNotifier>>,
}

impl BeaconEngineBuilder {
    /// Use `config` instead of the defaults.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `clock` instead of the system clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a lost-beacon notifier.
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn LostNotifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// Load state from the store, compute the first snapshot and start the
    /// expiry timer.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the registry cannot be loaded, or a
    /// configuration error if the expiry window is zero or out of range. A
    /// presence cache that cannot be read is logged and ignored.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(self) -> Result<BeaconEngine> {
        let registry = BeaconRegistry::load(Arc::clone(&self.store))?;
        let presence = Arc::new(PresenceAggregator::new(
            self.config.expiry_window(),
            Arc::clone(&self.clock),
        )?);

        if self.config.persist_presence {
            match self.store.load_presence() {
                Ok(cached) => {
                    let kept = presence.seed(cached);
                    debug!(kept, "Seeded presence from cache");
                }
                Err(e) => warn!(error = %e, "Failed to load presence cache; starting empty"),
            }
        }

        let (status_tx, _) = watch::channel(StatusSnapshot::default());
        let (unknown_tx, _) = watch::channel(Vec::new());
        let (lost_tx, _) = broadcast::channel(self.config.lost_event_capacity.max(1));

        let inner = Arc::new(EngineInner {
            config: self.config,
            clock: self.clock,
            store: self.store,
            presence: Arc::clone(&presence),
            registry,
            pipeline: Mutex::new(Pipeline::default()),
            status_tx,
            unknown_tx,
            lost_tx,
            notifiers: self.notifiers,
        });
        inner.recompute(Trigger::Startup);

        let weak: Weak<EngineInner> = Arc::downgrade(&inner);
        let expiry = ExpiryTimer::spawn(presence, move || {
            if let Some(inner) = weak.upgrade() {
                inner.recompute(Trigger::Expiry);
            }
        });

        info!(
            beacons = inner.registry.len(),
            expiry_window_ms = inner.config.expiry_window_ms,
            "Beacon engine started"
        );
        Ok(BeaconEngine { inner, expiry })
    }
}

/// Presence-tracking engine.
///
/// Dropping the engine stops its expiry timer.
pub struct BeaconEngine {
    inner: Arc<EngineInner>,
    expiry: ExpiryTimer,
}

impl std::fmt::Debug for BeaconEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeaconEngine")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

impl BeaconEngine {
    /// Start building an engine persisted through `store`.
    pub fn builder(store: Arc<dyn BeaconStore>) -> BeaconEngineBuilder {
        BeaconEngineBuilder {
            config: EngineConfig::default(),
            store,
            clock: Arc::new(SystemClock),
            notifiers: Vec::new(),
        }
    }

    /// Feed one sighting from the advertisement source.
    pub fn ingest(&self, sighting: Sighting) -> IngestOutcome {
        let outcome = self.inner.presence.ingest(sighting);
        if outcome.is_updated() {
            self.inner.recompute(Trigger::Sighting);
        }
        outcome
    }

    /// Drain an advertisement source until it ends.
    ///
    /// Returns the number of sightings that changed the presence map.
    pub async fn consume<S>(&self, source: S) -> usize
    where
        S: Stream<Item = Sighting>,
    {
        let mut source = std::pin::pin!(source);
        let mut updated = 0;
        while let Some(sighting) = source.next().await {
            if self.ingest(sighting).is_updated() {
                updated += 1;
            }
        }
        debug!(updated, "Advertisement source ended");
        updated
    }

    /// Register or replace a beacon.
    ///
    /// The new status snapshot is published before this returns.
    ///
    /// # Errors
    ///
    /// Returns a validation error for bad input or a persistence error if
    /// the store write fails; in both cases nothing changes.
    pub fn add_beacon(&self, beacon: Beacon) -> Result<()> {
        if self.inner.registry.add(beacon)? {
            self.inner.recompute(Trigger::Registry);
        }
        Ok(())
    }

    /// Unregister a beacon. Unknown addresses are a no-op.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the store write fails.
    pub fn remove_beacon(&self, address: &str) -> Result<Option<Beacon>> {
        let removed = self.inner.registry.remove(address)?;
        if removed.is_some() {
            self.inner.recompute(Trigger::Registry);
        }
        Ok(removed)
    }

    /// Registered beacons.
    #[must_use]
    pub fn beacons(&self) -> BeaconSet {
        self.inner.registry.snapshot()
    }

    /// Look up one registered beacon.
    #[must_use]
    pub fn beacon(&self, address: &str) -> Option<Beacon> {
        self.inner.registry.get(address)
    }

    /// Non-expired sightings right now.
    #[must_use]
    pub fn presence(&self) -> PresenceMap {
        self.inner.presence.current()
    }

    /// Latest status snapshot.
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        self.inner.status_tx.borrow().clone()
    }

    /// Latest unknown-device view.
    #[must_use]
    pub fn unknown_devices(&self) -> Vec<Sighting> {
        self.inner.unknown_tx.borrow().clone()
    }

    /// Watch status snapshots. The receiver starts with the latest value.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.inner.status_tx.subscribe()
    }

    /// Watch the unknown-device view.
    #[must_use]
    pub fn subscribe_unknown_devices(&self) -> watch::Receiver<Vec<Sighting>> {
        self.inner.unknown_tx.subscribe()
    }

    /// Watch the published presence map.
    #[must_use]
    pub fn subscribe_presence(&self) -> watch::Receiver<PresenceMap> {
        self.inner.presence.subscribe()
    }

    /// Watch registry membership.
    #[must_use]
    pub fn subscribe_registry(&self) -> watch::Receiver<BeaconSet> {
        self.inner.registry.subscribe()
    }

    /// Receive every lost event emitted from now on, in order.
    #[must_use]
    pub fn subscribe_lost(&self) -> broadcast::Receiver<LostBeacon> {
        self.inner.lost_tx.subscribe()
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Stop the expiry timer and flush the presence cache. Shared state
    /// stays readable.
    pub fn shutdown(&self) {
        self.expiry.cancel();
        if self.inner.config.persist_presence {
            let mut pipeline = self.inner.lock_pipeline();
            self.inner.save_presence(&mut pipeline, &self.inner.presence.current());
        }
        info!("Beacon engine stopped");
    }
}

#[derive(Debug, Default)]
struct Pipeline {
    detector: TransitionDetector,
    sequence: u64,
    presence_saved_at: Option<DateTime<Utc>>,
}

impl Pipeline {
    /// Sightings write the cache at most once per `interval`.
    fn presence_flush_due(
        &self,
        trigger: Trigger,
        now: DateTime<Utc>,
        interval: Duration,
    ) -> bool {
        match trigger {
            Trigger::Expiry => true,
            Trigger::Sighting => self
                .presence_saved_at
                .map_or(true, |saved| clock::until(saved, now) >= interval),
            Trigger::Startup | Trigger::Registry => false,
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn BeaconStore>,
    presence: Arc<PresenceAggregator>,
    registry: BeaconRegistry,
    pipeline: Mutex<Pipeline>,
    status_tx: watch::Sender<StatusSnapshot>,
    unknown_tx: watch::Sender<Vec<Sighting>>,
    lost_tx: broadcast::Sender<LostBeacon>,
    notifiers: Vec<Arc<dyn LostNotifier>>,
}

impl EngineInner {
    /// Recompute and publish one snapshot, then notify for lost beacons.
    #[instrument(level = "trace", skip(self))]
    fn recompute(&self, trigger: Trigger) {
        let lost = {
            let mut pipeline = self.lock_pipeline();
            let now = self.clock.now();
            let presence = self.presence.current();
            let beacons = self.registry.snapshot();

            let entries = classify(&presence, &beacons, pipeline.detector.previous());
            pipeline.sequence += 1;
            let snapshot = StatusSnapshot::new(pipeline.sequence, now, entries);

            let observed: Vec<_> = snapshot
                .iter()
                .filter(|state| state.status.is_in_range())
                .map(|state| (state.beacon.address.clone(), state.status.last_seen()))
                .collect();
            // Writes the registry file whenever an in-range beacon has a
            // fresher sighting.
            self.registry.record_last_seen(&observed);

            if self.config.persist_presence
                && pipeline.presence_flush_due(
                    trigger,
                    now,
                    self.config.presence_flush_interval(),
                )
            {
                self.save_presence(&mut pipeline, &presence);
            }

            let unknown = unknown_devices(&presence, &beacons);
            self.unknown_tx.send_if_modified(|current| {
                if *current == unknown {
                    false
                } else {
                    *current = unknown;
                    true
                }
            });

            self.status_tx.send_replace(snapshot.clone());
            let lost = pipeline.detector.observe(snapshot, now);
            for event in &lost {
                info!(address = %event.address, name = %event.name, "Beacon lost");
                // No receivers is fine; notifiers below still run.
                let _ = self.lost_tx.send(event.clone());
            }
            debug!(
                ?trigger,
                sequence = pipeline.sequence,
                in_range = observed.len(),
                lost = lost.len(),
                "Status recomputed"
            );
            lost
        };

        for event in &lost {
            for notifier in &self.notifiers {
                if let Err(e) = notifier.beacon_lost(event) {
                    warn!(address = %event.address, error = %e, "Lost-beacon notification failed");
                }
            }
        }
    }

    fn save_presence(&self, pipeline: &mut Pipeline, presence: &PresenceMap) {
        let sightings: Vec<Sighting> = presence.values().cloned().collect();
        match self.store.save_presence(&sightings) {
            Ok(()) => pipeline.presence_saved_at = Some(self.clock.now()),
            Err(e) => warn!(error = %e, "Failed to save presence cache"),
        }
    }

    fn lock_pipeline(&self) -> MutexGuard<'_, Pipeline> {
        self.pipeline.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::storage::{MemoryStore, StoreError, StoreResult};
    use crate::types::BeaconStatus;
    use chrono::{TimeDelta, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast::error::TryRecvError;

    const X: &str = "AA:AA:AA:AA:AA:AA";
    const Y: &str = "BB:BB:BB:BB:BB:BB";

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    fn at(ms: i64) -> DateTime<Utc> {
        t0() + TimeDelta::milliseconds(ms)
    }

    fn engine_with(store: Arc<dyn BeaconStore>) -> BeaconEngine {
        BeaconEngine::builder(store)
            .clock(Arc::new(TokioClock::anchored_at(t0())))
            .start()
            .unwrap()
    }

    struct CountingNotifier(AtomicUsize);

    impl LostNotifier for CountingNotifier {
        fn beacon_lost(&self, _event: &LostBeacon) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("notification channel unavailable")
        }
    }

    struct BrokenPresenceCache;

    impl BeaconStore for BrokenPresenceCache {
        fn load_beacons(&self) -> StoreResult<Vec<Beacon>> {
            Ok(Vec::new())
        }

        fn save_beacons(&self, _beacons: &[Beacon]) -> StoreResult<()> {
            Ok(())
        }

        fn load_presence(&self) -> StoreResult<Vec<Sighting>> {
            Err(StoreError::Unavailable("cache corrupt".into()))
        }

        fn save_presence(&self, _sightings: &[Sighting]) -> StoreResult<()> {
            Err(StoreError::Unavailable("cache full".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_snapshot_is_unknown() {
        let store = Arc::new(MemoryStore::with_beacons(vec![Beacon::new("Keys", X, at(-5_000))]));
        let engine = engine_with(store);

        let status = engine.status();
        assert_eq!(status.sequence, 1);
        assert_eq!(
            status.status(X),
            Some(&BeaconStatus::Unknown {
                last_seen: at(-5_000)
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_is_visible_before_return() {
        let engine = engine_with(Arc::new(MemoryStore::new()));
        engine.ingest(Sighting::new(X, -50.0, at(0)));
        engine.add_beacon(Beacon::new("Keys", X, at(0))).unwrap();
        assert!(engine.status().status(X).unwrap().is_in_range());
        assert!(engine.unknown_devices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_devices_track_registry() {
        let engine = engine_with(Arc::new(MemoryStore::new()));
        engine.ingest(Sighting::new(X, -50.0, at(0)).with_name("JDY-23"));
        assert_eq!(engine.unknown_devices().len(), 1);
        assert_eq!(engine.unknown_devices()[0].name.as_deref(), Some("JDY-23"));

        engine.add_beacon(Beacon::new("Keys", X, at(0))).unwrap();
        assert!(engine.unknown_devices().is_empty());

        engine.remove_beacon(X).unwrap();
        assert_eq!(engine.unknown_devices().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_range_writes_back_last_seen() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone());
        engine.add_beacon(Beacon::new("Keys", X, at(0))).unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        engine.ingest(Sighting::new(X, -50.0, at(10_000)));

        assert_eq!(engine.beacon(X).unwrap().last_seen, at(10_000));
        assert_eq!(store.saved_beacons()[0].last_seen, at(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_back_does_not_wake_registry_watchers() {
        let engine = engine_with(Arc::new(MemoryStore::new()));
        engine.add_beacon(Beacon::new("Keys", X, at(0))).unwrap();
        let mut registry = engine.subscribe_registry();
        registry.mark_unchanged();

        tokio::time::sleep(Duration::from_secs(10)).await;
        engine.ingest(Sighting::new(X, -50.0, at(10_000)));

        let mut changed = tokio_test::task::spawn(registry.changed());
        tokio_test::assert_pending!(changed.poll());
        drop(changed);
        assert_eq!(registry.borrow()[X].last_seen, at(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_event_carries_last_seen() {
        let engine = engine_with(Arc::new(MemoryStore::new()));
        let mut lost = engine.subscribe_lost();
        engine.add_beacon(Beacon::new("Keys", X, at(0))).unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        engine.ingest(Sighting::new(X, -50.0, at(5_000)));
        tokio::time::sleep(Duration::from_secs(61)).await;

        let event = lost.try_recv().unwrap();
        assert_eq!(event.address, X);
        assert_eq!(event.name, "Keys");
        assert_eq!(event.last_seen, at(5_000));
        assert!(event.detected_at >= at(65_000) && event.detected_at < at(66_000));
        assert!(matches!(lost.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifier_failure_does_not_affect_state() {
        let notifier = Arc::new(CountingNotifier(AtomicUsize::new(0)));
        let engine = BeaconEngine::builder(Arc::new(MemoryStore::new()))
            .clock(Arc::new(TokioClock::anchored_at(t0())))
            .notifier(notifier.clone())
            .start()
            .unwrap();
        engine.add_beacon(Beacon::new("Keys", X, at(0))).unwrap();
        engine.ingest(Sighting::new(X, -50.0, at(0)));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
        assert!(engine.status().status(X).unwrap().is_out_of_range());

        engine.ingest(Sighting::new(X, -50.0, at(61_000)));
        assert!(engine.status().status(X).unwrap().is_in_range());
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_cache_warms_restart() {
        let store = Arc::new(MemoryStore::new());
        {
            let engine = engine_with(store.clone());
            engine.add_beacon(Beacon::new("Keys", X, at(0))).unwrap();
            engine.ingest(Sighting::new(X, -50.0, at(0)));
            engine.ingest(Sighting::new(Y, -70.0, at(0)));
            engine.shutdown();
        }
        assert_eq!(store.saved_presence().len(), 2);

        tokio::time::sleep(Duration::from_secs(30)).await;
        let engine = BeaconEngine::builder(store.clone())
            .clock(Arc::new(TokioClock::anchored_at(at(30_000))))
            .start()
            .unwrap();
        assert_eq!(engine.presence().len(), 2);
        assert!(engine.status().status(X).unwrap().is_in_range());
        assert_eq!(engine.unknown_devices().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_cache_writes_are_coalesced() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone());
        engine.ingest(Sighting::new(X, -50.0, at(0)));
        engine.ingest(Sighting::new(Y, -70.0, at(0)));
        assert_eq!(store.saved_presence().len(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        engine.ingest(Sighting::new(Y, -70.0, at(10_000)));
        assert_eq!(store.saved_presence().len(), 2);

        tokio::time::sleep(Duration::from_secs(55)).await;
        assert_eq!(store.saved_presence().len(), 1);
        assert_eq!(store.saved_presence()[0].address, Y);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_window_fails_start() {
        let config = EngineConfig {
            expiry_window_ms: u64::MAX,
            ..EngineConfig::default()
        };
        let err = BeaconEngine::builder(Arc::new(MemoryStore::new()))
            .config(config)
            .start()
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_cache_entries_are_filtered() {
        let store = Arc::new(
            MemoryStore::with_beacons(vec![Beacon::new("Keys", X, at(-120_000))])
                .with_presence(vec![Sighting::new(X, -50.0, at(-90_000))]),
        );
        let engine = engine_with(store);
        assert!(engine.presence().is_empty());
        assert!(engine.status().status(X).unwrap().is_unknown());
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_cache_failures_are_not_fatal() {
        let engine = engine_with(Arc::new(BrokenPresenceCache));
        assert_eq!(engine.ingest(Sighting::new(X, -50.0, at(0))), IngestOutcome::Updated);
        assert_eq!(engine.presence().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_drains_source() {
        let engine = engine_with(Arc::new(MemoryStore::new()));
        let source = futures::stream::iter(vec![
            Sighting::new(X, -50.0, at(0)),
            Sighting::new(X, -50.0, at(0)),
            Sighting::new("", -50.0, at(0)),
            Sighting::new(Y, -60.0, at(0)),
        ]);
        assert_eq!(engine.consume(source).await, 2);
        assert_eq!(engine.presence().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_expiry() {
        let engine = engine_with(Arc::new(MemoryStore::new()));
        engine.add_beacon(Beacon::new("Keys", X, at(0))).unwrap();
        engine.ingest(Sighting::new(X, -50.0, at(0)));
        let sequence = engine.status().sequence;

        engine.shutdown();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(engine.status().sequence, sequence);
        assert!(engine.presence().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_subscriber_sees_latest_on_subscribe() {
        let engine = engine_with(Arc::new(MemoryStore::new()));
        engine.add_beacon(Beacon::new("Keys", X, at(0))).unwrap();
        engine.ingest(Sighting::new(X, -50.0, at(0)));

        let rx = engine.subscribe_status();
        assert!(rx.borrow().status(X).unwrap().is_in_range());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_subscribers_leaves_engine_running() {
        let engine = engine_with(Arc::new(MemoryStore::new()));
        engine.add_beacon(Beacon::new("Keys", X, at(0))).unwrap();
        let mut kept = engine.subscribe_lost();
        drop(engine.subscribe_lost());
        drop(engine.subscribe_status());

        engine.ingest(Sighting::new(X, -50.0, at(0)));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(kept.try_recv().unwrap().address, X);
    }
}
