//! The set of known beacons.
//!
//! Mutations are persisted synchronously: the store is written first and the
//! in-memory set is only replaced once the write succeeds. A failed write
//! leaves the registry exactly as it was and is returned to the caller.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{BeaconError, Result};
use crate::storage::BeaconStore;
use crate::types::{is_valid_mac_address, normalize_address, Address, Beacon};

/// Maximum length of a beacon name, in characters.
pub const MAX_NAME_LENGTH: usize = 64;

/// Registered beacons keyed by address.
pub type BeaconSet = BTreeMap<Address, Beacon>;

/// Address-keyed set of known beacons backed by a [`BeaconStore`].
pub struct BeaconRegistry {
    store: Arc<dyn BeaconStore>,
    beacons: Mutex<BeaconSet>,
    published: watch::Sender<BeaconSet>,
}

impl std::fmt::Debug for BeaconRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeaconRegistry")
            .field("beacons", &self.lock().len())
            .finish_non_exhaustive()
    }
}

impl BeaconRegistry {
    /// Seed the registry from the store.
    ///
    /// Stored records with an unusable address are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the store cannot be read.
    pub fn load(store: Arc<dyn BeaconStore>) -> Result<Self> {
        let mut beacons = BeaconSet::new();
        for beacon in store.load_beacons()? {
            let address = normalize_address(&beacon.address);
            if !is_valid_mac_address(&address) {
                warn!(address = %beacon.address, "Skipping stored beacon with invalid address");
                continue;
            }
            beacons.insert(address.clone(), Beacon { address, ..beacon });
        }
        info!(count = beacons.len(), "Loaded beacon registry");

        let (published, _) = watch::channel(beacons.clone());
        Ok(Self {
            store,
            beacons: Mutex::new(beacons),
            published,
        })
    }

    /// Add or replace a beacon.
    ///
    /// Returns `Ok(false)` if an identical beacon was already registered, in
    /// which case nothing is written.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad name or address, or a persistence
    /// error if the store write fails.
    pub fn add(&self, beacon: Beacon) -> Result<bool> {
        let beacon = validate(beacon)?;

        let mut beacons = self.lock();
        if beacons.get(&beacon.address) == Some(&beacon) {
            return Ok(false);
        }

        let mut next = beacons.clone();
        next.insert(beacon.address.clone(), beacon.clone());
        self.persist(&next)?;

        *beacons = next;
        self.published.send_replace(beacons.clone());
        info!(address = %beacon.address, name = %beacon.name, "Beacon added");
        Ok(true)
    }

    /// Remove the beacon registered under `address`.
    ///
    /// Removing an unknown address is a no-op returning `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the store write fails.
    pub fn remove(&self, address: &str) -> Result<Option<Beacon>> {
        let address = normalize_address(address);

        let mut beacons = self.lock();
        if !beacons.contains_key(&address) {
            return Ok(None);
        }

        let mut next = beacons.clone();
        let removed = next.remove(&address);
        self.persist(&next)?;

        *beacons = next;
        self.published.send_replace(beacons.clone());
        info!(address = %address, "Beacon removed");
        Ok(removed)
    }

    /// Advance `last_seen` for beacons observed more recently than recorded.
    ///
    /// This is a bookkeeping update, not a membership change: watchers see
    /// the new values on their next read but are not woken. A store failure
    /// is logged and the in-memory values are kept.
    ///
    /// Returns the number of beacons updated.
    pub fn record_last_seen(&self, observed: &[(Address, DateTime<Utc>)]) -> usize {
        let mut beacons = self.lock();
        let mut updated = 0;
        for (address, seen) in observed {
            if let Some(beacon) = beacons.get_mut(address) {
                if *seen > beacon.last_seen {
                    beacon.last_seen = *seen;
                    updated += 1;
                }
            }
        }
        if updated == 0 {
            return 0;
        }

        if let Err(e) = self.persist(&beacons) {
            warn!(error = %e, "Failed to persist last-seen times; keeping in-memory values");
        }
        let current = beacons.clone();
        self.published.send_if_modified(|published| {
            *published = current;
            false
        });
        debug!(updated, "Recorded last-seen times");
        updated
    }

    /// Consistent point-in-time copy of the registry.
    #[must_use]
    pub fn snapshot(&self) -> BeaconSet {
        self.lock().clone()
    }

    /// Look up a beacon by address.
    #[must_use]
    pub fn get(&self, address: &str) -> Option<Beacon> {
        self.lock().get(&normalize_address(address)).cloned()
    }

    /// Returns `true` if `address` is registered.
    #[must_use]
    pub fn contains(&self, address: &str) -> bool {
        self.lock().contains_key(&normalize_address(address))
    }

    /// Number of registered beacons.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no beacons are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Watch membership changes. The receiver starts with the current set.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<BeaconSet> {
        self.published.subscribe()
    }

    fn persist(&self, beacons: &BeaconSet) -> Result<()> {
        let records: Vec<Beacon> = beacons.values().cloned().collect();
        self.store.save_beacons(&records).map_err(BeaconError::from)
    }

    fn lock(&self) -> MutexGuard<'_, BeaconSet> {
        self.beacons.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn validate(beacon: Beacon) -> Result<Beacon> {
    let address = normalize_address(&beacon.address);
    if !is_valid_mac_address(&address) {
        return Err(BeaconError::InvalidAddress(beacon.address));
    }

    let name = beacon.name.trim();
    if name.is_empty() {
        return Err(BeaconError::EmptyBeaconName);
    }
    let length = name.chars().count();
    if length > MAX_NAME_LENGTH {
        return Err(BeaconError::BeaconNameTooLong {
            max: MAX_NAME_LENGTH,
            actual: length,
        });
    }

    Ok(Beacon {
        name: name.to_string(),
        address,
        last_seen: beacon.last_seen,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StoreError, StoreResult};
    use chrono::TimeZone;

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn registry() -> (Arc<MemoryStore>, BeaconRegistry) {
        let store = Arc::new(MemoryStore::new());
        let registry = BeaconRegistry::load(store.clone()).unwrap();
        (store, registry)
    }

    struct ReadOnlyStore(Vec<Beacon>);

    impl BeaconStore for ReadOnlyStore {
        fn load_beacons(&self) -> StoreResult<Vec<Beacon>> {
            Ok(self.0.clone())
        }

        fn save_beacons(&self, _beacons: &[Beacon]) -> StoreResult<()> {
            Err(StoreError::Unavailable("read-only".into()))
        }
    }

    #[test]
    fn test_add_persists_before_returning() {
        let (store, registry) = registry();
        assert!(registry.add(Beacon::new("Keys", ADDR, t(0))).unwrap());
        assert_eq!(store.saved_beacons(), vec![Beacon::new("Keys", ADDR, t(0))]);
        assert!(registry.contains(ADDR));
    }

    #[test]
    fn test_add_is_idempotent() {
        let (_, registry) = registry();
        let beacon = Beacon::new("Keys", ADDR, t(0));
        assert!(registry.add(beacon.clone()).unwrap());
        let once = registry.snapshot();
        assert!(!registry.add(beacon).unwrap());
        assert_eq!(registry.snapshot(), once);
    }

    #[test]
    fn test_add_replaces_same_address() {
        let (_, registry) = registry();
        registry.add(Beacon::new("Keys", ADDR, t(0))).unwrap();
        registry
            .add(Beacon::new("House keys", "aa:bb:cc:dd:ee:ff", t(0)))
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(ADDR).unwrap().name, "House keys");
    }

    #[test]
    fn test_add_rejects_invalid_input() {
        let (_, registry) = registry();
        assert!(matches!(
            registry.add(Beacon::new("Keys", "not-an-address", t(0))),
            Err(BeaconError::InvalidAddress(_))
        ));
        assert!(matches!(
            registry.add(Beacon::new("   ", ADDR, t(0))),
            Err(BeaconError::EmptyBeaconName)
        ));
        assert!(matches!(
            registry.add(Beacon::new("x".repeat(65), ADDR, t(0))),
            Err(BeaconError::BeaconNameTooLong { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_non_member_is_noop() {
        let (_, registry) = registry();
        assert_eq!(registry.remove(ADDR).unwrap(), None);
    }

    #[test]
    fn test_remove_returns_beacon() {
        let (store, registry) = registry();
        registry.add(Beacon::new("Keys", ADDR, t(0))).unwrap();
        let removed = registry.remove("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(removed.map(|b| b.name), Some("Keys".to_string()));
        assert!(store.saved_beacons().is_empty());
    }

    #[test]
    fn test_failed_write_leaves_registry_unchanged() {
        let existing = Beacon::new("Keys", ADDR, t(0));
        let registry = BeaconRegistry::load(Arc::new(ReadOnlyStore(vec![existing.clone()]))).unwrap();
        let rx = registry.subscribe();

        let err = registry
            .add(Beacon::new("Bag", "11:22:33:44:55:66", t(0)))
            .unwrap_err();
        assert!(err.is_persistence_error());
        assert!(registry.remove(ADDR).is_err());

        assert_eq!(registry.snapshot().into_values().collect::<Vec<_>>(), vec![existing]);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_mutations_are_published() {
        let (_, registry) = registry();
        let mut rx = registry.subscribe();
        registry.add(Beacon::new("Keys", ADDR, t(0))).unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().contains_key(ADDR));
    }

    #[test]
    fn test_record_last_seen_is_silent_and_monotonic() {
        let (store, registry) = registry();
        registry.add(Beacon::new("Keys", ADDR, t(1_000))).unwrap();
        let mut rx = registry.subscribe();
        rx.borrow_and_update();

        assert_eq!(registry.record_last_seen(&[(ADDR.to_string(), t(5_000))]), 1);
        assert_eq!(registry.record_last_seen(&[(ADDR.to_string(), t(2_000))]), 0);

        assert_eq!(registry.get(ADDR).unwrap().last_seen, t(5_000));
        assert_eq!(store.saved_beacons()[0].last_seen, t(5_000));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(rx.borrow()[ADDR].last_seen, t(5_000));
    }

    #[test]
    fn test_load_skips_invalid_addresses() {
        let store = Arc::new(MemoryStore::with_beacons(vec![
            Beacon::new("Keys", "aa:bb:cc:dd:ee:ff", t(0)),
            Beacon::new("Broken", "???", t(0)),
        ]));
        let registry = BeaconRegistry::load(store).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(ADDR));
    }
}
