//! Persistent storage for the beacon registry and the presence cache.
//!
//! The engine talks to storage through [`BeaconStore`]. Two implementations
//! ship with the crate: [`JsonFileStore`] (one JSON document per collection
//! under a data directory) and [`MemoryStore`] (process-local, for embedding
//! and tests).

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Beacon, Sighting};

/// Storage failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A data file exists but could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    ReadError {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A data file could not be written.
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The data directory could not be created.
    #[error("Failed to create directory {}: {source}", path.display())]
    CreateDirError {
        /// Directory path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A data file is not valid JSON for its record type.
    #[error("Failed to parse {}: {source}", path.display())]
    ParseError {
        /// File path.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// Records could not be serialized.
    #[error("Failed to serialize records: {0}")]
    SerializeError(#[from] serde_json::Error),

    /// A stored timestamp is outside the representable range.
    #[error("Invalid timestamp in stored record: {0} ms")]
    InvalidTimestamp(i64),

    /// The backing store refused the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence collaborator for the registry and presence cache.
///
/// Every `save_*` call replaces the whole collection.
pub trait BeaconStore: Send + Sync {
    /// Load the registered beacons.
    fn load_beacons(&self) -> StoreResult<Vec<Beacon>>;

    /// Replace the registered beacons.
    fn save_beacons(&self, beacons: &[Beacon]) -> StoreResult<()>;

    /// Load the last published presence map.
    fn load_presence(&self) -> StoreResult<Vec<Sighting>> {
        Ok(Vec::new())
    }

    /// Replace the cached presence map.
    fn save_presence(&self, _sightings: &[Sighting]) -> StoreResult<()> {
        Ok(())
    }
}

/// On-disk form of a [`Beacon`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BeaconRecord {
    name: String,
    mac_address: String,
    last_seen: i64,
}

impl From<&Beacon> for BeaconRecord {
    fn from(beacon: &Beacon) -> Self {
        Self {
            name: beacon.name.clone(),
            mac_address: beacon.address.clone(),
            last_seen: beacon.last_seen.timestamp_millis(),
        }
    }
}

impl TryFrom<BeaconRecord> for Beacon {
    type Error = StoreError;

    fn try_from(record: BeaconRecord) -> StoreResult<Self> {
        Ok(Self::new(
            record.name,
            record.mac_address,
            from_epoch_millis(record.last_seen)?,
        ))
    }
}

/// On-disk form of a [`Sighting`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SightingRecord {
    address: String,
    rssi: f32,
    last_advertisement: i64,
    #[serde(default)]
    name: Option<String>,
}

impl From<&Sighting> for SightingRecord {
    fn from(sighting: &Sighting) -> Self {
        Self {
            address: sighting.address.clone(),
            rssi: sighting.rssi,
            last_advertisement: sighting.observed_at.timestamp_millis(),
            name: sighting.name.clone(),
        }
    }
}

impl TryFrom<SightingRecord> for Sighting {
    type Error = StoreError;

    fn try_from(record: SightingRecord) -> StoreResult<Self> {
        Ok(Self {
            address: record.address,
            rssi: record.rssi,
            observed_at: from_epoch_millis(record.last_advertisement)?,
            name: record.name,
        })
    }
}

fn from_epoch_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(StoreError::InvalidTimestamp(ms))
}

/// JSON file store rooted at a data directory.
///
/// Layout:
///
/// ```text
/// <data_dir>/beacons.json    registered beacons
/// <data_dir>/presence.json   last published presence map
/// ```
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    data_dir: PathBuf,
}

impl JsonFileStore {
    /// Create a store rooted at `data_dir`. Nothing is touched until first use.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Root directory of this store.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn beacons_path(&self) -> PathBuf {
        self.data_dir.join("beacons.json")
    }

    fn presence_path(&self) -> PathBuf {
        self.data_dir.join("presence.json")
    }

    fn read_records<T>(path: &Path) -> StoreResult<Vec<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(path).map_err(|source| StoreError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| StoreError::ParseError {
            path: path.to_path_buf(),
            source,
        })
    }

    fn write_records<T: Serialize>(&self, path: &Path, records: &[T]) -> StoreResult<()> {
        std::fs::create_dir_all(&self.data_dir).map_err(|source| StoreError::CreateDirError {
            path: self.data_dir.clone(),
            source,
        })?;
        let content = serde_json::to_string_pretty(records)?;

        // Write-then-rename so a crash never leaves a truncated file behind.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(|source| StoreError::WriteError {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, path).map_err(|source| StoreError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl BeaconStore for JsonFileStore {
    fn load_beacons(&self) -> StoreResult<Vec<Beacon>> {
        Self::read_records::<BeaconRecord>(&self.beacons_path())?
            .into_iter()
            .map(Beacon::try_from)
            .collect()
    }

    fn save_beacons(&self, beacons: &[Beacon]) -> StoreResult<()> {
        let records: Vec<BeaconRecord> = beacons.iter().map(BeaconRecord::from).collect();
        self.write_records(&self.beacons_path(), &records)
    }

    fn load_presence(&self) -> StoreResult<Vec<Sighting>> {
        Self::read_records::<SightingRecord>(&self.presence_path())?
            .into_iter()
            .map(Sighting::try_from)
            .collect()
    }

    fn save_presence(&self, sightings: &[Sighting]) -> StoreResult<()> {
        let records: Vec<SightingRecord> = sightings.iter().map(SightingRecord::from).collect();
        self.write_records(&self.presence_path(), &records)
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    beacons: Mutex<Vec<Beacon>>,
    presence: Mutex<Vec<Sighting>>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with beacons, as if from a previous run.
    #[must_use]
    pub fn with_beacons(beacons: Vec<Beacon>) -> Self {
        Self {
            beacons: Mutex::new(beacons),
            presence: Mutex::default(),
        }
    }

    /// Seed the presence cache.
    #[must_use]
    pub fn with_presence(self, sightings: Vec<Sighting>) -> Self {
        *self.presence.lock().unwrap_or_else(PoisonError::into_inner) = sightings;
        self
    }

    /// Beacons as last saved.
    pub fn saved_beacons(&self) -> Vec<Beacon> {
        self.beacons
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Presence map as last saved.
    pub fn saved_presence(&self) -> Vec<Sighting> {
        self.presence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl BeaconStore for MemoryStore {
    fn load_beacons(&self) -> StoreResult<Vec<Beacon>> {
        Ok(self.saved_beacons())
    }

    fn save_beacons(&self, beacons: &[Beacon]) -> StoreResult<()> {
        *self.beacons.lock().unwrap_or_else(PoisonError::into_inner) = beacons.to_vec();
        Ok(())
    }

    fn load_presence(&self) -> StoreResult<Vec<Sighting>> {
        Ok(self.saved_presence())
    }

    fn save_presence(&self, sightings: &[Sighting]) -> StoreResult<()> {
        *self.presence.lock().unwrap_or_else(PoisonError::into_inner) = sightings.to_vec();
        Ok(())
    }
}

/// Default data directory.
///
/// On Linux: `/var/lib/beacon/`
/// Elsewhere: the platform data directory for `beacon`.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/lib/beacon")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "beacon")
            .map_or_else(|| PathBuf::from("./data"), |dirs| dirs.data_dir().to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn test_missing_files_load_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested"));
        assert!(store.load_beacons().unwrap().is_empty());
        assert!(store.load_presence().unwrap().is_empty());
    }

    #[test]
    fn test_beacons_persist_across_instances() {
        let dir = TempDir::new().unwrap();
        let beacon = Beacon::new("Keys", "AA:BB:CC:DD:EE:FF", t(1_700_000_000_123));

        JsonFileStore::new(dir.path())
            .save_beacons(std::slice::from_ref(&beacon))
            .unwrap();

        let loaded = JsonFileStore::new(dir.path()).load_beacons().unwrap();
        assert_eq!(loaded, vec![beacon]);
    }

    #[test]
    fn test_beacon_file_uses_epoch_millis() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        store
            .save_beacons(&[Beacon::new("Keys", "AA:BB:CC:DD:EE:FF", t(42))])
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("beacons.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value[0]["last_seen"], 42);
        assert_eq!(value[0]["mac_address"], "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_presence_cache_keeps_name() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        let sighting = Sighting::new("AA:BB:CC:DD:EE:FF", -61.5, t(5_000)).with_name("JDY-23");
        store.save_presence(std::slice::from_ref(&sighting)).unwrap();
        assert_eq!(store.load_presence().unwrap(), vec![sighting]);
    }

    #[test]
    fn test_corrupt_file_is_parse_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("beacons.json"), "not json").unwrap();
        let err = JsonFileStore::new(dir.path()).load_beacons().unwrap_err();
        assert!(matches!(err, StoreError::ParseError { .. }));
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        let beacon = Beacon::new("Bag", "11:22:33:44:55:66", t(0));
        store.save_beacons(std::slice::from_ref(&beacon)).unwrap();
        assert_eq!(store.load_beacons().unwrap(), vec![beacon]);
    }
}
