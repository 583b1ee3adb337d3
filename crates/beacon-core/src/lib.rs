//! # beacon-core
//!
//! Core engine for the beacon presence-tracking system.
//!
//! This crate turns a live, unordered stream of BLE sightings into a
//! continuously updated presence status for a user-curated set of beacons,
//! and emits a one-shot "lost" event when a beacon that was in range drops
//! out of range.
//!
//! ## Architecture
//!
//! - [`presence`] - Latest sighting per address, with a self-rescheduling expiry timer
//! - [`registry`] - The set of known beacons, persisted synchronously
//! - [`classifier`] - Pure status classification and the unknown-device view
//! - [`detector`] - InRange → OutOfRange transition detection
//! - [`engine`] - The owned engine instance wiring the above together
//! - [`storage`] - Store trait with JSON-file and in-memory implementations
//! - [`notify`] - Lost-beacon notification collaborator
//! - [`config`] - Layered configuration loading and validation
//! - [`clock`] - Wall-clock sources
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared domain types

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod classifier;
pub mod clock;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod notify;
pub mod presence;
pub mod registry;
pub mod storage;
pub mod types;

// Re-export primary types for convenience
pub use classifier::{classify, unknown_devices};
pub use clock::{Clock, SystemClock, TokioClock};
pub use config::{
    default_config_path, default_log_dir, Config, ConfigError, ConfigResult, EngineConfig,
    NotificationConfig, ServerConfig, StorageConfig, DEFAULT_EXPIRY_WINDOW_MS,
};
pub use detector::{lost_between, TransitionDetector};
pub use engine::{BeaconEngine, BeaconEngineBuilder};
pub use error::{BeaconError, Result};
pub use notify::{format_last_seen, LogNotifier, LostNotifier};
pub use presence::{ExpiryTimer, IngestOutcome, PresenceAggregator, MAX_CLOCK_SKEW};
pub use registry::{BeaconRegistry, BeaconSet, MAX_NAME_LENGTH};
pub use storage::{default_data_dir, BeaconStore, JsonFileStore, MemoryStore, StoreError, StoreResult};
pub use types::{
    is_valid_mac_address, normalize_address, Address, Beacon, BeaconState, BeaconStatus,
    LostBeacon, PresenceMap, Sighting, StatusSnapshot,
};
