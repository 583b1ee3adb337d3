//! Application configuration management.
//!
//! Configuration is layered with the `config` crate:
//!
//! 1. Built-in defaults (every field has one)
//! 2. An optional TOML file (`/etc/beacon/config.toml` on Linux)
//! 3. Environment overrides, e.g. `BEACON__ENGINE__EXPIRY_WINDOW_MS=30000`

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default expiry window for sightings.
pub const DEFAULT_EXPIRY_WINDOW_MS: u64 = 60_000;

/// Upper bound accepted for the expiry window (one day).
pub const MAX_EXPIRY_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required configuration file is missing.
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Layered sources could not be merged or deserialized.
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    /// Configuration could not be rendered as TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// The configuration file could not be written.
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A single field failed validation.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields failed validation.
    #[error("{} validation errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Presence engine tuning.
    pub engine: EngineConfig,
    /// Where data is persisted.
    pub storage: StorageConfig,
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Lost-beacon notification settings.
    pub notifications: NotificationConfig,
}

/// Presence engine tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a sighting counts as presence, in milliseconds.
    pub expiry_window_ms: u64,

    /// Buffered lost events per subscriber before it starts lagging.
    pub lost_event_capacity: usize,

    /// Persist the presence map so a restart starts warm.
    pub persist_presence: bool,

    /// Minimum time between presence-cache writes caused by sightings, in
    /// milliseconds. Expiry passes and shutdown always write.
    pub presence_flush_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            expiry_window_ms: DEFAULT_EXPIRY_WINDOW_MS,
            lost_event_capacity: 64,
            persist_presence: true,
            presence_flush_interval_ms: 10_000,
        }
    }
}

impl EngineConfig {
    /// The expiry window as a [`Duration`].
    #[must_use]
    pub const fn expiry_window(&self) -> Duration {
        Duration::from_millis(self.expiry_window_ms)
    }

    /// The presence-cache flush interval as a [`Duration`].
    #[must_use]
    pub const fn presence_flush_interval(&self) -> Duration {
        Duration::from_millis(self.presence_flush_interval_ms)
    }
}

/// Storage settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory; the platform default when unset.
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolved data directory.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(crate::storage::default_data_dir)
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub bind_address: String,

    /// Use production logging (JSON files + compact stdout).
    pub production: bool,

    /// Log filter directive, e.g. `info` or `beacon_core=debug,info`.
    /// `RUST_LOG` takes precedence when set.
    pub log_level: String,

    /// Directory for rolling production log files; the platform default
    /// when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            production: false,
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl ServerConfig {
    /// Resolved log directory.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(default_log_dir)
    }
}

/// Lost-beacon notification settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Whether lost beacons are reported to the log notifier.
    pub enabled: bool,

    /// Timezone used when rendering "last seen" times.
    #[serde(with = "timezone_serde")]
    pub timezone: Tz,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timezone: chrono_tz::UTC,
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// With `path = None` the default location is used and may be absent.
    /// An explicit path must exist.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit file is missing, a source cannot be
    /// parsed, or the result fails [`Config::validate`].
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let (file, required) = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound(path.to_path_buf()));
                }
                (path.to_path_buf(), true)
            }
            None => (default_config_path(), false),
        };

        let loaded: Self = config::Config::builder()
            .add_source(
                config::File::from(file)
                    .format(config::FileFormat::Toml)
                    .required(required),
            )
            .add_source(
                config::Environment::with_prefix("BEACON")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Write configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or its parent directory cannot be written.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check every field, reporting all problems at once.
    ///
    /// # Errors
    ///
    /// Returns the single failure, or `MultipleValidationErrors`.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if self.engine.expiry_window_ms == 0 {
            errors.push(ConfigError::ValidationError {
                field: "engine.expiry_window_ms".into(),
                message: "must be greater than zero".into(),
            });
        } else if self.engine.expiry_window_ms > MAX_EXPIRY_WINDOW_MS {
            errors.push(ConfigError::ValidationError {
                field: "engine.expiry_window_ms".into(),
                message: format!("must be at most {MAX_EXPIRY_WINDOW_MS}"),
            });
        }

        if self.engine.lost_event_capacity == 0 {
            errors.push(ConfigError::ValidationError {
                field: "engine.lost_event_capacity".into(),
                message: "must be greater than zero".into(),
            });
        }

        if self.server.log_level.trim().is_empty() {
            errors.push(ConfigError::ValidationError {
                field: "server.log_level".into(),
                message: "must not be empty".into(),
            });
        }

        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ConfigError::ValidationError {
                field: "server.bind_address".into(),
                message: format!("'{}' is not a socket address", self.server.bind_address),
            });
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}

/// Default configuration file path.
///
/// On Linux: `/etc/beacon/config.toml`
/// Elsewhere: `<platform config dir>/beacon/config.toml`
#[must_use]
pub fn default_config_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/etc/beacon/config.toml")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "beacon").map_or_else(
            || PathBuf::from("./config.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }
}

/// Default log directory.
///
/// On Linux: `/var/log/beacon`
/// Elsewhere: `<platform data dir>/beacon/logs`
#[must_use]
pub fn default_log_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/beacon")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "beacon").map_or_else(
            || PathBuf::from("./logs"),
            |dirs| dirs.data_dir().join("logs"),
        )
    }
}

mod timezone_serde {
    use chrono_tz::Tz;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(tz.name())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Tz, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.expiry_window(), Duration::from_secs(60));
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[engine]
expiry_window_ms = 30000

[notifications]
timezone = "Europe/Berlin"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.engine.expiry_window_ms, 30_000);
        assert_eq!(config.engine.lost_event_capacity, 64);
        assert_eq!(config.notifications.timezone, chrono_tz::Europe::Berlin);
    }

    #[test]
    fn test_log_settings_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let logs = dir.path().join("logs");
        std::fs::write(
            &path,
            format!(
                "[server]\nlog_level = \"beacon_core=debug,info\"\nlog_dir = {:?}\n",
                logs.display().to_string()
            ),
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.log_level, "beacon_core=debug,info");
        assert_eq!(config.server.log_dir(), logs);
        assert_eq!(ServerConfig::default().log_dir(), default_log_dir());
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(Some(&dir.path().join("missing.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("etc").join("config.toml");
        let mut config = Config::default();
        config.engine.persist_presence = false;
        config.notifications.timezone = chrono_tz::America::Los_Angeles;

        config.save(&path).unwrap();
        assert_eq!(Config::load(Some(&path)).unwrap(), config);
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = Config::default();
        config.engine.expiry_window_ms = 0;
        config.server.bind_address = "nowhere".into();

        match config.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[notifications]\ntimezone = \"Mars/Olympus\"\n").unwrap();
        assert!(matches!(
            Config::load(Some(&path)),
            Err(ConfigError::LoadError(_))
        ));
    }
}
