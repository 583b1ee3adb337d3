//! Unified error types for the beacon core library.
//!
//! [`BeaconError`] covers every failure the engine can surface to a caller.
//! Module-level errors ([`StoreError`](crate::storage::StoreError),
//! [`ConfigError`](crate::config::ConfigError)) convert into it.
//!
//! Malformed or stale sightings are not errors: they are dropped and reported
//! through [`IngestOutcome`](crate::presence::IngestOutcome).
//!
//! # Example
//!
//! ```rust
//! use beacon_core::error::{BeaconError, Result};
//!
//! fn check(address: &str) -> Result<()> {
//!     if !beacon_core::is_valid_mac_address(address) {
//!         return Err(BeaconError::InvalidAddress(address.to_string()));
//!     }
//!     Ok(())
//! }
//! # assert!(check("nope").is_err());
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// The unified error type for all beacon operations.
#[derive(Debug, Error)]
pub enum BeaconError {
    // =========================================================================
    // REGISTRY ERRORS
    // =========================================================================
    /// The address is not a `XX:XX:XX:XX:XX:XX` MAC address.
    #[error("Invalid beacon address: '{0}'. Expected format 'AA:BB:CC:DD:EE:FF'.")]
    InvalidAddress(String),

    /// The beacon name was empty.
    #[error("Beacon name cannot be empty")]
    EmptyBeaconName,

    /// The beacon name exceeds the maximum length.
    #[error("Beacon name exceeds maximum length of {max} characters (got {actual})")]
    BeaconNameTooLong {
        /// Maximum allowed length.
        max: usize,
        /// Actual length provided.
        actual: usize,
    },

    /// No beacon is registered under the address.
    #[error("Beacon not found: '{0}'")]
    BeaconNotFound(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE ERRORS
    // =========================================================================
    /// The store could not read or write data.
    #[error("Persistence error: {0}")]
    PersistenceError(String),
}

/// A specialized [`Result`] type for beacon operations.
pub type Result<T> = std::result::Result<T, BeaconError>;

impl BeaconError {
    /// Returns `true` if the caller supplied an invalid beacon.
    #[inline]
    #[must_use]
    pub const fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidAddress(_) | Self::EmptyBeaconName | Self::BeaconNameTooLong { .. }
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if the store failed.
    #[inline]
    #[must_use]
    pub const fn is_persistence_error(&self) -> bool {
        matches!(self, Self::PersistenceError(_))
    }

    /// Returns `true` if retrying the same call may succeed.
    ///
    /// The engine never retries internally.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        self.is_persistence_error()
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::InvalidAddress(_) | Self::EmptyBeaconName | Self::BeaconNameTooLong { .. } => {
                400
            }
            Self::BeaconNotFound(_) | Self::ConfigNotFound(_) => 404,
            Self::ConfigParseError(_) | Self::ConfigValidationError(_) => 422,
            Self::PersistenceError(_) => 500,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidAddress(_) => "INVALID_ADDRESS",
            Self::EmptyBeaconName => "EMPTY_BEACON_NAME",
            Self::BeaconNameTooLong { .. } => "BEACON_NAME_TOO_LONG",
            Self::BeaconNotFound(_) => "BEACON_NOT_FOUND",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::storage::StoreError> for BeaconError {
    fn from(err: crate::storage::StoreError) -> Self {
        Self::PersistenceError(err.to_string())
    }
}

impl From<crate::config::ConfigError> for BeaconError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::LoadError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::WriteError { path, source } => {
                Self::PersistenceError(format!("Failed to write {}: {}", path.display(), source))
            }
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::storage::StoreError;

    #[test]
    fn test_validation_error_classification() {
        assert!(BeaconError::InvalidAddress("x".into()).is_validation_error());
        assert!(BeaconError::EmptyBeaconName.is_validation_error());
        assert!(BeaconError::BeaconNameTooLong {
            max: 64,
            actual: 65
        }
        .is_validation_error());

        assert!(!BeaconError::PersistenceError("disk full".into()).is_validation_error());
    }

    #[test]
    fn test_persistence_errors_are_recoverable() {
        assert!(BeaconError::PersistenceError("disk full".into()).is_recoverable());
        assert!(!BeaconError::EmptyBeaconName.is_recoverable());
    }

    #[test]
    fn test_config_error_classification() {
        assert!(BeaconError::ConfigNotFound(PathBuf::from("/test")).is_config_error());
        assert!(BeaconError::ConfigValidationError("bad".into()).is_config_error());
        assert!(!BeaconError::EmptyBeaconName.is_config_error());
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(BeaconError::InvalidAddress("x".into()).http_status_code(), 400);
        assert_eq!(BeaconError::BeaconNotFound("x".into()).http_status_code(), 404);
        assert_eq!(
            BeaconError::ConfigParseError("x".into()).http_status_code(),
            422
        );
        assert_eq!(
            BeaconError::PersistenceError("x".into()).http_status_code(),
            500
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            BeaconError::InvalidAddress("x".into()).error_code(),
            "INVALID_ADDRESS"
        );
        assert_eq!(
            BeaconError::PersistenceError("x".into()).error_code(),
            "PERSISTENCE_ERROR"
        );
    }

    #[test]
    fn test_from_store_error() {
        let err: BeaconError = StoreError::Unavailable("read-only".into()).into();
        assert!(err.is_persistence_error());
        assert!(err.to_string().contains("read-only"));
    }

    #[test]
    fn test_from_config_validation_errors() {
        let err: BeaconError = ConfigError::MultipleValidationErrors(vec![
            ConfigError::ValidationError {
                field: "engine.expiry_window_ms".into(),
                message: "must be greater than zero".into(),
            },
            ConfigError::ValidationError {
                field: "server.bind_address".into(),
                message: "not a socket address".into(),
            },
        ])
        .into();
        let message = err.to_string();
        assert!(message.contains("expiry_window_ms"));
        assert!(message.contains("bind_address"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<BeaconError>();
        assert_sync::<BeaconError>();
    }
}
