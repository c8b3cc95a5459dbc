//! Error types for idempotent execution

use std::time::Duration;
use thiserror::Error;

/// Boxed error produced by a wrapped operation.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Store backend errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{backend} store unavailable: {reason}")]
    Unavailable {
        backend: &'static str,
        reason: String,
    },

    #[error("{backend} store did not answer within {after:?}")]
    TimedOut {
        backend: &'static str,
        after: Duration,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("No conflict resolver registered under '{resolver}'")]
    ResolverNotRegistered { resolver: String },

    #[error("Store backend not compiled in: {backend}")]
    BackendNotCompiled { backend: String },

    #[error("Failed to load configuration: {reason}")]
    Load { reason: String },

    #[error("Failed to initialize telemetry: {reason}")]
    Telemetry { reason: String },
}

/// Master error type for all idempotency operations.
#[derive(Debug, Error)]
pub enum IdemError {
    #[error("Key resolution failed: {reason}")]
    KeyResolution { reason: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Idempotency key '{key}' already exists with a different result")]
    Conflict { key: String },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Idempotency key '{key}' is already being executed")]
    InFlight { key: String },

    #[error("Gave up after {waited:?} waiting for in-flight execution of '{key}'")]
    InFlightTimeout { key: String, waited: Duration },

    #[error("Operation for '{key}' failed: {source}")]
    Operation {
        key: String,
        #[source]
        source: BoxError,
    },
}

impl IdemError {
    /// Build a serialization error from any displayable cause.
    pub fn serialization(reason: impl std::fmt::Display) -> Self {
        IdemError::Serialization {
            reason: reason.to_string(),
        }
    }

    /// True for the conflict class (result mismatch or key busy).
    pub fn is_conflict(&self) -> bool {
        matches!(self, IdemError::Conflict { .. } | IdemError::InFlight { .. })
    }

    /// Conventional HTTP status for an interception layer to surface.
    pub fn status_code(&self) -> u16 {
        match self {
            IdemError::KeyResolution { .. } => 400,
            IdemError::Conflict { .. } | IdemError::InFlight { .. } => 409,
            IdemError::StoreUnavailable(_) => 503,
            IdemError::InFlightTimeout { .. } => 504,
            IdemError::Configuration(_)
            | IdemError::Serialization { .. }
            | IdemError::Operation { .. } => 500,
        }
    }
}

impl From<serde_json::Error> for IdemError {
    fn from(e: serde_json::Error) -> Self {
        IdemError::serialization(e)
    }
}

/// Result type alias for idempotency operations.
pub type IdemResult<T> = Result<T, IdemError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display_unavailable() {
        let err = StoreError::Unavailable {
            backend: "redis",
            reason: "connection refused".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("redis"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_config_error_display_resolver_missing() {
        let err = ConfigError::ResolverNotRegistered {
            resolver: "merge".to_string(),
        };
        assert!(format!("{}", err).contains("merge"));
    }

    #[test]
    fn test_conflict_names_key() {
        let err = IdemError::Conflict {
            key: "GLOBAL:order-123".to_string(),
        };
        assert!(format!("{}", err).contains("GLOBAL:order-123"));
        assert!(err.is_conflict());
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn test_status_codes() {
        let key_err = IdemError::KeyResolution {
            reason: "blank".to_string(),
        };
        assert_eq!(key_err.status_code(), 400);

        let store_err = IdemError::from(StoreError::TimedOut {
            backend: "postgres",
            after: Duration::from_secs(5),
        });
        assert_eq!(store_err.status_code(), 503);
        assert!(!store_err.is_conflict());

        let timeout = IdemError::InFlightTimeout {
            key: "k".to_string(),
            waited: Duration::from_secs(1),
        };
        assert_eq!(timeout.status_code(), 504);
    }

    #[test]
    fn test_from_variants() {
        let config = IdemError::from(ConfigError::MissingRequired {
            field: "redis.url".to_string(),
        });
        assert!(matches!(config, IdemError::Configuration(_)));

        let store = IdemError::from(StoreError::Unavailable {
            backend: "memory",
            reason: "x".to_string(),
        });
        assert!(matches!(store, IdemError::StoreUnavailable(_)));

        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        assert!(matches!(IdemError::from(json_err), IdemError::Serialization { .. }));
    }

    #[test]
    fn test_operation_error_keeps_source() {
        let source: BoxError = "payment gateway down".into();
        let err = IdemError::Operation {
            key: "GLOBAL:p-1".to_string(),
            source,
        };
        let inner = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(inner.as_deref(), Some("payment gateway down"));
    }
}
