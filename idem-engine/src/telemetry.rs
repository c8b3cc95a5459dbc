//! Tracing subscriber initialization.
//!
//! `RUST_LOG` wins when set; otherwise the configured default directive is
//! used. Output is JSON lines (the default, for log shippers) or the
//! human-readable pretty format.

use idem_core::{ConfigError, IdemResult};
use std::str::FromStr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_LOG_FILTER: &str = "idem_engine=info,idem_storage=info,warn";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            _ => Err(ConfigError::InvalidValue {
                field: "IDEM_LOG_FORMAT".to_string(),
                value: s.to_string(),
                reason: "expected json or pretty".to_string(),
            }),
        }
    }
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub format: LogFormat,
    /// Directive used when `RUST_LOG` is unset or unparsable
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            default_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// # Environment Variables
    /// - `IDEM_LOG_FORMAT`: `json` or `pretty` (default: json)
    /// - `IDEM_LOG_FILTER`: fallback filter directive
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(format) = lookup("IDEM_LOG_FORMAT") {
            config.format = format.parse()?;
        }
        if let Some(filter) = lookup("IDEM_LOG_FILTER").filter(|f| !f.trim().is_empty()) {
            config.default_filter = filter;
        }
        Ok(config)
    }
}

/// Install the global tracing subscriber.
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(config: &TelemetryConfig) -> IdemResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_filter))
        .map_err(|e| ConfigError::Telemetry {
            reason: format!("invalid filter directive: {e}"),
        })?;

    let (json, pretty) = match config.format {
        LogFormat::Json => (Some(tracing_subscriber::fmt::layer().json()), None),
        LogFormat::Pretty => (None, Some(tracing_subscriber::fmt::layer().pretty())),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json)
        .with(pretty)
        .try_init()
        .map_err(|e| ConfigError::Telemetry {
            reason: format!("failed to init subscriber: {e}"),
        })?;

    tracing::info!(format = ?config.format, "Telemetry initialized");
    Ok(())
}
