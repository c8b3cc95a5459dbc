//! Engine configuration.
//!
//! Loaded from TOML (`IdemConfig::from_path`) or from `IDEM_*` environment
//! variables (`IdemConfig::from_env`). Every field has a default, so a
//! partial file or an empty environment yields a working in-memory setup.
//! Always call [`IdemConfig::validate`] before use.

use crate::error::ConfigError;
use crate::policy::ConflictPolicy;
use crate::ttl::Ttl;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Which store backend to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Redis,
    Postgres,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Memory => "memory",
            StoreKind::Redis => "redis",
            StoreKind::Postgres => "postgres",
        }
    }
}

impl FromStr for StoreKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreKind::Memory),
            "redis" => Ok(StoreKind::Redis),
            "postgres" | "postgresql" => Ok(StoreKind::Postgres),
            _ => Err(ConfigError::InvalidValue {
                field: "store".to_string(),
                value: s.to_string(),
                reason: "expected memory, redis or postgres".to_string(),
            }),
        }
    }
}

/// What a caller does when another caller holds the claim on its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InFlightPolicy {
    /// Poll until the winner's result is visible, then apply the own policy.
    #[default]
    Wait,
    /// Fail immediately with an in-flight conflict.
    Reject,
}

impl FromStr for InFlightPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wait" => Ok(InFlightPolicy::Wait),
            "reject" => Ok(InFlightPolicy::Reject),
            _ => Err(ConfigError::InvalidValue {
                field: "claim.in_flight".to_string(),
                value: s.to_string(),
                reason: "expected wait or reject".to_string(),
            }),
        }
    }
}

// ============================================================================
// SECTIONS
// ============================================================================

/// Claim lease and lost-claim behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClaimConfig {
    /// Lifetime of an in-flight marker.
    pub lease_ms: u64,
    /// How long a losing caller waits for the winner's result.
    pub wait_timeout_ms: u64,
    /// Store polling interval while waiting.
    pub poll_interval_ms: u64,
    pub in_flight: InFlightPolicy,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            lease_ms: 30_000,
            wait_timeout_ms: 10_000,
            poll_interval_ms: 25,
            in_flight: InFlightPolicy::Wait,
        }
    }
}

impl ClaimConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// How often a running claim is renewed: a third of the lease.
    pub fn renew_interval(&self) -> Duration {
        (self.lease() / 3).max(Duration::from_millis(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
    pub io_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "idempotency:".to_string(),
            io_timeout_ms: 2_000,
        }
    }
}

impl RedisConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: Option<String>,
    pub max_size: usize,
    pub timeout_ms: u64,
    /// Create the entries table on startup if it is missing.
    pub init_schema: bool,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "idem".to_string(),
            user: "postgres".to_string(),
            password: None,
            max_size: 16,
            timeout_ms: 5_000,
            init_schema: false,
        }
    }
}

impl PostgresConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Background purge of expired entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweeperConfig {
    pub interval_secs: u64,
    /// Upper bound on rows deleted per store call.
    pub batch_size: u32,
    /// Entries are purged only once expired for at least this long.
    pub grace_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            batch_size: 1_000,
            grace_secs: 0,
        }
    }
}

impl SweeperConfig {
    /// Fast sweeps for local development and tests.
    pub fn development() -> Self {
        Self {
            interval_secs: 5,
            batch_size: 100,
            grace_secs: 0,
        }
    }

    /// Conservative sweeps with a grace window for clock skew between nodes.
    pub fn production() -> Self {
        Self {
            interval_secs: 300,
            batch_size: 5_000,
            grace_secs: 60,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

// ============================================================================
// ROOT CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdemConfig {
    pub store: StoreKind,
    /// TTL string; unparsable values fall back to 15 minutes.
    pub default_ttl: String,
    pub default_policy: ConflictPolicy,
    pub claim: ClaimConfig,
    pub redis: RedisConfig,
    pub postgres: PostgresConfig,
    pub sweeper: SweeperConfig,
}

impl Default for IdemConfig {
    fn default() -> Self {
        Self {
            store: StoreKind::Memory,
            default_ttl: "15m".to_string(),
            default_policy: ConflictPolicy::Ignore,
            claim: ClaimConfig::default(),
            redis: RedisConfig::default(),
            postgres: PostgresConfig::default(),
            sweeper: SweeperConfig::default(),
        }
    }
}

impl IdemConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Load {
            reason: e.to_string(),
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Load configuration from `IDEM_*` environment variables.
    ///
    /// Unset variables keep their defaults. A set variable that does not
    /// parse is an error rather than a silent default.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`IdemConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("IDEM_STORE") {
            config.store = v.parse()?;
        }
        if let Some(v) = lookup("IDEM_DEFAULT_TTL") {
            config.default_ttl = v;
        }
        if let Some(v) = lookup("IDEM_DEFAULT_POLICY") {
            config.default_policy = v.parse()?;
        }

        let claim = &mut config.claim;
        parse_var(&lookup, "IDEM_CLAIM_LEASE_MS", &mut claim.lease_ms)?;
        parse_var(&lookup, "IDEM_CLAIM_WAIT_TIMEOUT_MS", &mut claim.wait_timeout_ms)?;
        parse_var(&lookup, "IDEM_CLAIM_POLL_INTERVAL_MS", &mut claim.poll_interval_ms)?;
        if let Some(v) = lookup("IDEM_IN_FLIGHT") {
            claim.in_flight = v.parse()?;
        }

        let redis = &mut config.redis;
        if let Some(v) = lookup("IDEM_REDIS_URL") {
            redis.url = v;
        }
        if let Some(v) = lookup("IDEM_REDIS_KEY_PREFIX") {
            redis.key_prefix = v;
        }
        parse_var(&lookup, "IDEM_REDIS_IO_TIMEOUT_MS", &mut redis.io_timeout_ms)?;

        let pg = &mut config.postgres;
        if let Some(v) = lookup("IDEM_PG_HOST") {
            pg.host = v;
        }
        parse_var(&lookup, "IDEM_PG_PORT", &mut pg.port)?;
        if let Some(v) = lookup("IDEM_PG_DBNAME") {
            pg.dbname = v;
        }
        if let Some(v) = lookup("IDEM_PG_USER") {
            pg.user = v;
        }
        if let Some(v) = lookup("IDEM_PG_PASSWORD") {
            pg.password = Some(v);
        }
        parse_var(&lookup, "IDEM_PG_MAX_SIZE", &mut pg.max_size)?;
        parse_var(&lookup, "IDEM_PG_TIMEOUT_MS", &mut pg.timeout_ms)?;
        parse_var(&lookup, "IDEM_PG_INIT_SCHEMA", &mut pg.init_schema)?;

        let sweeper = &mut config.sweeper;
        parse_var(&lookup, "IDEM_SWEEP_INTERVAL_SECS", &mut sweeper.interval_secs)?;
        parse_var(&lookup, "IDEM_SWEEP_BATCH_SIZE", &mut sweeper.batch_size)?;
        parse_var(&lookup, "IDEM_SWEEP_GRACE_SECS", &mut sweeper.grace_secs)?;

        Ok(config)
    }

    /// The configured default TTL, with the 15 minute fallback applied.
    pub fn default_ttl(&self) -> Ttl {
        Ttl::parse(&self.default_ttl)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.claim.lease_ms == 0 {
            return Err(invalid("claim.lease_ms", "0", "must be > 0"));
        }
        if self.claim.wait_timeout_ms == 0 {
            return Err(invalid("claim.wait_timeout_ms", "0", "must be > 0"));
        }
        if self.claim.poll_interval_ms == 0 {
            return Err(invalid("claim.poll_interval_ms", "0", "must be > 0"));
        }
        if self.claim.wait_timeout_ms >= self.claim.lease_ms {
            return Err(invalid(
                "claim.wait_timeout_ms",
                &self.claim.wait_timeout_ms.to_string(),
                "must be < claim.lease_ms",
            ));
        }
        if self.claim.poll_interval_ms > self.claim.wait_timeout_ms {
            return Err(invalid(
                "claim.poll_interval_ms",
                &self.claim.poll_interval_ms.to_string(),
                "must be <= claim.wait_timeout_ms",
            ));
        }
        if self.sweeper.interval_secs == 0 {
            return Err(invalid("sweeper.interval_secs", "0", "must be > 0"));
        }
        if self.sweeper.batch_size == 0 {
            return Err(invalid("sweeper.batch_size", "0", "must be > 0"));
        }

        match self.store {
            StoreKind::Memory => {}
            StoreKind::Redis => {
                if self.redis.url.trim().is_empty() {
                    return Err(ConfigError::MissingRequired {
                        field: "redis.url".to_string(),
                    });
                }
                if !(self.redis.url.starts_with("redis://")
                    || self.redis.url.starts_with("rediss://"))
                {
                    return Err(invalid(
                        "redis.url",
                        &self.redis.url,
                        "must start with redis:// or rediss://",
                    ));
                }
                if self.redis.key_prefix.is_empty() {
                    return Err(invalid("redis.key_prefix", "", "must not be empty"));
                }
                if self.redis.io_timeout_ms == 0 {
                    return Err(invalid("redis.io_timeout_ms", "0", "must be > 0"));
                }
            }
            StoreKind::Postgres => {
                if self.postgres.host.trim().is_empty() {
                    return Err(ConfigError::MissingRequired {
                        field: "postgres.host".to_string(),
                    });
                }
                if self.postgres.dbname.trim().is_empty() {
                    return Err(ConfigError::MissingRequired {
                        field: "postgres.dbname".to_string(),
                    });
                }
                if self.postgres.port == 0 {
                    return Err(invalid("postgres.port", "0", "must be > 0"));
                }
                if self.postgres.max_size == 0 {
                    return Err(invalid("postgres.max_size", "0", "must be > 0"));
                }
                if self.postgres.timeout_ms == 0 {
                    return Err(invalid("postgres.timeout_ms", "0", "must be > 0"));
                }
            }
        }

        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| invalid(name, &raw, "could not be parsed"))?;
    }
    Ok(())
}
