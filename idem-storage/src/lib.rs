//! idem Storage - Store Trait and Backends
//!
//! Defines the [`IdempotencyStore`] capability and its three backends:
//!
//! - [`MemoryStore`]: in-process, volatile, one process only
//! - `RedisStore` (feature `redis`): shared cache with native key expiry
//! - `PostgresStore` (feature `postgres`): durable rows filtered by an expiry
//!   column and purged by a sweeper
//!
//! Every backend treats an entry as absent once its expiry has passed, even
//! if the bytes are still physically present.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres_backend;
#[cfg(feature = "redis")]
pub mod redis_backend;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres_backend::PostgresStore;
#[cfg(feature = "redis")]
pub use redis_backend::RedisStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use idem_core::{IdemConfig, IdemResult, StoreKind, StoredValue, Ttl};
#[cfg(any(feature = "redis", feature = "postgres"))]
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// CLAIMS
// ============================================================================

/// Identifies one caller's in-flight marker.
///
/// Release only removes a marker carrying the same token, so a caller whose
/// lease ran out can never delete a marker placed by the next winner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClaimToken(String);

impl ClaimToken {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ClaimToken {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of an atomic claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller placed the in-flight marker and must run the operation.
    Won(ClaimToken),
    /// Someone else holds the key, either in flight or completed.
    Lost,
}

impl ClaimOutcome {
    pub fn is_won(&self) -> bool {
        matches!(self, ClaimOutcome::Won(_))
    }
}

/// Decode a record read back from a shared backend.
///
/// Bytes that no longer parse surface as [`idem_core::IdemError::Serialization`].
#[cfg(any(feature = "redis", feature = "postgres"))]
pub(crate) fn decode_record<T: DeserializeOwned>(
    backend: &str,
    key: &str,
    raw: &str,
) -> IdemResult<T> {
    serde_json::from_str(raw).map_err(|e| {
        idem_core::IdemError::serialization(format!(
            "{} record for '{}' could not be decoded: {}",
            backend, key, e
        ))
    })
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Key-value store for idempotent results.
///
/// Keys are full scoped keys (`scope:raw`). Reads only ever see completed,
/// non-expired entries; in-flight markers are invisible to `exists` and `get`.
///
/// Implementations must be safe for concurrent use and must bound every
/// backend call by their configured I/O timeout. Errors are never retried
/// internally.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// True iff a completed, non-expired entry exists.
    async fn exists(&self, key: &str) -> IdemResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// The stored result, if a completed, non-expired entry exists.
    async fn get(&self, key: &str) -> IdemResult<Option<StoredValue>>;

    /// Write or overwrite a completed entry expiring `ttl` from now.
    ///
    /// Replaces any in-flight marker for the key.
    async fn save(&self, key: &str, value: &StoredValue, ttl: Ttl) -> IdemResult<()>;

    /// Atomically mark `key` in flight for at most `lease`.
    ///
    /// Wins only when the key holds nothing live: no completed entry and no
    /// unexpired marker.
    async fn claim(&self, key: &str, lease: Duration) -> IdemResult<ClaimOutcome>;

    /// Push this caller's marker expiry out to `lease` from now.
    ///
    /// Returns false when the marker is gone or belongs to someone else.
    async fn renew(&self, key: &str, token: &ClaimToken, lease: Duration) -> IdemResult<bool>;

    /// Replace this caller's marker with a completed entry expiring `ttl`
    /// from now.
    ///
    /// Also writes when the key holds nothing at all. Returns false, leaving
    /// the key untouched, when another caller's marker or a completed entry
    /// is in place.
    async fn complete(
        &self,
        key: &str,
        token: &ClaimToken,
        value: &StoredValue,
        ttl: Ttl,
    ) -> IdemResult<bool>;

    /// Remove this caller's in-flight marker. A no-op if the marker is gone
    /// or belongs to someone else.
    async fn release(&self, key: &str, token: &ClaimToken) -> IdemResult<()>;

    /// Delete entries and markers that expired before `cutoff`.
    ///
    /// Backends with native expiry need no sweeping and keep the default.
    async fn purge_expired_before(&self, _cutoff: DateTime<Utc>) -> IdemResult<u64> {
        Ok(0)
    }

    /// Short backend name for logs and metrics.
    fn backend_name(&self) -> &'static str;
}

#[async_trait]
impl<S: IdempotencyStore + ?Sized> IdempotencyStore for Arc<S> {
    async fn exists(&self, key: &str) -> IdemResult<bool> {
        (**self).exists(key).await
    }

    async fn get(&self, key: &str) -> IdemResult<Option<StoredValue>> {
        (**self).get(key).await
    }

    async fn save(&self, key: &str, value: &StoredValue, ttl: Ttl) -> IdemResult<()> {
        (**self).save(key, value, ttl).await
    }

    async fn claim(&self, key: &str, lease: Duration) -> IdemResult<ClaimOutcome> {
        (**self).claim(key, lease).await
    }

    async fn renew(&self, key: &str, token: &ClaimToken, lease: Duration) -> IdemResult<bool> {
        (**self).renew(key, token, lease).await
    }

    async fn complete(
        &self,
        key: &str,
        token: &ClaimToken,
        value: &StoredValue,
        ttl: Ttl,
    ) -> IdemResult<bool> {
        (**self).complete(key, token, value, ttl).await
    }

    async fn release(&self, key: &str, token: &ClaimToken) -> IdemResult<()> {
        (**self).release(key, token).await
    }

    async fn purge_expired_before(&self, cutoff: DateTime<Utc>) -> IdemResult<u64> {
        (**self).purge_expired_before(cutoff).await
    }

    fn backend_name(&self) -> &'static str {
        (**self).backend_name()
    }
}

// ============================================================================
// BOOTSTRAP
// ============================================================================

/// Build the store selected by `config.store`.
///
/// The PostgreSQL backend creates its table first when
/// `postgres.init_schema` is set.
pub async fn connect(config: &IdemConfig) -> IdemResult<Arc<dyn IdempotencyStore>> {
    config.validate()?;

    match config.store {
        StoreKind::Memory => {
            tracing::info!(backend = "memory", "idempotency store ready");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreKind::Redis => connect_redis(config).await,
        StoreKind::Postgres => connect_postgres(config).await,
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(config: &IdemConfig) -> IdemResult<Arc<dyn IdempotencyStore>> {
    let store = RedisStore::from_config(&config.redis).await?;
    tracing::info!(backend = "redis", "idempotency store ready");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_config: &IdemConfig) -> IdemResult<Arc<dyn IdempotencyStore>> {
    Err(idem_core::ConfigError::BackendNotCompiled {
        backend: "redis".to_string(),
    }
    .into())
}

#[cfg(feature = "postgres")]
async fn connect_postgres(config: &IdemConfig) -> IdemResult<Arc<dyn IdempotencyStore>> {
    let store = PostgresStore::from_config(&config.postgres, config.sweeper.batch_size)?;
    if config.postgres.init_schema {
        store.ensure_schema().await?;
    }
    tracing::info!(backend = "postgres", "idempotency store ready");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn connect_postgres(_config: &IdemConfig) -> IdemResult<Arc<dyn IdempotencyStore>> {
    Err(idem_core::ConfigError::BackendNotCompiled {
        backend: "postgres".to_string(),
    }
    .into())
}
