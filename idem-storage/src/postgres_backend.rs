//! PostgreSQL store.
//!
//! Rows live in `idempotency_entries`. PostgreSQL has no native row expiry,
//! so every read filters on `ttl_expiry > now` and expired rows are removed
//! later by `purge_expired_before`. The application clock supplies `now` for
//! both writes and reads, keeping expiry consistent with the other backends.
//!
//! Claims insert a `pending` row inside a transaction after clearing any
//! expired row for the key. The primary key makes the insert the arbiter: a
//! unique violation means another caller holds the key.

use crate::{decode_record, ClaimOutcome, ClaimToken, IdempotencyStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use idem_core::{expiry_after, IdemError, IdemResult, PostgresConfig, StoreError, StoredValue, Ttl};
use std::future::Future;
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::NoTls;

const BACKEND: &str = "postgres";

/// DDL for the entries table, safe to run repeatedly.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_entries (
    key         TEXT PRIMARY KEY,
    payload     TEXT NOT NULL,
    state       TEXT NOT NULL DEFAULT 'complete'
                CHECK (state IN ('pending', 'complete')),
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    ttl_expiry  TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_idempotency_entries_ttl_expiry
    ON idempotency_entries (ttl_expiry);
"#;

const SELECT_LIVE: &str = "SELECT payload FROM idempotency_entries \
     WHERE key = $1 AND state = 'complete' AND ttl_expiry > $2";

const EXISTS_LIVE: &str = "SELECT EXISTS (SELECT 1 FROM idempotency_entries \
     WHERE key = $1 AND state = 'complete' AND ttl_expiry > $2)";

// created_at is kept for the life of an entry and reset only when the row it
// replaces had already expired.
const UPSERT_COMPLETE: &str = "INSERT INTO idempotency_entries \
     (key, payload, state, created_at, ttl_expiry) VALUES ($1, $2, 'complete', $3, $4) \
     ON CONFLICT (key) DO UPDATE SET \
         payload = EXCLUDED.payload, \
         state = 'complete', \
         created_at = CASE WHEN idempotency_entries.ttl_expiry IS NULL \
                             OR idempotency_entries.ttl_expiry <= EXCLUDED.created_at \
                           THEN EXCLUDED.created_at \
                           ELSE idempotency_entries.created_at END, \
         ttl_expiry = EXCLUDED.ttl_expiry";

const DELETE_EXPIRED_KEY: &str =
    "DELETE FROM idempotency_entries WHERE key = $1 AND ttl_expiry <= $2";

const INSERT_PENDING: &str = "INSERT INTO idempotency_entries \
     (key, payload, state, created_at, ttl_expiry) VALUES ($1, $2, 'pending', $3, $4)";

const DELETE_PENDING: &str = "DELETE FROM idempotency_entries \
     WHERE key = $1 AND state = 'pending' AND payload = $2";

const RENEW_PENDING: &str = "UPDATE idempotency_entries SET ttl_expiry = $3 \
     WHERE key = $1 AND state = 'pending' AND payload = $2";

// Writes over this caller's marker or into an empty key, never over anything
// else.
const COMPLETE_PENDING: &str = "INSERT INTO idempotency_entries \
     (key, payload, state, created_at, ttl_expiry) VALUES ($1, $2, 'complete', $3, $4) \
     ON CONFLICT (key) DO UPDATE SET \
         payload = EXCLUDED.payload, \
         state = 'complete', \
         created_at = EXCLUDED.created_at, \
         ttl_expiry = EXCLUDED.ttl_expiry \
     WHERE idempotency_entries.state = 'pending' AND idempotency_entries.payload = $5";

const PURGE_BATCH: &str = "DELETE FROM idempotency_entries WHERE key IN \
     (SELECT key FROM idempotency_entries WHERE ttl_expiry < $1 LIMIT $2)";

/// Durable store backed by a deadpool-postgres connection pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: Pool,
    io_timeout: Duration,
    purge_batch_size: u32,
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool_size", &self.pool.status().size)
            .field("io_timeout", &self.io_timeout)
            .field("purge_batch_size", &self.purge_batch_size)
            .finish()
    }
}

impl PostgresStore {
    /// Wrap an existing pool.
    pub fn new(pool: Pool, io_timeout: Duration) -> Self {
        Self {
            pool,
            io_timeout,
            purge_batch_size: 1_000,
        }
    }

    /// Build a pool from the `[postgres]` configuration section.
    pub fn from_config(config: &PostgresConfig, purge_batch_size: u32) -> IdemResult<Self> {
        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.dbname = Some(config.dbname.clone());
        cfg.user = Some(config.user.clone());
        cfg.password = config.password.clone();

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool_cfg = PoolConfig::new(config.max_size);
        pool_cfg.timeouts.wait = Some(config.timeout());
        pool_cfg.timeouts.create = Some(config.timeout());
        cfg.pool = Some(pool_cfg);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Unavailable {
                backend: BACKEND,
                reason: format!("Failed to create pool: {}", e),
            })?;

        Ok(Self::new(pool, config.timeout()).with_purge_batch_size(purge_batch_size))
    }

    pub fn with_purge_batch_size(mut self, batch: u32) -> Self {
        self.purge_batch_size = batch.max(1);
        self
    }

    /// Current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    /// Create the entries table and its expiry index if missing.
    pub async fn ensure_schema(&self) -> IdemResult<()> {
        self.bounded(async {
            let client = self.conn().await?;
            client
                .batch_execute(SCHEMA)
                .await
                .map_err(|e| db_error("schema init", e))
        })
        .await?;
        tracing::info!(backend = BACKEND, "idempotency schema ensured");
        Ok(())
    }

    async fn conn(&self) -> IdemResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(|e| {
            tracing::warn!(error = ?e, backend = BACKEND, "connection pool error");
            StoreError::Unavailable {
                backend: BACKEND,
                reason: format!("Failed to acquire connection: {}", e),
            }
            .into()
        })
    }

    async fn bounded<T, F>(&self, fut: F) -> IdemResult<T>
    where
        F: Future<Output = IdemResult<T>>,
    {
        tokio::time::timeout(self.io_timeout, fut)
            .await
            .map_err(|_| {
                IdemError::from(StoreError::TimedOut {
                    backend: BACKEND,
                    after: self.io_timeout,
                })
            })?
    }

    async fn purge_one_batch(&self, cutoff: DateTime<Utc>) -> IdemResult<u64> {
        let limit = i64::from(self.purge_batch_size);
        self.bounded(async {
            let client = self.conn().await?;
            client
                .execute(PURGE_BATCH, &[&cutoff, &limit])
                .await
                .map_err(|e| db_error("purge", e))
        })
        .await
    }
}

fn db_error(context: &str, e: tokio_postgres::Error) -> IdemError {
    tracing::warn!(error = ?e, backend = BACKEND, "database error during {}", context);
    StoreError::Unavailable {
        backend: BACKEND,
        reason: format!("{} failed: {}", context, e),
    }
    .into()
}

fn is_unique_violation(e: &tokio_postgres::Error) -> bool {
    e.as_db_error()
        .map(|db| db.code() == &SqlState::UNIQUE_VIOLATION)
        .unwrap_or(false)
}

#[async_trait]
impl IdempotencyStore for PostgresStore {
    async fn exists(&self, key: &str) -> IdemResult<bool> {
        let now = Utc::now();
        self.bounded(async {
            let client = self.conn().await?;
            let row = client
                .query_one(EXISTS_LIVE, &[&key, &now])
                .await
                .map_err(|e| db_error("exists", e))?;
            Ok(row.get::<_, bool>(0))
        })
        .await
    }

    async fn get(&self, key: &str) -> IdemResult<Option<StoredValue>> {
        let now = Utc::now();
        let payload: Option<String> = self
            .bounded(async {
                let client = self.conn().await?;
                let row = client
                    .query_opt(SELECT_LIVE, &[&key, &now])
                    .await
                    .map_err(|e| db_error("get", e))?;
                Ok(row.map(|r| r.get::<_, String>(0)))
            })
            .await?;

        match payload {
            None => {
                tracing::debug!(key = key, backend = BACKEND, "cache MISS");
                Ok(None)
            }
            Some(raw) => {
                tracing::debug!(key = key, backend = BACKEND, "cache HIT");
                decode_record(BACKEND, key, &raw).map(Some)
            }
        }
    }

    async fn save(&self, key: &str, value: &StoredValue, ttl: Ttl) -> IdemResult<()> {
        let body = serde_json::to_string(value).map_err(IdemError::serialization)?;
        let now = Utc::now();
        let expiry = expiry_after(now, ttl.as_duration());

        self.bounded(async {
            let client = self.conn().await?;
            client
                .execute(UPSERT_COMPLETE, &[&key, &body, &now, &expiry])
                .await
                .map_err(|e| db_error("save", e))
        })
        .await?;

        tracing::debug!(key = key, ttl_expiry = %expiry, backend = BACKEND, "cache SET");
        Ok(())
    }

    async fn claim(&self, key: &str, lease: Duration) -> IdemResult<ClaimOutcome> {
        let token = ClaimToken::generate();
        let now = Utc::now();
        let lease_expiry = expiry_after(now, lease);

        let won = self
            .bounded(async {
                let mut client = self.conn().await?;
                let tx = client
                    .transaction()
                    .await
                    .map_err(|e| db_error("claim begin", e))?;

                tx.execute(DELETE_EXPIRED_KEY, &[&key, &now])
                    .await
                    .map_err(|e| db_error("claim reclaim", e))?;

                match tx
                    .execute(INSERT_PENDING, &[&key, &token.as_str(), &now, &lease_expiry])
                    .await
                {
                    Ok(_) => {
                        tx.commit().await.map_err(|e| db_error("claim commit", e))?;
                        Ok(true)
                    }
                    // Dropping the transaction rolls it back.
                    Err(e) if is_unique_violation(&e) => Ok(false),
                    Err(e) => Err(db_error("claim insert", e)),
                }
            })
            .await?;

        if won {
            tracing::debug!(key = key, backend = BACKEND, "claim won");
            Ok(ClaimOutcome::Won(token))
        } else {
            tracing::debug!(key = key, backend = BACKEND, "claim lost");
            Ok(ClaimOutcome::Lost)
        }
    }

    async fn renew(&self, key: &str, token: &ClaimToken, lease: Duration) -> IdemResult<bool> {
        let lease_expiry = expiry_after(Utc::now(), lease);
        let updated = self
            .bounded(async {
                let client = self.conn().await?;
                client
                    .execute(RENEW_PENDING, &[&key, &token.as_str(), &lease_expiry])
                    .await
                    .map_err(|e| db_error("renew", e))
            })
            .await?;

        tracing::debug!(key = key, renewed = updated > 0, backend = BACKEND, "claim renew");
        Ok(updated > 0)
    }

    async fn complete(
        &self,
        key: &str,
        token: &ClaimToken,
        value: &StoredValue,
        ttl: Ttl,
    ) -> IdemResult<bool> {
        let body = serde_json::to_string(value).map_err(IdemError::serialization)?;
        let now = Utc::now();
        let expiry = expiry_after(now, ttl.as_duration());

        let written = self
            .bounded(async {
                let client = self.conn().await?;
                client
                    .execute(
                        COMPLETE_PENDING,
                        &[&key, &body, &now, &expiry, &token.as_str()],
                    )
                    .await
                    .map_err(|e| db_error("complete", e))
            })
            .await?;

        tracing::debug!(key = key, stored = written > 0, backend = BACKEND, "claim complete");
        Ok(written > 0)
    }

    async fn release(&self, key: &str, token: &ClaimToken) -> IdemResult<()> {
        let deleted = self
            .bounded(async {
                let client = self.conn().await?;
                client
                    .execute(DELETE_PENDING, &[&key, &token.as_str()])
                    .await
                    .map_err(|e| db_error("release", e))
            })
            .await?;

        tracing::debug!(key = key, released = deleted > 0, backend = BACKEND, "claim release");
        Ok(())
    }

    /// Deletes in batches of `purge_batch_size` until a batch comes back short.
    async fn purge_expired_before(&self, cutoff: DateTime<Utc>) -> IdemResult<u64> {
        let mut total = 0u64;
        loop {
            let deleted = self.purge_one_batch(cutoff).await?;
            total += deleted;
            if deleted < u64::from(self.purge_batch_size) {
                break;
            }
        }
        Ok(total)
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_matches_queries() {
        for column in ["key", "payload", "state", "created_at", "ttl_expiry"] {
            assert!(SCHEMA.contains(column), "schema missing {column}");
        }
        assert!(SCHEMA.contains("IF NOT EXISTS"));
        assert!(SCHEMA.contains("idx_idempotency_entries_ttl_expiry"));
    }

    #[test]
    fn test_reads_filter_on_expiry() {
        assert!(SELECT_LIVE.contains("ttl_expiry > $2"));
        assert!(EXISTS_LIVE.contains("ttl_expiry > $2"));
        assert!(SELECT_LIVE.contains("state = 'complete'"));
    }

    #[test]
    fn test_marker_writes_are_token_checked() {
        assert!(RENEW_PENDING.contains("state = 'pending' AND payload = $2"));
        assert!(COMPLETE_PENDING.contains("idempotency_entries.payload = $5"));
        assert!(DELETE_PENDING.contains("payload = $2"));
    }

    #[test]
    fn test_from_config_builds_lazily() {
        // Pool creation does not connect; failures surface on first use.
        let store = PostgresStore::from_config(&PostgresConfig::default(), 0).unwrap();
        assert_eq!(store.purge_batch_size, 1);
        assert_eq!(store.backend_name(), "postgres");
    }

    // Integration tests require a running PostgreSQL instance (behind db-tests feature)
    #[cfg(feature = "db-tests")]
    mod integration {
        use super::*;
        use serde_json::json;

        async fn store() -> Option<PostgresStore> {
            let config = idem_core::IdemConfig::from_env().ok()?.postgres;
            let store = PostgresStore::from_config(&config, 100).ok()?;
            match store.ensure_schema().await {
                Ok(()) => Some(store),
                Err(e) => {
                    eprintln!("skipping PostgreSQL integration test: {e}");
                    None
                }
            }
        }

        fn unique_key(name: &str) -> String {
            format!("test-{}:{}", uuid::Uuid::now_v7(), name)
        }

        #[tokio::test]
        async fn test_roundtrip_and_expiry_filter() {
            let Some(store) = store().await else { return };
            let key = unique_key("order-123");
            let value = StoredValue::Value(json!({"status": "paid"}));

            store.save(&key, &value, Ttl::from_millis(200).unwrap()).await.unwrap();
            assert!(store.exists(&key).await.unwrap());
            assert_eq!(store.get(&key).await.unwrap(), Some(value));

            tokio::time::sleep(Duration::from_millis(300)).await;
            assert!(!store.exists(&key).await.unwrap());
            assert_eq!(store.get(&key).await.unwrap(), None);
        }

        #[tokio::test]
        async fn test_claim_conflict_and_release() {
            let Some(store) = store().await else { return };
            let key = unique_key("claim");
            let lease = Duration::from_secs(30);

            let token = match store.claim(&key, lease).await.unwrap() {
                ClaimOutcome::Won(token) => token,
                ClaimOutcome::Lost => panic!("first claim must win"),
            };
            assert_eq!(store.claim(&key, lease).await.unwrap(), ClaimOutcome::Lost);
            assert!(!store.exists(&key).await.unwrap());

            store.release(&key, &token).await.unwrap();
            assert!(store.claim(&key, lease).await.unwrap().is_won());
        }

        #[tokio::test]
        async fn test_complete_requires_own_marker() {
            let Some(store) = store().await else { return };
            let key = unique_key("complete");
            let lease = Duration::from_secs(30);
            let token = match store.claim(&key, lease).await.unwrap() {
                ClaimOutcome::Won(token) => token,
                ClaimOutcome::Lost => panic!("first claim must win"),
            };
            let stranger = ClaimToken::generate();
            let ttl = Ttl::from_secs(60).unwrap();
            let value = StoredValue::Value(json!(7));

            assert!(store.renew(&key, &token, lease).await.unwrap());
            assert!(!store.renew(&key, &stranger, lease).await.unwrap());
            assert!(!store.complete(&key, &stranger, &value, ttl).await.unwrap());
            assert!(store.complete(&key, &token, &value, ttl).await.unwrap());
            assert_eq!(store.get(&key).await.unwrap(), Some(value));
        }

        #[tokio::test]
        async fn test_expired_row_reclaimed_and_purged() {
            let Some(store) = store().await else { return };
            let key = unique_key("expired");
            store.save(&key, &StoredValue::Null, Ttl::from_millis(50).unwrap()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;

            assert!(store.purge_expired_before(Utc::now()).await.unwrap() >= 1);
            assert!(store.claim(&key, Duration::from_secs(30)).await.unwrap().is_won());
        }
    }
}
