//! Stored results and cache entries.

use crate::error::IdemResult;
use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

static JSON_NULL: serde_json::Value = serde_json::Value::Null;

/// A serialized operation result.
///
/// `Null` is the explicit sentinel for operations that produced nothing
/// (`()`, `None`), so a cached "nothing" is never confused with a missing
/// entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StoredValue {
    Value(serde_json::Value),
    Null,
}

impl StoredValue {
    /// Serialize an operation result.
    pub fn encode<T: Serialize>(value: &T) -> IdemResult<Self> {
        match serde_json::to_value(value)? {
            serde_json::Value::Null => Ok(StoredValue::Null),
            other => Ok(StoredValue::Value(other)),
        }
    }

    /// Deserialize back into the operation's result type.
    pub fn decode<T: DeserializeOwned>(&self) -> IdemResult<T> {
        let value = match self {
            StoredValue::Value(v) => v.clone(),
            StoredValue::Null => serde_json::Value::Null,
        };
        Ok(serde_json::from_value(value)?)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, StoredValue::Null)
    }

    /// The JSON form of the result (`null` for the sentinel).
    pub fn as_json(&self) -> &serde_json::Value {
        match self {
            StoredValue::Value(v) => v,
            StoredValue::Null => &JSON_NULL,
        }
    }

    /// SHA-256 hex digest of the canonical JSON encoding.
    ///
    /// Object keys serialize in sorted order, so structurally equal values
    /// share a fingerprint regardless of how they were built.
    pub fn fingerprint(&self) -> String {
        let canonical = self.as_json().to_string();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Absolute expiry for something written at `now` with lifetime `ttl`.
///
/// Saturates at the largest representable instant.
pub fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// One stored result with its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub payload: StoredValue,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(
        key: impl Into<String>,
        payload: StoredValue,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key: key.into(),
            payload,
            created_at: now,
            expires_at: expiry_after(now, ttl),
        }
    }

    /// An entry is live strictly before its expiry instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry, `None` once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.is_expired(now) {
            return None;
        }
        (self.expires_at - now).to_std().ok()
    }
}
