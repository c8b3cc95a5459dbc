//! In-process store backed by a concurrent hash map.
//!
//! Expiry is checked lazily: a read that finds an expired entry treats it as
//! absent and removes it. `purge_expired_before` sweeps everything else.
//! State is not shared between processes.

use crate::{ClaimOutcome, ClaimToken, IdempotencyStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use idem_core::{expiry_after, CacheEntry, IdemResult, StoredValue, Ttl};
use std::time::Duration;

const BACKEND: &str = "memory";

#[derive(Debug, Clone)]
enum Slot {
    Pending {
        token: ClaimToken,
        expires_at: DateTime<Utc>,
    },
    Ready(CacheEntry),
}

impl Slot {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self {
            Slot::Pending { expires_at, .. } => now >= *expires_at,
            Slot::Ready(entry) => entry.is_expired(now),
        }
    }

    fn expired_before(&self, cutoff: DateTime<Utc>) -> bool {
        match self {
            Slot::Pending { expires_at, .. } => *expires_at < cutoff,
            Slot::Ready(entry) => entry.expires_at < cutoff,
        }
    }
}

enum Lookup {
    Live(StoredValue),
    Expired,
    Absent,
}

/// Volatile store for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots held, including expired entries not yet purged and
    /// in-flight markers.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The full entry for `key` if it is completed and live.
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        let now = Utc::now();
        match self.slots.get(key).as_deref() {
            Some(Slot::Ready(entry)) if !entry.is_expired(now) => Some(entry.clone()),
            _ => None,
        }
    }

    fn lookup(&self, key: &str, now: DateTime<Utc>) -> Lookup {
        match self.slots.get(key).as_deref() {
            None | Some(Slot::Pending { .. }) => Lookup::Absent,
            Some(Slot::Ready(entry)) if entry.is_expired(now) => Lookup::Expired,
            Some(Slot::Ready(entry)) => Lookup::Live(entry.payload.clone()),
        }
    }
}

#[async_trait]
impl IdempotencyStore for MemoryStore {
    async fn get(&self, key: &str) -> IdemResult<Option<StoredValue>> {
        let now = Utc::now();
        match self.lookup(key, now) {
            Lookup::Live(payload) => Ok(Some(payload)),
            Lookup::Absent => Ok(None),
            Lookup::Expired => {
                // The read guard is gone; re-check under the write lock.
                self.slots
                    .remove_if(key, |_, slot| matches!(slot, Slot::Ready(_)) && slot.is_expired(now));
                tracing::debug!(key = key, backend = BACKEND, "evicted expired entry on read");
                Ok(None)
            }
        }
    }

    async fn save(&self, key: &str, value: &StoredValue, ttl: Ttl) -> IdemResult<()> {
        let entry = CacheEntry::new(key, value.clone(), ttl.as_duration(), Utc::now());
        self.slots.insert(key.to_string(), Slot::Ready(entry));
        Ok(())
    }

    async fn claim(&self, key: &str, lease: Duration) -> IdemResult<ClaimOutcome> {
        let now = Utc::now();
        let token = ClaimToken::generate();
        let pending = Slot::Pending {
            token: token.clone(),
            expires_at: expiry_after(now, lease),
        };

        match self.slots.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(pending);
                Ok(ClaimOutcome::Won(token))
            }
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(pending);
                    Ok(ClaimOutcome::Won(token))
                } else {
                    Ok(ClaimOutcome::Lost)
                }
            }
        }
    }

    async fn renew(&self, key: &str, token: &ClaimToken, lease: Duration) -> IdemResult<bool> {
        match self.slots.get_mut(key).as_deref_mut() {
            Some(Slot::Pending {
                token: held,
                expires_at,
            }) if held == token => {
                *expires_at = expiry_after(Utc::now(), lease);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        key: &str,
        token: &ClaimToken,
        value: &StoredValue,
        ttl: Ttl,
    ) -> IdemResult<bool> {
        let ready = Slot::Ready(CacheEntry::new(key, value.clone(), ttl.as_duration(), Utc::now()));
        match self.slots.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(ready);
                Ok(true)
            }
            Entry::Occupied(mut occupied) => {
                let ours =
                    matches!(occupied.get(), Slot::Pending { token: held, .. } if held == token);
                if ours {
                    occupied.insert(ready);
                }
                Ok(ours)
            }
        }
    }

    async fn release(&self, key: &str, token: &ClaimToken) -> IdemResult<()> {
        self.slots.remove_if(key, |_, slot| {
            matches!(slot, Slot::Pending { token: held, .. } if held == token)
        });
        Ok(())
    }

    async fn purge_expired_before(&self, cutoff: DateTime<Utc>) -> IdemResult<u64> {
        let mut purged = 0u64;
        self.slots.retain(|_, slot| {
            if slot.expired_before(cutoff) {
                purged += 1;
                false
            } else {
                true
            }
        });
        Ok(purged)
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }
}
