//! Custom conflict resolution.
//!
//! A `custom:<id>` policy hands the cached and the freshly produced result to
//! the resolver registered under `<id>`. Resolvers are registered once at
//! startup; the registry is immutable afterwards and shared by every clone of
//! the coordinator.

use idem_core::{IdemResult, StoredValue};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Id of the built-in [`WarnAndReplay`] resolver.
pub const WARN_RESOLVER: &str = "warn";

/// Id of the built-in [`PreferFresh`] resolver.
pub const PREFER_FRESH_RESOLVER: &str = "prefer-fresh";

/// What a resolver decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Return the cached result and leave the entry untouched.
    Replay,
    /// Return the fresh result, optionally overwriting the entry with it.
    Fresh { persist: bool },
    /// Return a resolver-built value, optionally overwriting the entry with it.
    Substitute { value: StoredValue, persist: bool },
}

/// Decides the result when a live key produced a second result.
///
/// `cached` and `fresh` may be identical; resolvers that care compare
/// fingerprints themselves.
pub trait ConflictResolver: Send + Sync {
    fn resolve(
        &self,
        key: &str,
        cached: &StoredValue,
        fresh: &StoredValue,
    ) -> IdemResult<Resolution>;
}

impl<F> ConflictResolver for F
where
    F: Fn(&str, &StoredValue, &StoredValue) -> IdemResult<Resolution> + Send + Sync,
{
    fn resolve(
        &self,
        key: &str,
        cached: &StoredValue,
        fresh: &StoredValue,
    ) -> IdemResult<Resolution> {
        self(key, cached, fresh)
    }
}

/// Logs a duplicate-key warning and replays the cached result.
#[derive(Debug, Clone, Copy, Default)]
pub struct WarnAndReplay;

impl ConflictResolver for WarnAndReplay {
    fn resolve(
        &self,
        key: &str,
        cached: &StoredValue,
        fresh: &StoredValue,
    ) -> IdemResult<Resolution> {
        tracing::warn!(
            key = key,
            diverged = cached.fingerprint() != fresh.fingerprint(),
            "duplicate execution for idempotency key, replaying cached result"
        );
        Ok(Resolution::Replay)
    }
}

/// Returns the fresh result and makes it the stored truth.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferFresh;

impl ConflictResolver for PreferFresh {
    fn resolve(
        &self,
        key: &str,
        _cached: &StoredValue,
        _fresh: &StoredValue,
    ) -> IdemResult<Resolution> {
        tracing::debug!(key = key, "replacing cached result with fresh result");
        Ok(Resolution::Fresh { persist: true })
    }
}

/// Resolvers by id.
#[derive(Clone, Default)]
pub struct ResolverRegistry {
    resolvers: HashMap<String, Arc<dyn ConflictResolver>>,
}

impl ResolverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding `warn` and `prefer-fresh`.
    pub fn with_builtins() -> Self {
        Self::new()
            .with(WARN_RESOLVER, WarnAndReplay)
            .with(PREFER_FRESH_RESOLVER, PreferFresh)
    }

    /// Register a resolver, replacing any previous one under the same id.
    pub fn register<R>(&mut self, id: impl Into<String>, resolver: R) -> &mut Self
    where
        R: ConflictResolver + 'static,
    {
        self.resolvers.insert(id.into(), Arc::new(resolver));
        self
    }

    /// Builder form of [`ResolverRegistry::register`].
    pub fn with<R>(mut self, id: impl Into<String>, resolver: R) -> Self
    where
        R: ConflictResolver + 'static,
    {
        self.register(id, resolver);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ConflictResolver>> {
        self.resolvers.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resolvers.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.resolvers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

impl fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}
