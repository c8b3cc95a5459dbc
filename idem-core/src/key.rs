//! Scoped idempotency keys.
//!
//! A full key is `scope + ":" + raw`. Two calls with the same raw key in
//! different scopes never share an entry.

use crate::error::{IdemError, IdemResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scope used when nothing more specific is resolved.
pub const GLOBAL_SCOPE: &str = "GLOBAL";

/// Separator between scope and raw key.
const SEPARATOR: char = ':';

/// Namespace isolating keys of distinct operations or tenants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(String);

impl Scope {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn global() -> Self {
        Self(GLOBAL_SCOPE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::global()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Scope {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A resolved, non-blank idempotency key bound to a scope.
///
/// Constructed only through [`IdempotencyKey::new`], which rejects blank raw
/// keys, so every key reaching a store has a non-empty raw part.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    scope: Scope,
    raw: String,
    full: String,
}

impl IdempotencyKey {
    /// Bind a raw key to a scope.
    ///
    /// Fails with [`IdemError::KeyResolution`] when the raw key is empty or
    /// only whitespace.
    pub fn new(scope: Scope, raw: impl Into<String>) -> IdemResult<Self> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(IdemError::KeyResolution {
                reason: "idempotency key is missing or blank".to_string(),
            });
        }
        let full = format!("{}{}{}", scope.as_str(), SEPARATOR, raw);
        Ok(Self { scope, raw, full })
    }

    /// Bind a raw key to the global scope.
    pub fn global(raw: impl Into<String>) -> IdemResult<Self> {
        Self::new(Scope::global(), raw)
    }

    /// Resolve an optional raw key, as handed over by a key-extraction layer.
    pub fn resolve(scope: Scope, raw: Option<&str>) -> IdemResult<Self> {
        match raw {
            Some(raw) => Self::new(scope, raw),
            None => Err(IdemError::KeyResolution {
                reason: "no idempotency key supplied".to_string(),
            }),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The store key, `scope:raw`.
    pub fn full(&self) -> &str {
        &self.full
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

// ============================================================================
// SCOPE RESOLUTION
// ============================================================================

/// Derives the scope for a call.
///
/// `C` is whatever call context the interception layer has at hand
/// (request headers, a tenant handle). Resolvers that ignore it work for any
/// context.
pub trait ScopeResolver<C: ?Sized = ()>: Send + Sync {
    fn resolve_scope(&self, call: &C) -> Scope;
}

/// Every call lands in [`GLOBAL_SCOPE`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalScope;

impl<C: ?Sized> ScopeResolver<C> for GlobalScope {
    fn resolve_scope(&self, _call: &C) -> Scope {
        Scope::global()
    }
}

/// Every call lands in one configured scope.
#[derive(Debug, Clone)]
pub struct FixedScope(Scope);

impl FixedScope {
    pub fn new(scope: impl Into<Scope>) -> Self {
        Self(scope.into())
    }
}

impl<C: ?Sized> ScopeResolver<C> for FixedScope {
    fn resolve_scope(&self, _call: &C) -> Scope {
        self.0.clone()
    }
}
