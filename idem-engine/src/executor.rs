//! Call-site convenience wrapper.
//!
//! `IdempotentExecutor` binds a coordinator to a scope, a default policy and
//! a default TTL, so a call site only supplies a raw key and an operation:
//!
//! ```ignore
//! let executor = IdempotentExecutor::new(coordinator);
//! let receipt = executor
//!     .execute("order-123", Ttl::parse("10m"), || charge_card(&order))
//!     .await?;
//! ```

use crate::coordinator::{Execution, ExecutionCoordinator};
use idem_core::{
    BoxError, ConflictPolicy, ExecutionRequest, IdemConfig, IdemResult, IdempotencyKey, Scope,
    ScopeResolver, Ttl,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;

/// A coordinator bound to a scope and defaults.
#[derive(Debug, Clone)]
pub struct IdempotentExecutor {
    coordinator: ExecutionCoordinator,
    scope: Scope,
    policy: ConflictPolicy,
    default_ttl: Ttl,
}

impl IdempotentExecutor {
    /// Global scope, [`ConflictPolicy::Ignore`], 15 minute TTL.
    pub fn new(coordinator: ExecutionCoordinator) -> Self {
        Self {
            coordinator,
            scope: Scope::global(),
            policy: ConflictPolicy::Ignore,
            default_ttl: Ttl::default(),
        }
    }

    /// Defaults taken from `default_policy` and `default_ttl` in `config`.
    pub fn from_config(coordinator: ExecutionCoordinator, config: &IdemConfig) -> Self {
        Self::new(coordinator)
            .with_policy(config.default_policy.clone())
            .with_default_ttl(config.default_ttl())
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Ttl) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// A copy scoped by `resolver` for one call context.
    pub fn scoped_for<C, R>(&self, resolver: &R, call: &C) -> Self
    where
        C: ?Sized,
        R: ScopeResolver<C> + ?Sized,
    {
        self.clone().with_scope(resolver.resolve_scope(call))
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn default_ttl(&self) -> Ttl {
        self.default_ttl
    }

    pub fn coordinator(&self) -> &ExecutionCoordinator {
        &self.coordinator
    }

    /// Build the request this executor would send for `raw_key`.
    pub fn request(&self, raw_key: &str, ttl: Ttl) -> IdemResult<ExecutionRequest> {
        let key = IdempotencyKey::new(self.scope.clone(), raw_key)?;
        Ok(ExecutionRequest::new(key)
            .with_ttl(ttl)
            .with_policy(self.policy.clone()))
    }

    pub async fn execute<T, F, Fut, E>(&self, raw_key: &str, ttl: Ttl, operation: F) -> IdemResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let request = self.request(raw_key, ttl)?;
        self.coordinator.execute(request, operation).await
    }

    /// [`IdempotentExecutor::execute`] with the executor's default TTL.
    pub async fn execute_default<T, F, Fut, E>(&self, raw_key: &str, operation: F) -> IdemResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.execute(raw_key, self.default_ttl, operation).await
    }

    pub async fn execute_with_outcome<T, F, Fut, E>(
        &self,
        raw_key: &str,
        ttl: Ttl,
        operation: F,
    ) -> IdemResult<Execution<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let request = self.request(raw_key, ttl)?;
        self.coordinator.execute_with_outcome(request, operation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idem_core::{FixedScope, IdemError};
    use idem_storage::{IdempotencyStore, MemoryStore};
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::time::Duration;

    fn executor() -> IdempotentExecutor {
        IdempotentExecutor::new(ExecutionCoordinator::new(Arc::new(MemoryStore::new())))
    }

    #[tokio::test]
    async fn test_global_scope_by_default() {
        let exec = executor();
        let value = exec
            .execute_default("order-123", || async { Ok::<_, Infallible>(42u32) })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert!(exec
            .coordinator()
            .store()
            .exists("GLOBAL:order-123")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_blank_key_never_runs() {
        let exec = executor();
        let err = exec
            .execute_default("  ", || async {
                panic!("operation must not run for a blank key");
                #[allow(unreachable_code)]
                Ok::<u8, Infallible>(0)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IdemError::KeyResolution { .. }));
    }

    #[tokio::test]
    async fn test_scoped_for_uses_resolver() {
        let exec = executor().scoped_for(&FixedScope::new("tenantA"), &());
        assert_eq!(exec.scope().as_str(), "tenantA");

        exec.execute("k", Ttl::from_secs(60).unwrap(), || async {
            Ok::<_, Infallible>(())
        })
        .await
        .unwrap();
        let store = exec.coordinator().store();
        assert!(store.exists("tenantA:k").await.unwrap());
        assert!(!store.exists("GLOBAL:k").await.unwrap());
    }

    #[test]
    fn test_from_config_defaults() {
        let config = IdemConfig {
            default_ttl: "2h".to_string(),
            default_policy: ConflictPolicy::Reject,
            ..IdemConfig::default()
        };
        let exec = IdempotentExecutor::from_config(
            ExecutionCoordinator::new(Arc::new(MemoryStore::new())),
            &config,
        );
        let request = exec.request("k", exec.default_ttl()).unwrap();
        assert_eq!(request.policy, ConflictPolicy::Reject);
        assert_eq!(request.ttl.as_duration(), Duration::from_secs(7200));
    }
}
