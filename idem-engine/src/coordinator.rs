//! Execution coordinator.
//!
//! Given a request and an operation, the coordinator decides whether to run
//! the operation or answer from the store:
//!
//! 1. A live entry exists: apply the request's [`ConflictPolicy`].
//! 2. No live entry: atomically claim the key. The winner runs the operation
//!    while renewing its lease, then stores the result in place of its own
//!    marker; errors release the claim and are never cached.
//! 3. The claim was lost: wait for the winner's result and continue at (1),
//!    or fail with `InFlight`, per `claim.in_flight`.
//!
//! The coordinator holds no per-key state. All shared mutable state lives in
//! the store, so clones (or coordinators in other processes sharing a
//! distributed store) cooperate through claims.

use crate::metrics::CoordinatorMetrics;
use crate::resolver::{ConflictResolver, Resolution, ResolverRegistry};
use idem_core::{
    BoxError, ClaimConfig, ConfigError, ConflictPolicy, ExecutionRequest, IdemConfig, IdemError,
    IdemResult, IdempotencyKey, InFlightPolicy, StoredValue, Ttl,
};
use idem_storage::{ClaimOutcome, ClaimToken, IdempotencyStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;

/// How a call was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation ran on an unseen key and its result was saved.
    Executed,
    /// The cached result was returned.
    Replayed,
    /// A custom resolver decided the result.
    Resolved,
}

impl Outcome {
    /// True when the caller should mark the response as a replay.
    pub fn is_replay(&self) -> bool {
        !matches!(self, Outcome::Executed)
    }
}

/// A result together with how it was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution<T> {
    pub value: T,
    pub outcome: Outcome,
}

enum Waited {
    Completed(StoredValue),
    Claimed(ClaimToken),
}

/// Orchestrates idempotent execution against a store.
///
/// Cheap to clone; clones share the store, resolvers and metrics.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    store: Arc<dyn IdempotencyStore>,
    resolvers: Arc<ResolverRegistry>,
    claim: ClaimConfig,
    metrics: Arc<CoordinatorMetrics>,
}

impl std::fmt::Debug for ExecutionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCoordinator")
            .field("store", &self.store.backend_name())
            .field("resolvers", &self.resolvers)
            .field("claim", &self.claim)
            .finish()
    }
}

impl ExecutionCoordinator {
    /// Coordinator with the built-in resolvers and default claim settings.
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            store,
            resolvers: Arc::new(ResolverRegistry::with_builtins()),
            claim: ClaimConfig::default(),
            metrics: Arc::new(CoordinatorMetrics::new()),
        }
    }

    /// Coordinator using the `[claim]` section of `config`.
    pub fn from_config(store: Arc<dyn IdempotencyStore>, config: &IdemConfig) -> Self {
        Self::new(store).with_claim_config(config.claim.clone())
    }

    pub fn with_resolvers(mut self, resolvers: ResolverRegistry) -> Self {
        self.resolvers = Arc::new(resolvers);
        self
    }

    pub fn with_claim_config(mut self, claim: ClaimConfig) -> Self {
        self.claim = claim;
        self
    }

    pub fn store(&self) -> &Arc<dyn IdempotencyStore> {
        &self.store
    }

    pub fn resolvers(&self) -> &ResolverRegistry {
        &self.resolvers
    }

    pub fn claim_config(&self) -> &ClaimConfig {
        &self.claim
    }

    pub fn metrics(&self) -> &Arc<CoordinatorMetrics> {
        &self.metrics
    }

    /// Run `operation` at most once per live key and return its result.
    pub async fn execute<T, F, Fut, E>(&self, request: ExecutionRequest, operation: F) -> IdemResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.execute_with_outcome(request, operation)
            .await
            .map(|execution| execution.value)
    }

    /// Like [`ExecutionCoordinator::execute`], also reporting how the result
    /// was obtained.
    pub async fn execute_with_outcome<T, F, Fut, E>(
        &self,
        request: ExecutionRequest,
        operation: F,
    ) -> IdemResult<Execution<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let ExecutionRequest { key, ttl, policy } = request;

        // A missing resolver is a configuration error, reported before
        // anything runs or touches the store.
        let resolver = match &policy {
            ConflictPolicy::Custom { resolver } => Some(self.resolvers.get(resolver).ok_or_else(
                || ConfigError::ResolverNotRegistered {
                    resolver: resolver.clone(),
                },
            )?),
            _ => None,
        };

        if let Some(cached) = self.store.get(key.full()).await? {
            return self
                .apply_policy(&key, ttl, &policy, resolver, cached, operation)
                .await;
        }

        match self.store.claim(key.full(), self.claim.lease()).await? {
            ClaimOutcome::Won(token) => self.run_claimed(&key, ttl, token, operation).await,
            ClaimOutcome::Lost => match self.claim.in_flight {
                InFlightPolicy::Reject => {
                    CoordinatorMetrics::incr(&self.metrics.in_flight_rejections);
                    tracing::debug!(key = %key, "key in flight, rejecting");
                    Err(IdemError::InFlight {
                        key: key.full().to_string(),
                    })
                }
                InFlightPolicy::Wait => match self.await_winner(&key).await? {
                    Waited::Completed(cached) => {
                        self.apply_policy(&key, ttl, &policy, resolver, cached, operation)
                            .await
                    }
                    Waited::Claimed(token) => self.run_claimed(&key, ttl, token, operation).await,
                },
            },
        }
    }

    /// Fresh path: this caller holds the claim.
    async fn run_claimed<T, F, Fut, E>(
        &self,
        key: &IdempotencyKey,
        ttl: Ttl,
        token: ClaimToken,
        operation: F,
    ) -> IdemResult<Execution<T>>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        tracing::debug!(key = %key, "cache miss, executing");

        let value = match self.run_renewing(key, &token, operation).await {
            Ok(value) => value,
            Err(e) => {
                self.release_claim(key, &token).await;
                return Err(e);
            }
        };

        let stored = match StoredValue::encode(&value) {
            Ok(stored) => self.store.complete(key.full(), &token, &stored, ttl).await,
            Err(e) => Err(e),
        };
        match stored {
            Ok(true) => {}
            // Someone else holds the key now; their marker or result stays.
            Ok(false) => {
                CoordinatorMetrics::incr(&self.metrics.claims_lost);
                tracing::warn!(key = %key, "claim lost before the result was stored, not caching");
            }
            Err(e) => {
                self.release_claim(key, &token).await;
                return Err(e);
            }
        }

        CoordinatorMetrics::incr(&self.metrics.executions);
        Ok(Execution {
            value,
            outcome: Outcome::Executed,
        })
    }

    /// Run the operation while renewing the claim every third of a lease.
    async fn run_renewing<T, F, Fut, E>(
        &self,
        key: &IdempotencyKey,
        token: &ClaimToken,
        operation: F,
    ) -> IdemResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let running = self.run_operation(key, operation);
        tokio::pin!(running);
        let renewing = self.keep_claim(key, token);
        tokio::pin!(renewing);
        let mut holding = true;

        loop {
            tokio::select! {
                biased;
                result = &mut running => return result,
                _ = &mut renewing, if holding => holding = false,
            }
        }
    }

    /// Renew until the claim is found lost. Store errors are logged and the
    /// next tick retries.
    async fn keep_claim(&self, key: &IdempotencyKey, token: &ClaimToken) {
        let lease = self.claim.lease();
        let mut ticker = tokio::time::interval(self.claim.renew_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match self.store.renew(key.full(), token, lease).await {
                Ok(true) => {
                    CoordinatorMetrics::incr(&self.metrics.lease_renewals);
                    tracing::trace!(key = %key, "claim renewed");
                }
                Ok(false) => {
                    tracing::warn!(key = %key, "claim no longer held while operation running");
                    return;
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "failed to renew claim");
                }
            }
        }
    }

    /// Existing-entry path for the request's policy.
    async fn apply_policy<T, F, Fut, E>(
        &self,
        key: &IdempotencyKey,
        ttl: Ttl,
        policy: &ConflictPolicy,
        resolver: Option<Arc<dyn ConflictResolver>>,
        cached: StoredValue,
        operation: F,
    ) -> IdemResult<Execution<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        match (policy, resolver) {
            (ConflictPolicy::Custom { .. }, Some(resolver)) => {
                let fresh_value = self.run_operation(key, operation).await?;
                let fresh = StoredValue::encode(&fresh_value)?;
                let resolution = resolver.resolve(key.full(), &cached, &fresh)?;
                CoordinatorMetrics::incr(&self.metrics.resolutions);
                tracing::debug!(key = %key, resolution = ?resolution, "custom resolver decided");

                let value = match resolution {
                    Resolution::Replay => cached.decode()?,
                    Resolution::Fresh { persist } => {
                        if persist {
                            self.store.save(key.full(), &fresh, ttl).await?;
                        }
                        fresh_value
                    }
                    Resolution::Substitute { value, persist } => {
                        if persist {
                            self.store.save(key.full(), &value, ttl).await?;
                        }
                        value.decode()?
                    }
                };
                Ok(Execution {
                    value,
                    outcome: Outcome::Resolved,
                })
            }
            (ConflictPolicy::Reject, _) => {
                let fresh_value = self.run_operation(key, operation).await?;
                let fresh = StoredValue::encode(&fresh_value)?;

                if fresh.fingerprint() == cached.fingerprint() {
                    CoordinatorMetrics::incr(&self.metrics.replays);
                    tracing::debug!(key = %key, "re-execution matched cached result");
                    Ok(Execution {
                        value: cached.decode()?,
                        outcome: Outcome::Replayed,
                    })
                } else {
                    CoordinatorMetrics::incr(&self.metrics.conflicts);
                    tracing::warn!(key = %key, "re-execution produced a different result");
                    Err(IdemError::Conflict {
                        key: key.full().to_string(),
                    })
                }
            }
            // Custom without a resolver was rejected before the lookup.
            (ConflictPolicy::Ignore, _) | (ConflictPolicy::Custom { .. }, None) => {
                CoordinatorMetrics::incr(&self.metrics.replays);
                tracing::debug!(key = %key, "cache hit, replaying");
                Ok(Execution {
                    value: cached.decode()?,
                    outcome: Outcome::Replayed,
                })
            }
        }
    }

    /// Poll until the claim winner's result is visible or the key frees up.
    async fn await_winner(&self, key: &IdempotencyKey) -> IdemResult<Waited> {
        CoordinatorMetrics::incr(&self.metrics.claim_waits);
        let wait_timeout = self.claim.wait_timeout();
        let poll_interval = self.claim.poll_interval();
        let deadline = Instant::now() + wait_timeout;
        tracing::debug!(key = %key, "key in flight, waiting for result");

        loop {
            let now = Instant::now();
            if now >= deadline {
                CoordinatorMetrics::incr(&self.metrics.wait_timeouts);
                tracing::warn!(key = %key, waited = ?wait_timeout, "gave up waiting for in-flight execution");
                return Err(IdemError::InFlightTimeout {
                    key: key.full().to_string(),
                    waited: wait_timeout,
                });
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;

            if let Some(cached) = self.store.get(key.full()).await? {
                return Ok(Waited::Completed(cached));
            }
            // The winner failed and released, or its lease ran out.
            if let ClaimOutcome::Won(token) =
                self.store.claim(key.full(), self.claim.lease()).await?
            {
                tracing::debug!(key = %key, "previous claim released, taking over");
                return Ok(Waited::Claimed(token));
            }
        }
    }

    async fn run_operation<T, F, Fut, E>(&self, key: &IdempotencyKey, operation: F) -> IdemResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        operation().await.map_err(|e| {
            CoordinatorMetrics::incr(&self.metrics.operation_failures);
            IdemError::Operation {
                key: key.full().to_string(),
                source: e.into(),
            }
        })
    }

    /// Best effort: a failed release leaves the marker to its lease.
    async fn release_claim(&self, key: &IdempotencyKey, token: &ClaimToken) {
        if let Err(e) = self.store.release(key.full(), token).await {
            tracing::warn!(key = %key, error = %e, "failed to release claim, lease will expire");
        }
    }
}
