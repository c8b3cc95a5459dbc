//! idem Test Utilities
//!
//! Shared test infrastructure for the idem workspace:
//! - Operations that count their invocations
//! - A store that fails on demand
//! - Proptest generators for keys, TTLs, policies and stored values
//! - Fixtures and assertions for common scenarios

pub use idem_core::{
    ClaimConfig, ConfigError, ConflictPolicy, ExecutionRequest, IdemConfig, IdemError,
    IdemResult, IdempotencyKey, InFlightPolicy, Scope, StoreError, StoredValue, Ttl,
};
pub use idem_storage::{ClaimOutcome, ClaimToken, IdempotencyStore, MemoryStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::convert::Infallible;
use std::future::{ready, Future, Ready};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// COUNTING OPERATIONS
// ============================================================================

/// Boxed future returned by [`CountingOperation::delayed`].
pub type DelayedFuture<T> = Pin<Box<dyn Future<Output = Result<T, Infallible>> + Send>>;

/// Hands out operations that bump a shared call counter when invoked.
///
/// Clones share the counter, so one instance can be moved into many tasks.
#[derive(Debug, Clone, Default)]
pub struct CountingOperation {
    calls: Arc<AtomicUsize>,
}

impl CountingOperation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of operations invoked so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// An operation that succeeds with `value`.
    pub fn returning<T>(&self, value: T) -> impl FnOnce() -> Ready<Result<T, Infallible>> {
        let calls = Arc::clone(&self.calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            ready(Ok(value))
        }
    }

    /// An operation that fails with `message`.
    pub fn failing<T>(
        &self,
        message: &str,
    ) -> impl FnOnce() -> Ready<Result<T, std::io::Error>> {
        let calls = Arc::clone(&self.calls);
        let message = message.to_string();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            ready(Err(std::io::Error::other(message)))
        }
    }

    /// An operation that sleeps for `delay` before succeeding with `value`.
    pub fn delayed<T>(&self, value: T, delay: Duration) -> impl FnOnce() -> DelayedFuture<T>
    where
        T: Send + 'static,
    {
        let calls = Arc::clone(&self.calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(value)
            })
        }
    }
}

// ============================================================================
// FAILING STORE
// ============================================================================

/// Which store calls a [`FailingStore`] fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOn {
    /// Every call
    Everything,
    /// Only writes of results (`save` and `complete`); reads and claims go
    /// to an in-memory store
    Save,
}

/// Store that returns a fixed [`StoreError`] for the selected calls.
#[derive(Debug)]
pub struct FailingStore {
    inner: MemoryStore,
    error: StoreError,
    fail_on: FailOn,
}

impl FailingStore {
    /// Fails every call with `Unavailable`.
    pub fn unavailable() -> Self {
        Self::new(
            StoreError::Unavailable {
                backend: "failing",
                reason: "connection refused".to_string(),
            },
            FailOn::Everything,
        )
    }

    /// Fails every call with `TimedOut`.
    pub fn timed_out(after: Duration) -> Self {
        Self::new(
            StoreError::TimedOut {
                backend: "failing",
                after,
            },
            FailOn::Everything,
        )
    }

    /// Reads and claims work; every result write fails with `Unavailable`.
    pub fn failing_saves() -> Self {
        Self::new(
            StoreError::Unavailable {
                backend: "failing",
                reason: "write rejected".to_string(),
            },
            FailOn::Save,
        )
    }

    pub fn new(error: StoreError, fail_on: FailOn) -> Self {
        Self {
            inner: MemoryStore::new(),
            error,
            fail_on,
        }
    }

    /// The in-memory store behind the calls that do not fail.
    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn fail<T>(&self) -> IdemResult<T> {
        Err(self.error.clone().into())
    }

    fn fails_everything(&self) -> bool {
        self.fail_on == FailOn::Everything
    }
}

#[async_trait]
impl IdempotencyStore for FailingStore {
    async fn get(&self, key: &str) -> IdemResult<Option<StoredValue>> {
        if self.fails_everything() {
            return self.fail();
        }
        self.inner.get(key).await
    }

    async fn save(&self, _key: &str, _value: &StoredValue, _ttl: Ttl) -> IdemResult<()> {
        self.fail()
    }

    async fn claim(&self, key: &str, lease: Duration) -> IdemResult<ClaimOutcome> {
        if self.fails_everything() {
            return self.fail();
        }
        self.inner.claim(key, lease).await
    }

    async fn renew(&self, key: &str, token: &ClaimToken, lease: Duration) -> IdemResult<bool> {
        if self.fails_everything() {
            return self.fail();
        }
        self.inner.renew(key, token, lease).await
    }

    async fn complete(
        &self,
        _key: &str,
        _token: &ClaimToken,
        _value: &StoredValue,
        _ttl: Ttl,
    ) -> IdemResult<bool> {
        self.fail()
    }

    async fn release(&self, key: &str, token: &ClaimToken) -> IdemResult<()> {
        if self.fails_everything() {
            return self.fail();
        }
        self.inner.release(key, token).await
    }

    async fn purge_expired_before(&self, cutoff: DateTime<Utc>) -> IdemResult<u64> {
        if self.fails_everything() {
            return self.fail();
        }
        self.inner.purge_expired_before(cutoff).await
    }

    fn backend_name(&self) -> &'static str {
        "failing"
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for idem types.

    use super::*;
    use proptest::prelude::*;
    use serde_json::Value;

    /// A raw key with at least one non-blank character.
    pub fn arb_raw_key() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_.:-]{1,48}"
    }

    /// Empty or whitespace-only keys.
    pub fn arb_blank_key() -> impl Strategy<Value = String> {
        "[ \t\n]{0,6}"
    }

    pub fn arb_scope() -> impl Strategy<Value = Scope> {
        prop_oneof![
            Just(Scope::global()),
            "[a-z][a-zA-Z0-9_-]{0,15}".prop_map(|name| Scope::new(name)),
        ]
    }

    pub fn arb_key() -> impl Strategy<Value = IdempotencyKey> {
        (arb_scope(), arb_raw_key()).prop_filter_map("blank key", |(scope, raw)| {
            IdempotencyKey::new(scope, raw).ok()
        })
    }

    /// Valid TTL strings in both accepted grammars, with their seconds.
    ///
    /// The compound form is written without its `PT` prefix, which the
    /// parser supplies.
    pub fn arb_ttl_string() -> impl Strategy<Value = (String, u64)> {
        prop_oneof![
            (1u64..10_000).prop_map(|n| (format!("{n}s"), n)),
            (1u64..10_000).prop_map(|n| (format!("{n}m"), n * 60)),
            (1u64..1_000).prop_map(|n| (format!("{n}h"), n * 3_600)),
            (1u64..100).prop_map(|n| (format!("{n}d"), n * 86_400)),
            (0u64..48, 0u64..60, 1u64..60)
                .prop_map(|(h, m, s)| (format!("{h}h{m}m{s}s"), h * 3_600 + m * 60 + s)),
        ]
    }

    pub fn arb_ttl() -> impl Strategy<Value = Ttl> {
        (1u64..7 * 86_400_000).prop_filter_map("zero ttl", Ttl::from_millis)
    }

    pub fn arb_policy() -> impl Strategy<Value = ConflictPolicy> {
        prop_oneof![
            Just(ConflictPolicy::Ignore),
            Just(ConflictPolicy::Reject),
            "[a-z][a-z0-9-]{0,11}".prop_map(|id| ConflictPolicy::custom(id)),
        ]
    }

    /// Arbitrary JSON, excluding top-level `null`.
    pub fn arb_json_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[ -~]{0,24}".prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,8}", inner, 0..6)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    pub fn arb_stored_value() -> impl Strategy<Value = StoredValue> {
        prop_oneof![
            1 => Just(StoredValue::Null),
            4 => arb_json_value().prop_map(StoredValue::Value),
        ]
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built values for common scenarios.

    use super::*;

    pub fn memory_store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new())
    }

    /// A request in the global scope.
    ///
    /// # Panics
    /// If `raw` is blank.
    pub fn request(raw: &str, ttl: Duration, policy: ConflictPolicy) -> ExecutionRequest {
        let key = IdempotencyKey::global(raw).expect("fixture keys are non-blank");
        let ttl = Ttl::new(ttl).expect("fixture TTLs are non-zero");
        ExecutionRequest::new(key).with_ttl(ttl).with_policy(policy)
    }

    /// A request in `scope`.
    pub fn scoped_request(
        scope: &str,
        raw: &str,
        ttl: Duration,
        policy: ConflictPolicy,
    ) -> ExecutionRequest {
        let key = IdempotencyKey::new(Scope::new(scope), raw).expect("fixture keys are non-blank");
        let ttl = Ttl::new(ttl).expect("fixture TTLs are non-zero");
        ExecutionRequest::new(key).with_ttl(ttl).with_policy(policy)
    }

    /// Claim settings with millisecond polling and a short wait.
    pub fn fast_claim_config(in_flight: InFlightPolicy) -> ClaimConfig {
        ClaimConfig {
            lease_ms: 5_000,
            wait_timeout_ms: 2_000,
            poll_interval_ms: 5,
            in_flight,
        }
    }

    /// Memory-backed configuration with fast claims.
    pub fn test_config() -> IdemConfig {
        IdemConfig {
            claim: fast_claim_config(InFlightPolicy::Wait),
            ..IdemConfig::default()
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over [`IdemResult`] error classes.

    use super::*;

    #[track_caller]
    pub fn assert_conflict<T: std::fmt::Debug>(result: &IdemResult<T>) {
        match result {
            Err(IdemError::Conflict { .. }) => {}
            other => panic!("Expected Conflict, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_store_unavailable<T: std::fmt::Debug>(result: &IdemResult<T>) {
        match result {
            Err(IdemError::StoreUnavailable(_)) => {}
            other => panic!("Expected StoreUnavailable, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_key_resolution<T: std::fmt::Debug>(result: &IdemResult<T>) {
        match result {
            Err(IdemError::KeyResolution { .. }) => {}
            other => panic!("Expected KeyResolution, got: {:?}", other),
        }
    }

    /// Assert a missing-resolver configuration error naming `resolver`.
    #[track_caller]
    pub fn assert_resolver_missing<T: std::fmt::Debug>(result: &IdemResult<T>, resolver: &str) {
        match result {
            Err(IdemError::Configuration(ConfigError::ResolverNotRegistered { resolver: r })) => {
                assert_eq!(r, resolver, "Wrong resolver in error");
            }
            other => panic!("Expected ResolverNotRegistered({resolver}), got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_operation_failed<T: std::fmt::Debug>(result: &IdemResult<T>) {
        match result {
            Err(IdemError::Operation { .. }) => {}
            other => panic!("Expected Operation error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_in_flight<T: std::fmt::Debug>(result: &IdemResult<T>) {
        match result {
            Err(IdemError::InFlight { .. }) | Err(IdemError::InFlightTimeout { .. }) => {}
            other => panic!("Expected InFlight or InFlightTimeout, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
