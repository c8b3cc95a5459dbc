//! End-to-end execution behaviour against the in-memory store.

use idem_engine::{
    ExecutionCoordinator, IdemError, IdempotentExecutor, Outcome, Resolution, ResolverRegistry,
    StoredValue,
};
use idem_test_utils::fixtures::{memory_store, request, scoped_request};
use idem_test_utils::*;
use std::sync::Arc;
use std::time::Duration;

const LONG: Duration = Duration::from_secs(60);

fn coordinator() -> ExecutionCoordinator {
    ExecutionCoordinator::new(memory_store())
}

// ============================================================================
// REPLAY AND EXPIRY
// ============================================================================

#[tokio::test]
async fn replays_cached_result_without_running_again() {
    let coord = coordinator();
    let op = CountingOperation::new();

    let first = coord
        .execute(request("order-123", LONG, ConflictPolicy::Ignore), op.returning(100u32))
        .await
        .unwrap();
    let second = coord
        .execute_with_outcome(request("order-123", LONG, ConflictPolicy::Ignore), op.returning(200u32))
        .await
        .unwrap();

    assert_eq!(first, 100);
    assert_eq!(second.value, 100);
    assert_eq!(second.outcome, Outcome::Replayed);
    assert_eq!(op.calls(), 1);
}

#[tokio::test]
async fn re_executes_after_ttl_elapses() {
    let coord = coordinator();
    let op = CountingOperation::new();
    let ttl = Duration::from_millis(150);

    let first = coord
        .execute(request("order-1", ttl, ConflictPolicy::Ignore), op.returning("A".to_string()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!coord.store().exists("GLOBAL:order-1").await.unwrap());
    let second = coord
        .execute_with_outcome(request("order-1", ttl, ConflictPolicy::Ignore), op.returning("B".to_string()))
        .await
        .unwrap();

    assert_eq!(first, "A");
    assert_eq!(second.value, "B");
    assert_eq!(second.outcome, Outcome::Executed);
    assert_eq!(op.calls(), 2);
}

#[tokio::test]
async fn reject_conflicts_inside_window_and_recovers_after() {
    let coord = coordinator();
    let op = CountingOperation::new();
    let ttl = Duration::from_millis(200);
    let req = || request("order-123", ttl, ConflictPolicy::Reject);

    let first = coord.execute(req(), op.returning("A".to_string())).await;
    assert_eq!(first.unwrap(), "A");

    let second = coord.execute(req(), op.returning("B".to_string())).await;
    assertions::assert_conflict(&second);
    assert_eq!(second.unwrap_err().status_code(), 409);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let third = coord.execute(req(), op.returning("C".to_string())).await;
    assert_eq!(third.unwrap(), "C");

    assert_eq!(op.calls(), 3);
    assert_eq!(coord.metrics().snapshot().conflicts, 1);
}

#[tokio::test]
async fn scopes_do_not_share_entries() {
    let coord = coordinator();
    let op = CountingOperation::new();

    let a = coord
        .execute(scoped_request("tenantA", "order-1", LONG, ConflictPolicy::Ignore), op.returning(1u8))
        .await
        .unwrap();
    let b = coord
        .execute(scoped_request("tenantB", "order-1", LONG, ConflictPolicy::Ignore), op.returning(2u8))
        .await
        .unwrap();
    assert_eq!((a, b), (1, 2));
    assert_eq!(op.calls(), 2);

    let a_again = coord
        .execute(scoped_request("tenantA", "order-1", LONG, ConflictPolicy::Ignore), op.returning(9u8))
        .await
        .unwrap();
    assert_eq!(a_again, 1);
    assert_eq!(op.calls(), 2);
}

// ============================================================================
// NULL RESULTS
// ============================================================================

#[tokio::test]
async fn none_result_is_cached_and_replayed() {
    let coord = coordinator();
    let op = CountingOperation::new();

    let first: Option<u32> = coord
        .execute(request("lookup", LONG, ConflictPolicy::Ignore), op.returning(None))
        .await
        .unwrap();
    let second: Option<u32> = coord
        .execute(request("lookup", LONG, ConflictPolicy::Ignore), op.returning(Some(5)))
        .await
        .unwrap();

    assert_eq!(first, None);
    assert_eq!(second, None);
    assert_eq!(op.calls(), 1);
    assert_eq!(
        coord.store().get("GLOBAL:lookup").await.unwrap(),
        Some(StoredValue::Null)
    );
}

#[tokio::test]
async fn unit_result_is_cached() {
    let coord = coordinator();
    let op = CountingOperation::new();

    for _ in 0..3 {
        coord
            .execute(request("fire-and-forget", LONG, ConflictPolicy::Ignore), op.returning(()))
            .await
            .unwrap();
    }
    assert_eq!(op.calls(), 1);
}

// ============================================================================
// CONFLICT RESOLVERS
// ============================================================================

#[tokio::test]
async fn custom_resolver_decides_on_repeat() {
    let registry = ResolverRegistry::with_builtins().with(
        "keep-max",
        |_: &str, cached: &StoredValue, fresh: &StoredValue| -> IdemResult<Resolution> {
            if fresh.decode::<u32>()? > cached.decode::<u32>()? {
                Ok(Resolution::Fresh { persist: true })
            } else {
                Ok(Resolution::Replay)
            }
        },
    );
    let coord = coordinator().with_resolvers(registry);
    let policy = ConflictPolicy::custom("keep-max");

    let first = coord
        .execute_with_outcome(request("score", LONG, policy.clone()), || async {
            Ok::<_, std::convert::Infallible>(10u32)
        })
        .await
        .unwrap();
    assert_eq!(first.outcome, Outcome::Executed);

    let lower = coord
        .execute_with_outcome(request("score", LONG, policy.clone()), || async {
            Ok::<_, std::convert::Infallible>(3u32)
        })
        .await
        .unwrap();
    assert_eq!((lower.value, lower.outcome), (10, Outcome::Resolved));

    let higher = coord
        .execute(request("score", LONG, policy), || async {
            Ok::<_, std::convert::Infallible>(42u32)
        })
        .await
        .unwrap();
    assert_eq!(higher, 42);

    let replayed = coord
        .execute(request("score", LONG, ConflictPolicy::Ignore), || async {
            Ok::<_, std::convert::Infallible>(0u32)
        })
        .await
        .unwrap();
    assert_eq!(replayed, 42);
}

#[tokio::test]
async fn unregistered_resolver_fails_before_running() {
    let coord = coordinator();
    let op = CountingOperation::new();

    let result = coord
        .execute(request("k", LONG, ConflictPolicy::custom("nope")), op.returning(1u8))
        .await;

    assertions::assert_resolver_missing(&result, "nope");
    assert_eq!(op.calls(), 0);
    assert!(!coord.store().exists("GLOBAL:k").await.unwrap());
}

#[tokio::test]
async fn warn_resolver_replays_cached_result() {
    let coord = coordinator();
    let op = CountingOperation::new();
    let policy = ConflictPolicy::custom(idem_engine::WARN_RESOLVER);

    coord
        .execute(request("k", LONG, policy.clone()), op.returning("first".to_string()))
        .await
        .unwrap();
    let again = coord
        .execute_with_outcome(request("k", LONG, policy), op.returning("second".to_string()))
        .await
        .unwrap();

    assert_eq!(again.value, "first");
    assert_eq!(again.outcome, Outcome::Resolved);
    // Custom policies always run the operation again.
    assert_eq!(op.calls(), 2);
}

#[tokio::test]
async fn prefer_fresh_resolver_overwrites_entry() {
    let coord = coordinator();
    let policy = ConflictPolicy::custom(idem_engine::PREFER_FRESH_RESOLVER);
    let op = CountingOperation::new();

    coord
        .execute(request("k", LONG, policy.clone()), op.returning(1u32))
        .await
        .unwrap();
    let fresh = coord
        .execute(request("k", LONG, policy), op.returning(2u32))
        .await
        .unwrap();
    let stored = coord
        .execute(request("k", LONG, ConflictPolicy::Ignore), op.returning(3u32))
        .await
        .unwrap();

    assert_eq!((fresh, stored), (2, 2));
    assert_eq!(op.calls(), 2);
}

// ============================================================================
// ERROR PATHS
// ============================================================================

#[tokio::test]
async fn store_failure_propagates_without_running() {
    let coord = ExecutionCoordinator::new(Arc::new(FailingStore::unavailable()));
    let op = CountingOperation::new();

    let result = coord
        .execute(request("k", LONG, ConflictPolicy::Ignore), op.returning(1u8))
        .await;

    assertions::assert_store_unavailable(&result);
    assert_eq!(result.unwrap_err().status_code(), 503);
    assert_eq!(op.calls(), 0);
}

#[tokio::test]
async fn failed_operation_is_not_cached() {
    let store = memory_store();
    let coord = ExecutionCoordinator::new(store.clone());
    let op = CountingOperation::new();

    let failed = coord
        .execute(request("pay", LONG, ConflictPolicy::Ignore), op.failing::<u32>("card declined"))
        .await;
    assertions::assert_operation_failed(&failed);
    assert!(store.is_empty(), "claim must be released after a failure");

    let retried = coord
        .execute_with_outcome(request("pay", LONG, ConflictPolicy::Ignore), op.returning(7u32))
        .await
        .unwrap();
    assert_eq!(retried.outcome, Outcome::Executed);
    assert_eq!(op.calls(), 2);
    assert_eq!(coord.metrics().snapshot().operation_failures, 1);
}

#[tokio::test]
async fn failed_save_surfaces_and_releases_claim() {
    let store = Arc::new(FailingStore::failing_saves());
    let coord = ExecutionCoordinator::new(store.clone());
    let op = CountingOperation::new();

    let result = coord
        .execute(request("k", LONG, ConflictPolicy::Ignore), op.returning(1u8))
        .await;

    assertions::assert_store_unavailable(&result);
    assert_eq!(op.calls(), 1);
    assert!(store.inner().is_empty());
}

#[tokio::test]
async fn operation_error_keeps_its_source() {
    let coord = coordinator();
    let op = CountingOperation::new();

    let err = coord
        .execute(request("k", LONG, ConflictPolicy::Ignore), op.failing::<u8>("boom"))
        .await
        .unwrap_err();

    match err {
        IdemError::Operation { key, source } => {
            assert_eq!(key, "GLOBAL:k");
            assert_eq!(source.to_string(), "boom");
        }
        other => panic!("Expected Operation error, got: {:?}", other),
    }
}

// ============================================================================
// EXECUTOR
// ============================================================================

#[tokio::test]
async fn executor_rejects_blank_keys() {
    let executor = IdempotentExecutor::new(coordinator());
    let op = CountingOperation::new();

    let result = executor.execute_default("   ", op.returning(1u8)).await;

    assertions::assert_key_resolution(&result);
    assert_eq!(result.unwrap_err().status_code(), 400);
    assert_eq!(op.calls(), 0);
}

#[tokio::test]
async fn executor_uses_configured_defaults() {
    let config = IdemConfig::from_toml_str(
        r#"
        default_ttl = "1h30m"
        default_policy = "throw_409"
        "#,
    )
    .unwrap();
    let coord = ExecutionCoordinator::from_config(memory_store(), &config);
    let executor = IdempotentExecutor::from_config(coord, &config);
    let op = CountingOperation::new();
    assert_eq!(executor.default_ttl().as_duration(), Duration::from_secs(5_400));

    executor
        .execute_default("invoice-9", op.returning("A".to_string()))
        .await
        .unwrap();
    let conflict = executor
        .execute_default("invoice-9", op.returning("B".to_string()))
        .await;

    assertions::assert_conflict(&conflict);
}

#[tokio::test]
async fn store_timeout_surfaces_as_unavailable() {
    let store = Arc::new(FailingStore::timed_out(Duration::from_millis(100)));
    let coord = ExecutionCoordinator::from_config(store, &fixtures::test_config());
    let executor = IdempotentExecutor::new(coord);
    let op = CountingOperation::new();

    let result = executor.execute_default("k", op.returning(1u8)).await;

    assertions::assert_store_unavailable(&result);
    assert_eq!(result.unwrap_err().status_code(), 503);
    assert_eq!(op.calls(), 0);
}
