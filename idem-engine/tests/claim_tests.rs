//! Concurrent callers sharing one key.

use idem_engine::{ExecutionCoordinator, Outcome};
use idem_test_utils::fixtures::{fast_claim_config, memory_store, request};
use idem_test_utils::*;
use std::time::Duration;

const LONG: Duration = Duration::from_secs(60);

fn coordinator(in_flight: InFlightPolicy) -> ExecutionCoordinator {
    ExecutionCoordinator::new(memory_store()).with_claim_config(fast_claim_config(in_flight))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_run_operation_once() {
    let coord = coordinator(InFlightPolicy::Wait);
    let op = CountingOperation::new();

    let handles: Vec<_> = (0..16usize)
        .map(|i| {
            let coord = coord.clone();
            let operation = op.delayed(i, Duration::from_millis(50));
            tokio::spawn(async move {
                coord
                    .execute_with_outcome(request("order-123", LONG, ConflictPolicy::Ignore), operation)
                    .await
            })
        })
        .collect();

    let mut values = Vec::new();
    let mut executed = 0;
    for handle in handles {
        let execution = handle.await.unwrap().unwrap();
        if execution.outcome == Outcome::Executed {
            executed += 1;
        }
        values.push(execution.value);
    }

    assert_eq!(op.calls(), 1);
    assert_eq!(executed, 1);
    assert!(values.windows(2).all(|pair| pair[0] == pair[1]));

    let snapshot = coord.metrics().snapshot();
    assert_eq!(snapshot.executions, 1);
    assert_eq!(snapshot.replays, 15);
}

#[tokio::test]
async fn reject_in_flight_fails_fast() {
    let coord = coordinator(InFlightPolicy::Reject);
    let op = CountingOperation::new();

    let winner = {
        let coord = coord.clone();
        let operation = op.delayed(1u32, Duration::from_millis(200));
        tokio::spawn(async move {
            coord
                .execute(request("k", LONG, ConflictPolicy::Ignore), operation)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let loser = coord
        .execute(request("k", LONG, ConflictPolicy::Ignore), op.returning(2u32))
        .await;
    assertions::assert_in_flight(&loser);
    assert_eq!(loser.unwrap_err().status_code(), 409);

    assert_eq!(winner.await.unwrap().unwrap(), 1);
    let later = coord
        .execute(request("k", LONG, ConflictPolicy::Ignore), op.returning(3u32))
        .await
        .unwrap();
    assert_eq!(later, 1);
    assert_eq!(op.calls(), 1);
}

#[tokio::test]
async fn waiter_gives_up_after_wait_timeout() {
    let claim = ClaimConfig {
        wait_timeout_ms: 50,
        ..fast_claim_config(InFlightPolicy::Wait)
    };
    let coord = ExecutionCoordinator::new(memory_store()).with_claim_config(claim);
    let op = CountingOperation::new();

    let winner = {
        let coord = coord.clone();
        let operation = op.delayed("slow".to_string(), Duration::from_millis(400));
        tokio::spawn(async move {
            coord
                .execute(request("k", LONG, ConflictPolicy::Ignore), operation)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let waiter = coord
        .execute(request("k", LONG, ConflictPolicy::Ignore), op.returning("fast".to_string()))
        .await;
    match &waiter {
        Err(IdemError::InFlightTimeout { key, waited }) => {
            assert_eq!(key, "GLOBAL:k");
            assert_eq!(*waited, Duration::from_millis(50));
        }
        other => panic!("Expected InFlightTimeout, got: {:?}", other),
    }
    assert_eq!(waiter.unwrap_err().status_code(), 504);

    assert_eq!(winner.await.unwrap().unwrap(), "slow");
    assert_eq!(op.calls(), 1);
    assert_eq!(coord.metrics().snapshot().wait_timeouts, 1);
}

#[tokio::test]
async fn waiter_takes_over_after_winner_fails() {
    let coord = coordinator(InFlightPolicy::Wait);

    let winner = {
        let coord = coord.clone();
        tokio::spawn(async move {
            coord
                .execute(request("k", LONG, ConflictPolicy::Ignore), || async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Err::<u32, _>(std::io::Error::other("upstream down"))
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let op = CountingOperation::new();
    let waiter = coord
        .execute_with_outcome(request("k", LONG, ConflictPolicy::Ignore), op.returning(9u32))
        .await
        .unwrap();

    assertions::assert_operation_failed(&winner.await.unwrap());
    assert_eq!(waiter.value, 9);
    assert_eq!(waiter.outcome, Outcome::Executed);
    assert_eq!(op.calls(), 1);
}

// ============================================================================
// LEASE RENEWAL
// ============================================================================

/// Lease far shorter than the operation; only renewal keeps the claim.
fn short_lease(in_flight: InFlightPolicy, wait_timeout_ms: u64) -> ExecutionCoordinator {
    let claim = ClaimConfig {
        lease_ms: 50,
        wait_timeout_ms,
        poll_interval_ms: 5,
        in_flight,
    };
    ExecutionCoordinator::new(memory_store()).with_claim_config(claim)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn operation_outliving_its_lease_runs_once() {
    let coord = short_lease(InFlightPolicy::Wait, 2_000);
    let op = CountingOperation::new();

    let handles: Vec<_> = (0..2u32)
        .map(|i| {
            let coord = coord.clone();
            let operation = op.delayed(i, Duration::from_millis(200));
            tokio::spawn(async move {
                coord
                    .execute_with_outcome(request("slow-order", LONG, ConflictPolicy::Ignore), operation)
                    .await
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(op.calls(), 1);
    assert_eq!(outcomes[0].value, outcomes[1].value);
    assert_eq!(
        outcomes.iter().filter(|e| e.outcome == Outcome::Executed).count(),
        1
    );

    let snapshot = coord.metrics().snapshot();
    assert!(snapshot.lease_renewals >= 1);
    assert_eq!(snapshot.claims_lost, 0);
}

#[tokio::test]
async fn late_caller_cannot_claim_renewed_key() {
    let coord = short_lease(InFlightPolicy::Reject, 40);
    let op = CountingOperation::new();

    let winner = {
        let coord = coord.clone();
        let operation = op.delayed("first".to_string(), Duration::from_millis(250));
        tokio::spawn(async move {
            coord
                .execute(request("k", LONG, ConflictPolicy::Ignore), operation)
                .await
        })
    };
    // Well past the original lease.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let late = coord
        .execute(request("k", LONG, ConflictPolicy::Ignore), op.returning("second".to_string()))
        .await;
    assertions::assert_in_flight(&late);

    assert_eq!(winner.await.unwrap().unwrap(), "first");
    assert_eq!(op.calls(), 1);
}

#[tokio::test]
async fn result_is_not_cached_once_claim_is_gone() {
    let coord = coordinator(InFlightPolicy::Wait);
    let store = std::sync::Arc::clone(coord.store());
    let theirs = StoredValue::encode(&"theirs").unwrap();

    let execution = coord
        .execute_with_outcome(request("k", LONG, ConflictPolicy::Ignore), {
            let theirs = theirs.clone();
            move || async move {
                // Another writer completes the key mid-run.
                store.save("GLOBAL:k", &theirs, Ttl::default()).await?;
                Ok::<_, IdemError>("mine".to_string())
            }
        })
        .await
        .unwrap();

    assert_eq!(execution.value, "mine");
    assert_eq!(execution.outcome, Outcome::Executed);
    assert_eq!(coord.store().get("GLOBAL:k").await.unwrap(), Some(theirs));
    assert_eq!(coord.metrics().snapshot().claims_lost, 1);
}
