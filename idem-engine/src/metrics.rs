//! Coordinator counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters shared by every clone of a coordinator.
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    /// Operations run on the fresh path and saved
    pub executions: AtomicU64,

    /// Calls answered from a cached result (Ignore, or Reject with a match)
    pub replays: AtomicU64,

    /// Reject-policy mismatches
    pub conflicts: AtomicU64,

    /// Calls decided by a custom resolver
    pub resolutions: AtomicU64,

    /// Calls that lost a claim and waited for the winner
    pub claim_waits: AtomicU64,

    /// Calls that lost a claim under `in_flight = reject`
    pub in_flight_rejections: AtomicU64,

    /// Waits that gave up before the winner finished
    pub wait_timeouts: AtomicU64,

    /// Wrapped operations that returned an error
    pub operation_failures: AtomicU64,

    /// Lease extensions made while an operation was running
    pub lease_renewals: AtomicU64,

    /// Results not stored because the claim was no longer held
    pub claims_lost: AtomicU64,
}

impl CoordinatorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            executions: self.executions.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            resolutions: self.resolutions.load(Ordering::Relaxed),
            claim_waits: self.claim_waits.load(Ordering::Relaxed),
            in_flight_rejections: self.in_flight_rejections.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            operation_failures: self.operation_failures.load(Ordering::Relaxed),
            lease_renewals: self.lease_renewals.load(Ordering::Relaxed),
            claims_lost: self.claims_lost.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of coordinator metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorSnapshot {
    pub executions: u64,
    pub replays: u64,
    pub conflicts: u64,
    pub resolutions: u64,
    pub claim_waits: u64,
    pub in_flight_rejections: u64,
    pub wait_timeouts: u64,
    pub operation_failures: u64,
    pub lease_renewals: u64,
    pub claims_lost: u64,
}

impl CoordinatorSnapshot {
    /// Share of answered calls served from cache (0.0 to 1.0).
    pub fn replay_rate(&self) -> f64 {
        let total = self.executions + self.replays + self.resolutions;
        if total == 0 {
            0.0
        } else {
            self.replays as f64 / total as f64
        }
    }
}
