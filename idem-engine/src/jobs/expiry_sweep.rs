//! Expiry Sweep Background Task
//!
//! Redis expires keys on its own. PostgreSQL and the in-memory store keep
//! expired rows around until something deletes them; reads already treat
//! them as absent, so the sweep only reclaims space. It calls
//! [`IdempotencyStore::purge_expired_before`] on a fixed interval with a
//! cutoff of `now - grace`.

use chrono::{DateTime, TimeDelta, Utc};
use idem_core::SweeperConfig;
use idem_storage::IdempotencyStore;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct ExpirySweepMetrics {
    /// Sweep cycles completed, successful or not
    pub sweep_cycles: AtomicU64,

    /// Entries deleted since startup
    pub entries_purged: AtomicU64,

    /// Purge calls that failed
    pub sweep_errors: AtomicU64,
}

impl ExpirySweepMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> ExpirySweepSnapshot {
        ExpirySweepSnapshot {
            sweep_cycles: self.sweep_cycles.load(Ordering::Relaxed),
            entries_purged: self.entries_purged.load(Ordering::Relaxed),
            sweep_errors: self.sweep_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExpirySweepSnapshot {
    pub sweep_cycles: u64,
    pub entries_purged: u64,
    pub sweep_errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Periodically purges expired entries until `shutdown_rx` sees `true`.
///
/// The first sweep runs immediately. Returns the metrics collected over the
/// task's lifetime.
pub async fn expiry_sweep_task(
    store: Arc<dyn IdempotencyStore>,
    config: SweeperConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<ExpirySweepMetrics> {
    let metrics = Arc::new(ExpirySweepMetrics::new());

    let mut sweep_interval = interval(config.interval().max(MIN_SWEEP_INTERVAL));
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        backend = store.backend_name(),
        interval_secs = config.interval_secs,
        grace_secs = config.grace_secs,
        "Expiry sweep task started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // A dropped sender also ends the task.
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Expiry sweep task shutting down");
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                sweep_once(store.as_ref(), &config, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        sweep_cycles = snapshot.sweep_cycles,
        entries_purged = snapshot.entries_purged,
        sweep_errors = snapshot.sweep_errors,
        "Expiry sweep task completed"
    );

    metrics
}

/// Run one sweep cycle. Returns the number of entries purged.
pub async fn sweep_once(
    store: &dyn IdempotencyStore,
    config: &SweeperConfig,
    metrics: &ExpirySweepMetrics,
) -> u64 {
    metrics.sweep_cycles.fetch_add(1, Ordering::Relaxed);

    let cutoff = cutoff(Utc::now(), config.grace());
    match store.purge_expired_before(cutoff).await {
        Ok(0) => {
            tracing::trace!("Expiry sweep completed with nothing to purge");
            0
        }
        Ok(purged) => {
            metrics.entries_purged.fetch_add(purged, Ordering::Relaxed);
            tracing::info!(
                backend = store.backend_name(),
                purged = purged,
                "Expiry sweep purged entries"
            );
            purged
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                backend = store.backend_name(),
                "Failed to purge expired entries"
            );
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
            0
        }
    }
}

fn cutoff(now: DateTime<Utc>, grace: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(grace)
        .ok()
        .and_then(|grace| now.checked_sub_signed(grace))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
