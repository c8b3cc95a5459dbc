//! Background jobs.
//!
//! - `expiry_sweep`: purges expired entries from stores that do not expire
//!   records on their own
//!
//! ```ignore
//! use idem_engine::jobs::expiry_sweep_task;
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let handle = tokio::spawn(expiry_sweep_task(store.clone(), config.sweeper.clone(), shutdown_rx));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! let metrics = handle.await?;
//! ```

pub mod expiry_sweep;

pub use expiry_sweep::{expiry_sweep_task, sweep_once, ExpirySweepMetrics, ExpirySweepSnapshot};
