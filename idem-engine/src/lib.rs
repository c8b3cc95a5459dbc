//! idem Engine - Idempotent Execution
//!
//! Runs an operation at most once per scoped key within a TTL window and
//! answers repeats from the stored result:
//!
//! ```ignore
//! use idem_engine::{connect, ExecutionCoordinator, IdemConfig, IdempotentExecutor, Ttl};
//!
//! let config = IdemConfig::from_env()?;
//! let store = connect(&config).await?;
//! let coordinator = ExecutionCoordinator::from_config(store, &config);
//! let executor = IdempotentExecutor::from_config(coordinator, &config);
//!
//! let receipt = executor
//!     .execute("order-123", Ttl::parse("10m"), || charge_card(&order))
//!     .await?;
//! ```

pub mod coordinator;
pub mod executor;
pub mod jobs;
pub mod metrics;
pub mod resolver;
pub mod telemetry;

pub use coordinator::{Execution, ExecutionCoordinator, Outcome};
pub use executor::IdempotentExecutor;
pub use jobs::{expiry_sweep_task, ExpirySweepMetrics, ExpirySweepSnapshot};
pub use metrics::{CoordinatorMetrics, CoordinatorSnapshot};
pub use resolver::{
    ConflictResolver, PreferFresh, Resolution, ResolverRegistry, WarnAndReplay,
    PREFER_FRESH_RESOLVER, WARN_RESOLVER,
};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};

pub use idem_core::{
    ConflictPolicy, ExecutionRequest, IdemConfig, IdemError, IdemResult, IdempotencyKey, Scope,
    StoredValue, Ttl,
};
pub use idem_storage::{connect, IdempotencyStore, MemoryStore};
