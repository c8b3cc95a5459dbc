//! idem Core - Data Model
//!
//! Types shared by every idem crate: scoped keys, TTLs, stored results,
//! conflict policies, the error taxonomy and configuration. No I/O lives here.

pub mod config;
pub mod entry;
pub mod error;
pub mod key;
pub mod policy;
pub mod request;
pub mod ttl;

pub use config::{
    ClaimConfig, IdemConfig, InFlightPolicy, PostgresConfig, RedisConfig, StoreKind,
    SweeperConfig,
};
pub use entry::{expiry_after, CacheEntry, StoredValue};
pub use error::{BoxError, ConfigError, IdemError, IdemResult, StoreError};
pub use key::{FixedScope, GlobalScope, IdempotencyKey, Scope, ScopeResolver, GLOBAL_SCOPE};
pub use policy::ConflictPolicy;
pub use request::ExecutionRequest;
pub use ttl::{Ttl, TtlParseError, DEFAULT_TTL};
