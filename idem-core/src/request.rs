//! Per-call execution request.

use crate::key::IdempotencyKey;
use crate::policy::ConflictPolicy;
use crate::ttl::Ttl;

/// Everything the coordinator needs to know about one idempotent call.
///
/// Built per call and consumed by the coordinator; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub key: IdempotencyKey,
    pub ttl: Ttl,
    pub policy: ConflictPolicy,
}

impl ExecutionRequest {
    /// Request with the default TTL and [`ConflictPolicy::Ignore`].
    pub fn new(key: IdempotencyKey) -> Self {
        Self {
            key,
            ttl: Ttl::default(),
            policy: ConflictPolicy::Ignore,
        }
    }

    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the TTL from its string form. Unparsable input yields the default.
    pub fn with_ttl_str(mut self, raw: &str) -> Self {
        self.ttl = Ttl::parse(raw);
        self
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn full_key(&self) -> &str {
        self.key.full()
    }
}
