//! Conflict policies applied when a key already holds a live result.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What to do when a key is replayed within its TTL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConflictPolicy {
    /// Return the cached result without running the operation.
    #[default]
    Ignore,
    /// Run the operation and fail with a conflict if its result differs.
    Reject,
    /// Run the operation and let a registered resolver decide.
    Custom { resolver: String },
}

impl ConflictPolicy {
    pub fn custom(resolver: impl Into<String>) -> Self {
        ConflictPolicy::Custom {
            resolver: resolver.into(),
        }
    }

    /// True when the policy runs the operation even on a live entry.
    pub fn reexecutes(&self) -> bool {
        !matches!(self, ConflictPolicy::Ignore)
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::Ignore => f.write_str("ignore"),
            ConflictPolicy::Reject => f.write_str("reject"),
            ConflictPolicy::Custom { resolver } => write!(f, "custom:{}", resolver),
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = ConfigError;

    /// Accepts `ignore`, `reject` (alias `throw_409`) and `custom:<resolver-id>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let lower = trimmed.to_ascii_lowercase();
        match lower.as_str() {
            "ignore" => return Ok(ConflictPolicy::Ignore),
            "reject" | "throw_409" => return Ok(ConflictPolicy::Reject),
            _ => {}
        }

        if lower.starts_with("custom:") {
            let resolver = trimmed["custom:".len()..].trim();
            if resolver.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "conflict_policy".to_string(),
                    value: s.to_string(),
                    reason: "custom policy needs a resolver id".to_string(),
                });
            }
            return Ok(ConflictPolicy::custom(resolver));
        }

        Err(ConfigError::InvalidValue {
            field: "conflict_policy".to_string(),
            value: s.to_string(),
            reason: "expected ignore, reject, throw_409 or custom:<resolver-id>".to_string(),
        })
    }
}

impl TryFrom<String> for ConflictPolicy {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ConflictPolicy> for String {
    fn from(policy: ConflictPolicy) -> Self {
        policy.to_string()
    }
}
