//! Cache eviction policies.
//!
//! The original design never evicts; that stays the default here, but the
//! policy is an explicit, serializable configuration value rather than a
//! hidden constant, so deployments that need a bound can set one.

use serde::{Deserialize, Serialize};

/// Rule governing cache span removal under storage pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum EvictionPolicy {
    /// Never evict. The cache grows without bound; pruning is the
    /// operator's responsibility.
    None,
    /// Evict least-recently-read spans once the cache total exceeds
    /// `max_total_bytes`.
    LeastRecentlyUsed {
        /// Upper bound on the sum of all span lengths.
        max_total_bytes: u64,
    },
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::None
    }
}

impl EvictionPolicy {
    /// Returns true when this policy never evicts.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Returns the byte budget, when the policy has one.
    #[must_use]
    pub fn max_total_bytes(&self) -> Option<u64> {
        match self {
            Self::None => None,
            Self::LeastRecentlyUsed { max_total_bytes } => Some(*max_total_bytes),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_none() {
        assert_eq!(EvictionPolicy::default(), EvictionPolicy::None);
        assert!(EvictionPolicy::default().is_none());
        assert_eq!(EvictionPolicy::default().max_total_bytes(), None);
    }

    #[test]
    fn test_lru_policy_exposes_budget() {
        let policy = EvictionPolicy::LeastRecentlyUsed {
            max_total_bytes: 4096,
        };
        assert!(!policy.is_none());
        assert_eq!(policy.max_total_bytes(), Some(4096));
    }

    #[test]
    fn test_policy_serde_round_trip() {
        let policy = EvictionPolicy::LeastRecentlyUsed {
            max_total_bytes: 1024,
        };
        let json = serde_json::to_string(&policy).unwrap();
        let back: EvictionPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, back);
    }
}
