//! HORNET: Tenant Identity
//!
//! The identity resolved from an API key. Carried explicitly through the
//! call stack; never stored in a process global.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription tier, driving rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl SubscriptionTier {
    /// Requests per minute allowed on a single endpoint path.
    pub fn requests_per_minute(&self) -> u32 {
        match self {
            Self::Free => 60,
            Self::Starter => 600,
            Self::Pro => 3000,
            Self::Enterprise => 10000,
        }
    }

    pub fn parse_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "starter" => Self::Starter,
            "pro" => Self::Pro,
            "enterprise" => Self::Enterprise,
            _ => Self::Free,
        }
    }
}

/// Authenticated tenant identity attached to a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantIdentity {
    /// Tenant id
    pub tenant_id: Uuid,
    /// Tenant display name
    pub tenant_name: String,
    /// Id of the API key that authenticated the request
    pub key_id: Uuid,
    /// Scopes granted to the key
    pub scopes: Vec<String>,
    /// Subscription tier
    pub tier: SubscriptionTier,
}

impl TenantIdentity {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope || s == "full")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_limits() {
        assert_eq!(SubscriptionTier::Free.requests_per_minute(), 60);
        assert!(SubscriptionTier::Enterprise > SubscriptionTier::Free);
    }

    #[test]
    fn test_full_scope_covers_everything() {
        let identity = TenantIdentity {
            tenant_id: Uuid::new_v4(),
            tenant_name: "acme".into(),
            key_id: Uuid::new_v4(),
            scopes: vec!["full".into()],
            tier: SubscriptionTier::Pro,
        };
        assert!(identity.has_scope("events:write"));
        assert!(identity.has_scope("full"));
    }
}
