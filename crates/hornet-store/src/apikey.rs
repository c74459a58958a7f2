//! HORNET: API Key Validation
//!
//! Keys carry the `hnt_` vendor prefix; only the SHA-256 of the clear key
//! is ever stored. Validation is a hash lookup joined to the tenant row,
//! cached for a short TTL. `last_used_at` is advanced best-effort.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

use hornet_types::{SubscriptionTier, TenantIdentity};

use crate::StoreError;

/// Vendor prefix every HORNET API key starts with.
pub const API_KEY_PREFIX: &str = "hnt_";

/// Hash an API key for storage or lookup.
pub fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

/// Generate a fresh API key with the vendor prefix.
pub fn generate_api_key() -> String {
    format!(
        "{}{}{}",
        API_KEY_PREFIX,
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

/// Credential validation seam.
#[async_trait]
pub trait ApiKeyValidator: Send + Sync {
    /// Resolve a clear API key to a tenant identity. `Ok(None)` means the
    /// credential is unknown, inactive, or expired.
    async fn validate(&self, api_key: &str) -> Result<Option<TenantIdentity>, StoreError>;
}

struct CacheSlot {
    identity: TenantIdentity,
    expires: Instant,
}

/// Database-backed key validator with a bounded-TTL cache keyed by hash.
pub struct PgApiKeyValidator {
    pool: PgPool,
    cache: Mutex<HashMap<String, CacheSlot>>,
    cache_ttl: Duration,
}

impl PgApiKeyValidator {
    pub fn new(pool: PgPool, cache_ttl: Duration) -> Self {
        Self {
            pool,
            cache: Mutex::new(HashMap::new()),
            cache_ttl,
        }
    }
}

#[async_trait]
impl ApiKeyValidator for PgApiKeyValidator {
    async fn validate(&self, api_key: &str) -> Result<Option<TenantIdentity>, StoreError> {
        if !api_key.starts_with(API_KEY_PREFIX) {
            return Ok(None);
        }
        let key_hash = hash_api_key(api_key);

        {
            let cache = self.cache.lock();
            if let Some(slot) = cache.get(&key_hash) {
                if slot.expires > Instant::now() {
                    return Ok(Some(slot.identity.clone()));
                }
            }
        }

        let row = sqlx::query(
            "SELECT ak.id AS key_id, ak.tenant_id, ak.scopes, \
                    t.name AS tenant_name, t.subscription_tier \
             FROM api_keys ak \
             JOIN tenants t ON ak.tenant_id = t.id \
             WHERE ak.key_hash = $1 \
               AND ak.is_active = TRUE \
               AND t.is_active = TRUE \
               AND (ak.expires_at IS NULL OR ak.expires_at > NOW())",
        )
        .bind(&key_hash)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let key_id: Uuid = row.try_get("key_id")?;
        let tier: String = row.try_get("subscription_tier")?;
        let identity = TenantIdentity {
            tenant_id: row.try_get("tenant_id")?,
            tenant_name: row.try_get("tenant_name")?,
            key_id,
            scopes: row.try_get("scopes")?,
            tier: SubscriptionTier::parse_lossy(&tier),
        };

        // Best-effort; a miss here never fails authentication.
        if let Err(e) = sqlx::query("UPDATE api_keys SET last_used_at = NOW() WHERE id = $1")
            .bind(key_id)
            .execute(&self.pool)
            .await
        {
            tracing::warn!(error = %e, "last_used_at update failed");
        }

        self.cache.lock().insert(
            key_hash,
            CacheSlot {
                identity: identity.clone(),
                expires: Instant::now() + self.cache_ttl,
            },
        );
        Ok(Some(identity))
    }
}

/// Fixed key set for tests and single-node development.
#[derive(Default)]
pub struct StaticApiKeys {
    by_hash: HashMap<String, TenantIdentity>,
}

impl StaticApiKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a clear key for an identity.
    pub fn insert(&mut self, api_key: &str, identity: TenantIdentity) {
        self.by_hash.insert(hash_api_key(api_key), identity);
    }

    pub fn with_key(mut self, api_key: &str, identity: TenantIdentity) -> Self {
        self.insert(api_key, identity);
        self
    }
}

#[async_trait]
impl ApiKeyValidator for StaticApiKeys {
    async fn validate(&self, api_key: &str) -> Result<Option<TenantIdentity>, StoreError> {
        if !api_key.starts_with(API_KEY_PREFIX) {
            return Ok(None);
        }
        Ok(self.by_hash.get(&hash_api_key(api_key)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> TenantIdentity {
        TenantIdentity {
            tenant_id: Uuid::new_v4(),
            tenant_name: "acme".into(),
            key_id: Uuid::new_v4(),
            scopes: vec!["full".into()],
            tier: SubscriptionTier::Pro,
        }
    }

    #[test]
    fn test_generated_keys_carry_prefix() {
        let key = generate_api_key();
        assert!(key.starts_with(API_KEY_PREFIX));
        assert!(key.len() > 40);
    }

    #[test]
    fn test_hash_is_stable_and_hex() {
        let a = hash_api_key("hnt_abc");
        let b = hash_api_key("hnt_abc");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, hash_api_key("hnt_abd"));
    }

    #[tokio::test]
    async fn test_static_keys_validate() {
        let id = identity();
        let keys = StaticApiKeys::new().with_key("hnt_test_key", id.clone());

        let found = keys.validate("hnt_test_key").await.unwrap().unwrap();
        assert_eq!(found.tenant_id, id.tenant_id);

        assert!(keys.validate("hnt_wrong").await.unwrap().is_none());
        // Missing vendor prefix fails fast without lookup.
        assert!(keys.validate("sk_other_vendor").await.unwrap().is_none());
    }
}
