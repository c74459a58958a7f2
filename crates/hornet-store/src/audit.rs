//! HORNET: Audit Log
//!
//! Insert-only, HMAC-signed audit records. The signature covers the
//! canonical JSON of the entry without the signature field; serde_json
//! serializes map keys in sorted order, which is the canonical form.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use uuid::Uuid;

use crate::{Storage, StoreError};

type HmacSha256 = Hmac<Sha256>;

/// One signed audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Who acted (user id, agent name, "system")
    pub actor: String,
    /// Dotted action name (auth.login, config.update, action.block_ip)
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<Uuid>,
    pub details: serde_json::Value,
    pub ip_address: Option<String>,
    /// HMAC-SHA256 over the canonical entry, hex encoded
    pub signature: String,
}

impl AuditEntry {
    /// Canonical serialization: every field except the signature, keys
    /// sorted by serde_json's map ordering.
    fn canonical(&self) -> String {
        json!({
            "id": self.id,
            "tenant_id": self.tenant_id,
            "timestamp": self.timestamp,
            "actor": self.actor,
            "action": self.action,
            "resource_type": self.resource_type,
            "resource_id": self.resource_id,
            "details": self.details,
            "ip_address": self.ip_address,
        })
        .to_string()
    }

    /// Compute and attach the signature.
    pub fn sign(&mut self, key: &[u8]) {
        let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(self.canonical().as_bytes());
        self.signature = hex::encode(mac.finalize().into_bytes());
    }

    /// Verify the signature in constant time.
    pub fn verify(&self, key: &[u8]) -> bool {
        let Ok(raw) = hex::decode(&self.signature) else {
            return false;
        };
        let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(self.canonical().as_bytes());
        mac.verify_slice(&raw).is_ok()
    }
}

/// Writes signed audit entries through the storage layer.
pub struct AuditLogger {
    storage: Arc<dyn Storage>,
    signing_key: Vec<u8>,
}

impl AuditLogger {
    pub fn new(storage: Arc<dyn Storage>, signing_key: impl Into<Vec<u8>>) -> Self {
        Self {
            storage,
            signing_key: signing_key.into(),
        }
    }

    /// Record one audit event.
    #[allow(clippy::too_many_arguments)]
    pub async fn log(
        &self,
        tenant_id: Uuid,
        actor: &str,
        action: &str,
        resource_type: &str,
        resource_id: Option<Uuid>,
        details: serde_json::Value,
        ip_address: Option<String>,
    ) -> Result<(), StoreError> {
        let mut entry = AuditEntry {
            id: Uuid::new_v4(),
            tenant_id,
            timestamp: Utc::now(),
            actor: actor.to_string(),
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id,
            details,
            ip_address,
            signature: String::new(),
        };
        entry.sign(&self.signing_key);

        tracing::info!(
            %tenant_id,
            actor,
            action,
            resource_type,
            resource_id = ?resource_id,
            "audit event"
        );
        self.storage.append_audit(&entry).await
    }

    /// Authentication success or failure.
    pub async fn log_auth_event(
        &self,
        tenant_id: Uuid,
        actor: &str,
        outcome: &str,
        success: bool,
        ip_address: Option<String>,
    ) -> Result<(), StoreError> {
        self.log(
            tenant_id,
            actor,
            &format!("auth.{outcome}"),
            "credential",
            None,
            json!({"success": success}),
            ip_address,
        )
        .await
    }

    /// Configuration change.
    pub async fn log_config_change(
        &self,
        tenant_id: Uuid,
        actor: &str,
        config_type: &str,
        changes: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.log(
            tenant_id,
            actor,
            "config.update",
            "config",
            None,
            json!({"config_type": config_type, "changes": changes}),
            None,
        )
        .await
    }

    /// Action executed against an external system.
    pub async fn log_action_execution(
        &self,
        tenant_id: Uuid,
        actor: &str,
        action_type: &str,
        action_id: Uuid,
        outcome: &str,
    ) -> Result<(), StoreError> {
        self.log(
            tenant_id,
            actor,
            &format!("action.{action_type}"),
            "action",
            Some(action_id),
            json!({"result": outcome}),
            None,
        )
        .await
    }

    /// Human override of an automated decision.
    pub async fn log_human_override(
        &self,
        tenant_id: Uuid,
        actor: &str,
        incident_id: Uuid,
        override_type: &str,
        justification: &str,
    ) -> Result<(), StoreError> {
        self.log(
            tenant_id,
            actor,
            &format!("override.{override_type}"),
            "incident",
            Some(incident_id),
            json!({"justification": justification}),
            None,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStorage;

    fn entry() -> AuditEntry {
        AuditEntry {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor: "analyst@acme".into(),
            action: "config.update".into(),
            resource_type: "config".into(),
            resource_id: None,
            details: json!({"changes": {"DISMISS": 0.4}}),
            ip_address: Some("10.0.0.9".into()),
            signature: String::new(),
        }
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let mut e = entry();
        e.sign(b"secret");
        assert!(e.verify(b"secret"));
        assert!(!e.verify(b"other-secret"));
    }

    #[test]
    fn test_tampering_breaks_signature() {
        let mut e = entry();
        e.sign(b"secret");
        e.actor = "intruder".into();
        assert!(!e.verify(b"secret"));
    }

    #[tokio::test]
    async fn test_logger_persists_signed_entries() {
        let storage = Arc::new(MemoryStorage::new());
        let logger = AuditLogger::new(storage.clone(), b"secret".to_vec());
        let tenant = Uuid::new_v4();

        logger
            .log_auth_event(tenant, "key:abc", "login", true, None)
            .await
            .unwrap();
        logger
            .log_human_override(tenant, "analyst", Uuid::new_v4(), "approve", "looks right")
            .await
            .unwrap();

        let entries = storage.audit_entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.verify(b"secret")));
        assert_eq!(entries[0].action, "auth.login");
        assert_eq!(entries[1].action, "override.approve");
    }
}
