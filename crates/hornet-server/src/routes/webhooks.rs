//! HORNET: Webhook Ingest Routes
//!
//! Source-specific envelopes normalized into the event schema and
//! published to the bus. A request authenticates with a tenant API key, or
//! with `X-HORNET-Signature: sha256=<hex>` over the raw body plus a
//! `tenant_id` field in the envelope.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use hornet_bus::EventBus;
use hornet_engine::verify_signature;
use hornet_store::ApiKeyValidator;
use hornet_types::{Entity, Event, Severity};

use crate::auth::extract_api_key;
use crate::error::ApiError;
use crate::state::AppState;

/// Resolve the tenant for a webhook request.
async fn webhook_tenant(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
    envelope: &Value,
) -> Result<Uuid, ApiError> {
    if let Some(api_key) = extract_api_key(headers, None) {
        if let Some(identity) = state.validator.validate(&api_key).await? {
            return Ok(identity.tenant_id);
        }
        return Err(ApiError::unauthorized("invalid API key"));
    }

    let signature = headers
        .get("X-HORNET-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("API key or signature required"))?;
    if !verify_signature(body, signature, &state.config.webhook_secret) {
        return Err(ApiError::unauthorized("invalid webhook signature"));
    }
    envelope
        .get("tenant_id")
        .and_then(|t| t.as_str())
        .and_then(|t| Uuid::parse_str(t).ok())
        .ok_or_else(|| ApiError::validation("signed webhook requires a tenant_id field"))
}

fn parse_body(body: &Bytes) -> Result<Value, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::validation(format!("invalid JSON: {e}")))
}

async fn publish(state: &AppState, event: Event) -> Result<Uuid, ApiError> {
    let id = event.id;
    let payload = serde_json::to_value(&event)
        .map_err(|e| ApiError::internal(format!("event serialization failed: {e}")))?;
    state.bus.publish_event(&payload).await?;
    Ok(id)
}

fn base_event(tenant_id: Uuid, source: &str, source_type: &str) -> Event {
    Event {
        id: Uuid::new_v4(),
        tenant_id,
        incident_id: Uuid::new_v4(),
        timestamp: Utc::now(),
        source: source.to_string(),
        source_type: source_type.to_string(),
        event_type: "unknown".into(),
        severity: Severity::Low,
        entities: Vec::new(),
        raw_payload: Value::Null,
    }
}

/// `POST /api/v1/webhooks/cloudflare`: WAF security events.
pub async fn cloudflare(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let envelope = parse_body(&body)?;
    let tenant_id = webhook_tenant(&state, &headers, &body, &envelope).await?;

    let entries = envelope
        .get("data")
        .and_then(|d| d.as_array())
        .cloned()
        .unwrap_or_else(|| vec![envelope.clone()]);

    let mut processed = 0;
    for entry in entries {
        let action = entry.get("Action").and_then(|a| a.as_str()).unwrap_or("unknown");
        let mut event = base_event(tenant_id, "cloudflare", "waf");
        event.event_type = format!("network.{action}");
        event.severity = if action == "block" {
            Severity::Medium
        } else {
            Severity::Low
        };
        if let Some(ip) = entry.get("ClientIP").and_then(|v| v.as_str()) {
            event.entities.push(Entity::new("ip", ip));
        }
        if let Some(host) = entry.get("ClientRequestHost").and_then(|v| v.as_str()) {
            event.entities.push(Entity::new("domain", host));
        }
        event.raw_payload = entry;
        publish(&state, event).await?;
        processed += 1;
    }

    Ok(Json(json!({"status": "ok", "events_processed": processed})))
}

/// `POST /api/v1/webhooks/aws-sns`: CloudTrail / GuardDuty notifications.
pub async fn aws_sns(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let envelope = parse_body(&body)?;
    let tenant_id = webhook_tenant(&state, &headers, &body, &envelope).await?;

    // Subscription handshakes carry a confirmation URL instead of records.
    if envelope.get("Type").and_then(|t| t.as_str()) == Some("SubscriptionConfirmation") {
        return Ok(Json(json!({
            "status": "subscription_confirmation_required",
            "url": envelope.get("SubscribeURL"),
        })));
    }

    let message: Value = envelope
        .get("Message")
        .and_then(|m| m.as_str())
        .and_then(|m| serde_json::from_str(m).ok())
        .unwrap_or_else(|| envelope.clone());
    let records = message
        .get("Records")
        .and_then(|r| r.as_array())
        .cloned()
        .unwrap_or_else(|| vec![message.clone()]);

    let mut processed = 0;
    for record in records {
        let event_name = record
            .get("eventName")
            .and_then(|e| e.as_str())
            .unwrap_or("unknown")
            .to_string();
        let lowered = event_name.to_lowercase();
        let severity = if ["iam", "security", "policy"].iter().any(|k| lowered.contains(k)) {
            Severity::High
        } else if ["delete", "remove", "terminate"].iter().any(|k| lowered.contains(k)) {
            Severity::Medium
        } else {
            Severity::Low
        };

        let mut event = base_event(
            tenant_id,
            record
                .get("eventSource")
                .and_then(|s| s.as_str())
                .unwrap_or("aws"),
            "cloudtrail",
        );
        event.event_type = format!("cloud.{event_name}");
        event.severity = severity;
        if let Some(user) = record
            .pointer("/userIdentity/userName")
            .and_then(|u| u.as_str())
        {
            event.entities.push(Entity::new("user", user));
        }
        if let Some(ip) = record.get("sourceIPAddress").and_then(|i| i.as_str()) {
            event.entities.push(Entity::new("ip", ip));
        }
        event.raw_payload = record;
        publish(&state, event).await?;
        processed += 1;
    }

    Ok(Json(json!({"status": "ok", "events_processed": processed})))
}

/// `POST /api/v1/webhooks/syslog`
pub async fn syslog(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let envelope = parse_body(&body)?;
    let tenant_id = webhook_tenant(&state, &headers, &body, &envelope).await?;

    let mut event = base_event(
        tenant_id,
        envelope
            .get("hostname")
            .and_then(|h| h.as_str())
            .unwrap_or("unknown"),
        "syslog",
    );
    event.event_type = format!(
        "{}.{}",
        envelope.get("facility").and_then(|f| f.as_str()).unwrap_or("system"),
        envelope.get("severity").and_then(|s| s.as_str()).unwrap_or("info"),
    );
    event.severity = envelope
        .get("severity")
        .and_then(|s| s.as_str())
        .map(Severity::parse_lossy)
        .unwrap_or(Severity::Low);
    event.raw_payload = envelope;
    let id = publish(&state, event).await?;

    Ok(Json(json!({"status": "ok", "events_processed": 1, "event_id": id})))
}

/// `POST /api/v1/webhooks/generic`: pre-normalized envelope.
pub async fn generic(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let envelope = parse_body(&body)?;
    let tenant_id = webhook_tenant(&state, &headers, &body, &envelope).await?;

    let mut event = base_event(
        tenant_id,
        envelope.get("source").and_then(|s| s.as_str()).unwrap_or("webhook"),
        envelope
            .get("source_type")
            .and_then(|s| s.as_str())
            .unwrap_or("generic"),
    );
    event.event_type = envelope
        .get("event_type")
        .and_then(|e| e.as_str())
        .unwrap_or("unknown")
        .to_string();
    event.severity = envelope
        .get("severity")
        .and_then(|s| s.as_str())
        .map(Severity::parse_lossy)
        .unwrap_or(Severity::Low);
    event.entities = envelope
        .get("entities")
        .and_then(|e| serde_json::from_value(e.clone()).ok())
        .unwrap_or_default();
    event.raw_payload = envelope;
    let id = publish(&state, event).await?;

    Ok(Json(json!({"status": "ok", "event_id": id})))
}
