//! HORNET: Edge Gateway
//!
//! WebSocket channel for remote log-shippers. A shipper authenticates with
//! its API key, registers with hostname/version/capabilities, then streams
//! log batches, heartbeats, and action results. Outbound actions are
//! HMAC-signed, time-bounded, and nonce-protected; a result for an unknown
//! or expired action id is rejected.

use std::collections::{HashMap, HashSet};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::response::Response;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use uuid::Uuid;

use hornet_bus::EventBus;
use hornet_store::ApiKeyValidator;
use hornet_types::{Entity, Event, HornetError, Severity};

use crate::auth::extract_api_key;
use crate::state::AppState;

const CLOSE_UNAUTHENTICATED: u16 = 4001;
const CLOSE_PROTOCOL: u16 = 4002;
const CLOSE_REGISTRATION_TIMEOUT: u16 = 4003;

type HmacSha256 = Hmac<Sha256>;

/// Why a signed action failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedActionError {
    BadSignature,
    Expired,
    NonceReplayed,
}

/// An action the core asks a remote shipper to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedAction {
    pub action_id: Uuid,
    pub tenant_id: Uuid,
    pub incident_id: Uuid,
    pub action_type: String,
    pub target: String,
    pub parameters: serde_json::Value,
    pub expires_at: DateTime<Utc>,
    pub nonce: String,
    #[serde(default)]
    pub signature: String,
}

impl SignedAction {
    /// Canonical JSON of every field except the signature. serde_json
    /// serializes map keys sorted, which both sides rely on.
    fn canonical(&self) -> String {
        json!({
            "action_id": self.action_id,
            "tenant_id": self.tenant_id,
            "incident_id": self.incident_id,
            "action_type": self.action_type,
            "target": self.target,
            "parameters": self.parameters,
            "expires_at": self.expires_at,
            "nonce": self.nonce,
        })
        .to_string()
    }

    /// Compute and attach the HMAC-SHA256 signature.
    pub fn sign(&mut self, secret: &str) {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(self.canonical().as_bytes());
        self.signature = hex::encode(mac.finalize().into_bytes());
    }

    /// Receiver-side verification: signature, expiry, nonce replay. The
    /// nonce set is mutated only when everything else checks out.
    pub fn verify(
        &self,
        secret: &str,
        now: DateTime<Utc>,
        seen_nonces: &mut HashSet<String>,
    ) -> Result<(), SignedActionError> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(self.canonical().as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());
        if expected.as_bytes().ct_eq(self.signature.as_bytes()).unwrap_u8() != 1 {
            return Err(SignedActionError::BadSignature);
        }
        if now > self.expires_at {
            return Err(SignedActionError::Expired);
        }
        if !seen_nonces.insert(self.nonce.clone()) {
            return Err(SignedActionError::NonceReplayed);
        }
        Ok(())
    }
}

/// A registered remote shipper.
#[derive(Debug, Clone, Serialize)]
pub struct EdgeAgentInfo {
    pub agent_id: String,
    pub tenant_id: Uuid,
    pub hostname: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

struct EdgeAgentSlot {
    info: EdgeAgentInfo,
    sender: mpsc::UnboundedSender<String>,
}

/// Manages edge shipper connections and pending signed actions.
pub struct EdgeGateway {
    agents: Mutex<HashMap<String, EdgeAgentSlot>>,
    pending_actions: Mutex<HashMap<Uuid, SignedAction>>,
    action_secret: String,
    action_ttl: chrono::Duration,
}

impl EdgeGateway {
    pub fn new(action_secret: impl Into<String>, action_ttl: std::time::Duration) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            pending_actions: Mutex::new(HashMap::new()),
            action_secret: action_secret.into(),
            action_ttl: chrono::Duration::from_std(action_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
        }
    }

    pub fn connected_count(&self) -> usize {
        self.agents.lock().len()
    }

    pub fn agents_for_tenant(&self, tenant_id: Uuid) -> Vec<EdgeAgentInfo> {
        self.agents
            .lock()
            .values()
            .filter(|slot| slot.info.tenant_id == tenant_id)
            .map(|slot| slot.info.clone())
            .collect()
    }

    fn register(
        &self,
        tenant_id: Uuid,
        hostname: String,
        version: String,
        capabilities: Vec<String>,
        sender: mpsc::UnboundedSender<String>,
    ) -> EdgeAgentInfo {
        let now = Utc::now();
        let info = EdgeAgentInfo {
            agent_id: format!("edge_{}", Uuid::new_v4().simple()),
            tenant_id,
            hostname,
            version,
            capabilities,
            connected_at: now,
            last_heartbeat: now,
        };
        tracing::info!(
            agent_id = %info.agent_id,
            %tenant_id,
            hostname = %info.hostname,
            "edge shipper registered"
        );
        self.agents
            .lock()
            .insert(info.agent_id.clone(), EdgeAgentSlot { info: info.clone(), sender });
        info
    }

    fn unregister(&self, agent_id: &str) {
        if self.agents.lock().remove(agent_id).is_some() {
            tracing::info!(agent_id, "edge shipper unregistered");
        }
    }

    fn heartbeat(&self, agent_id: &str) {
        if let Some(slot) = self.agents.lock().get_mut(agent_id) {
            slot.info.last_heartbeat = Utc::now();
        }
    }

    /// Build, sign, and track an outbound action.
    pub fn create_signed_action(
        &self,
        tenant_id: Uuid,
        incident_id: Uuid,
        action_type: &str,
        target: &str,
        parameters: serde_json::Value,
    ) -> SignedAction {
        let mut action = SignedAction {
            action_id: Uuid::new_v4(),
            tenant_id,
            incident_id,
            action_type: action_type.to_string(),
            target: target.to_string(),
            parameters,
            expires_at: Utc::now() + self.action_ttl,
            nonce: Uuid::new_v4().simple().to_string(),
            signature: String::new(),
        };
        action.sign(&self.action_secret);
        self.pending_actions.lock().insert(action.action_id, action.clone());
        tracing::info!(
            action_id = %action.action_id,
            %tenant_id,
            action_type,
            target,
            "edge action created"
        );
        action
    }

    /// Send a pending action to every shipper of its tenant. Returns how
    /// many sockets accepted the frame.
    pub fn broadcast_action(&self, action: &SignedAction) -> usize {
        let frame = json!({"type": "action_request", "action": action}).to_string();
        let mut sent = 0;
        let agents = self.agents.lock();
        for slot in agents
            .values()
            .filter(|slot| slot.info.tenant_id == action.tenant_id)
        {
            if slot.sender.send(frame.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Correlate an action result. Unknown or expired ids are rejected.
    pub fn handle_action_result(
        &self,
        agent_id: &str,
        action_id: Uuid,
        success: bool,
        message: &str,
    ) -> Result<(), HornetError> {
        let mut pending = self.pending_actions.lock();
        let Some(action) = pending.get(&action_id) else {
            return Err(HornetError::Validation(format!(
                "unknown action id {action_id}"
            )));
        };
        if Utc::now() > action.expires_at {
            pending.remove(&action_id);
            return Err(HornetError::Validation(format!(
                "action {action_id} expired"
            )));
        }
        pending.remove(&action_id);
        tracing::info!(agent_id, %action_id, success, message, "edge action result");
        Ok(())
    }

    /// Drop expired pending actions. Returns the count removed.
    pub fn expire_pending(&self) -> usize {
        let now = Utc::now();
        let mut pending = self.pending_actions.lock();
        let before = pending.len();
        pending.retain(|_, action| action.expires_at >= now);
        before - pending.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending_actions.lock().len()
    }
}

#[derive(Debug, Deserialize)]
struct RegisterFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    capabilities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EdgeLogEvent {
    #[serde(default)]
    event_type: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    source_type: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    entities: Vec<Entity>,
    #[serde(default)]
    raw: serde_json::Value,
}

/// `GET /api/v1/edge/connect?api_key=…`
pub async fn edge_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let api_key = extract_api_key(&headers, query.as_deref());
    ws.on_upgrade(move |socket| handle_edge_socket(socket, state, api_key))
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_edge_socket(socket: WebSocket, state: AppState, api_key: Option<String>) {
    let identity = match api_key {
        Some(key) => state.validator.validate(&key).await.ok().flatten(),
        None => None,
    };
    let Some(identity) = identity else {
        tracing::warn!("edge auth failed");
        close_with(socket, CLOSE_UNAUTHENTICATED, "Authentication required").await;
        return;
    };
    let tenant_id = identity.tenant_id;

    let (mut sink, mut stream) = socket.split();

    // First frame must register within 10 seconds.
    let first = tokio::time::timeout(std::time::Duration::from_secs(10), stream.next()).await;
    let register: RegisterFrame = match first {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(_) => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_PROTOCOL,
                        reason: "Expected register message".into(),
                    })))
                    .await;
                return;
            }
        },
        Ok(_) => {
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_PROTOCOL,
                    reason: "Expected register message".into(),
                })))
                .await;
            return;
        }
        Err(_) => {
            tracing::warn!("edge registration timeout");
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_REGISTRATION_TIMEOUT,
                    reason: "Registration timeout".into(),
                })))
                .await;
            return;
        }
    };
    if register.frame_type != "register" {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_PROTOCOL,
                reason: "Expected register message".into(),
            })))
            .await;
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let info = state.edge.register(
        tenant_id,
        register.hostname.unwrap_or_else(|| "unknown".into()),
        register.version.unwrap_or_else(|| "unknown".into()),
        register.capabilities,
        tx,
    );
    let agent_id = info.agent_id.clone();

    let registered = json!({
        "type": "registered",
        "agent_id": agent_id,
        "tenant_id": tenant_id,
        "server_time": Utc::now(),
    });
    if sink.send(Message::Text(registered.to_string().into())).await.is_err() {
        state.edge.unregister(&agent_id);
        return;
    }

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(frame) = outbound else { break };
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                let Some(Ok(message)) = inbound else { break };
                let Message::Text(text) = message else {
                    if matches!(message, Message::Close(_)) {
                        break;
                    }
                    continue;
                };
                let Ok(frame) = serde_json::from_str::<serde_json::Value>(&text) else {
                    continue;
                };
                let reply = handle_edge_frame(&state, &agent_id, tenant_id, &info, frame).await;
                if let Some(reply) = reply {
                    if sink.send(Message::Text(reply.to_string().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    state.edge.unregister(&agent_id);
}

async fn handle_edge_frame(
    state: &AppState,
    agent_id: &str,
    tenant_id: Uuid,
    info: &EdgeAgentInfo,
    frame: serde_json::Value,
) -> Option<serde_json::Value> {
    match frame.get("type").and_then(|t| t.as_str()) {
        Some("heartbeat") => {
            state.edge.heartbeat(agent_id);
            Some(json!({"type": "heartbeat_ack", "server_time": Utc::now()}))
        }
        Some("ping") => Some(json!({"type": "pong"})),
        Some("log_batch") => {
            let batch_id = frame
                .get("batch_id")
                .and_then(|b| b.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let events = frame
                .get("events")
                .and_then(|e| e.as_array())
                .cloned()
                .unwrap_or_default();

            let mut accepted = 0;
            for raw_event in events {
                let parsed: EdgeLogEvent =
                    serde_json::from_value(raw_event.clone()).unwrap_or(EdgeLogEvent {
                        event_type: None,
                        source: None,
                        source_type: None,
                        severity: None,
                        timestamp: None,
                        entities: Vec::new(),
                        raw: raw_event,
                    });
                let event = normalize_edge_event(tenant_id, agent_id, &info.hostname, parsed);
                match serde_json::to_value(&event) {
                    Ok(payload) => match state.bus.publish_event(&payload).await {
                        Ok(_) => accepted += 1,
                        Err(e) => tracing::error!(error = %e, "edge event publish failed"),
                    },
                    Err(e) => tracing::error!(error = %e, "edge event serialization failed"),
                }
            }
            tracing::info!(agent_id, %tenant_id, batch_id = %batch_id, accepted, "edge log batch");
            Some(json!({
                "type": "batch_ack",
                "batch_id": batch_id,
                "accepted": accepted,
                "timestamp": Utc::now(),
            }))
        }
        Some("action_result") => {
            let action_id = frame
                .get("action_id")
                .and_then(|a| a.as_str())
                .and_then(|a| Uuid::parse_str(a).ok());
            let success = frame.get("success").and_then(|s| s.as_bool()).unwrap_or(false);
            let message = frame.get("message").and_then(|m| m.as_str()).unwrap_or("");
            match action_id {
                Some(action_id) => match state
                    .edge
                    .handle_action_result(agent_id, action_id, success, message)
                {
                    Ok(()) => Some(json!({"type": "action_result_ack", "action_id": action_id})),
                    Err(e) => Some(json!({"type": "error", "detail": e.to_string()})),
                },
                None => Some(json!({"type": "error", "detail": "missing action_id"})),
            }
        }
        other => {
            tracing::warn!(agent_id, message_type = ?other, "unknown edge message");
            None
        }
    }
}

/// Normalize one shipped log line into the event schema.
fn normalize_edge_event(
    tenant_id: Uuid,
    agent_id: &str,
    hostname: &str,
    parsed: EdgeLogEvent,
) -> Event {
    Event {
        id: Uuid::new_v4(),
        tenant_id,
        incident_id: Uuid::new_v4(),
        timestamp: parsed.timestamp.unwrap_or_else(Utc::now),
        source: parsed.source.unwrap_or_else(|| hostname.to_string()),
        source_type: parsed.source_type.unwrap_or_else(|| "edge_agent".into()),
        event_type: parsed.event_type.unwrap_or_else(|| "unknown".into()),
        severity: parsed
            .severity
            .map(|s| Severity::parse_lossy(&s))
            .unwrap_or(Severity::Low),
        entities: parsed.entities,
        raw_payload: json!({"edge_agent_id": agent_id, "raw": parsed.raw}),
    }
}

// ---------------------------------------------------------------------------
// HTTP management surface
// ---------------------------------------------------------------------------

use crate::auth::AuthedTenant;
use crate::error::ApiError;
use axum::Json;

/// `GET /api/v1/edge/status`
pub async fn status(
    AuthedTenant(identity): AuthedTenant,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    let agents = state.edge.agents_for_tenant(identity.tenant_id);
    Json(json!({
        "connected_agents": agents.len(),
        "agents": agents,
    }))
}

#[derive(Debug, Deserialize)]
pub struct EdgeActionRequest {
    pub incident_id: Uuid,
    pub action_type: String,
    pub target: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// `POST /api/v1/edge/action`: sign and broadcast an action to every
/// shipper of the tenant.
pub async fn send_action(
    AuthedTenant(identity): AuthedTenant,
    State(state): State<AppState>,
    Json(request): Json<EdgeActionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let action = state.edge.create_signed_action(
        identity.tenant_id,
        request.incident_id,
        &request.action_type,
        &request.target,
        request.parameters,
    );
    let sent = state.edge.broadcast_action(&action);

    if let Err(e) = state
        .audit
        .log_action_execution(
            identity.tenant_id,
            "api",
            &request.action_type,
            action.action_id,
            "dispatched_to_edge",
        )
        .await
    {
        tracing::warn!(error = %e, "edge action audit failed");
    }

    Ok(Json(json!({
        "action_id": action.action_id,
        "sent_to_agents": sent,
        "expires_at": action.expires_at,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn gateway() -> EdgeGateway {
        EdgeGateway::new("edge-secret", Duration::from_secs(60))
    }

    #[test]
    fn test_signed_action_roundtrip() {
        let gw = gateway();
        let action = gw.create_signed_action(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "block_ip",
            "1.2.3.4",
            json!({"duration": 60}),
        );

        let mut nonces = HashSet::new();
        assert!(action.verify("edge-secret", Utc::now(), &mut nonces).is_ok());
    }

    #[test]
    fn test_verification_failures() {
        let gw = gateway();
        let action = gw.create_signed_action(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "block_ip",
            "1.2.3.4",
            json!({}),
        );
        let mut nonces = HashSet::new();

        // Wrong secret.
        assert_eq!(
            action.verify("wrong-secret", Utc::now(), &mut nonces),
            Err(SignedActionError::BadSignature)
        );

        // Tampered field.
        let mut tampered = action.clone();
        tampered.target = "5.6.7.8".into();
        assert_eq!(
            tampered.verify("edge-secret", Utc::now(), &mut nonces),
            Err(SignedActionError::BadSignature)
        );

        // Expired.
        assert_eq!(
            action.verify(
                "edge-secret",
                Utc::now() + chrono::Duration::seconds(120),
                &mut nonces
            ),
            Err(SignedActionError::Expired)
        );

        // Replay: first use passes, second is rejected.
        assert!(action.verify("edge-secret", Utc::now(), &mut nonces).is_ok());
        assert_eq!(
            action.verify("edge-secret", Utc::now(), &mut nonces),
            Err(SignedActionError::NonceReplayed)
        );
    }

    #[test]
    fn test_action_result_correlation() {
        let gw = gateway();
        let action = gw.create_signed_action(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "block_ip",
            "1.2.3.4",
            json!({}),
        );
        assert_eq!(gw.pending_count(), 1);

        // Unknown id rejected.
        assert!(gw
            .handle_action_result("edge_x", Uuid::new_v4(), true, "")
            .is_err());
        // Known id accepted once.
        assert!(gw
            .handle_action_result("edge_x", action.action_id, true, "done")
            .is_ok());
        assert_eq!(gw.pending_count(), 0);
        // Second result for the same id is unknown.
        assert!(gw
            .handle_action_result("edge_x", action.action_id, true, "")
            .is_err());
    }

    #[test]
    fn test_expired_result_rejected() {
        let gw = EdgeGateway::new("edge-secret", Duration::from_secs(0));
        let action = gw.create_signed_action(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "block_ip",
            "1.2.3.4",
            json!({}),
        );
        std::thread::sleep(Duration::from_millis(10));
        assert!(gw
            .handle_action_result("edge_x", action.action_id, true, "")
            .is_err());
        assert_eq!(gw.pending_count(), 0);
    }

    #[test]
    fn test_expire_pending_sweeps() {
        let gw = EdgeGateway::new("edge-secret", Duration::from_secs(0));
        gw.create_signed_action(Uuid::new_v4(), Uuid::new_v4(), "block_ip", "1.1.1.1", json!({}));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(gw.expire_pending(), 1);
    }

    #[test]
    fn test_normalize_edge_event_defaults() {
        let tenant = Uuid::new_v4();
        let event = normalize_edge_event(
            tenant,
            "edge_abc",
            "sensor-01",
            EdgeLogEvent {
                event_type: Some("auth.login_failure".into()),
                source: None,
                source_type: None,
                severity: Some("high".into()),
                timestamp: None,
                entities: vec![Entity::new("ip", "9.9.9.9")],
                raw: json!({"line": "failed login"}),
            },
        );
        assert_eq!(event.tenant_id, tenant);
        assert_eq!(event.source, "sensor-01");
        assert_eq!(event.source_type, "edge_agent");
        assert_eq!(event.severity, Severity::High);
        assert_eq!(event.raw_payload["edge_agent_id"], "edge_abc");
    }
}
