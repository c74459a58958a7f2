//! HORNET: Dashboard Channel
//!
//! Authenticated, tenant-scoped WebSocket fan-out of incident-state and
//! finding events. A connection registers under its tenant after the
//! credential checks out and the URL tenant matches; frames published on
//! the bus realtime channel are routed to every socket of that tenant.
//! Dead sockets are dropped during broadcast.

use std::collections::HashMap;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, RawQuery, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use hornet_bus::EventBus;
use hornet_store::ApiKeyValidator;

use crate::auth::extract_api_key;
use crate::state::AppState;

/// Close code for a missing or invalid credential.
const CLOSE_UNAUTHENTICATED: u16 = 4001;
/// Close code for a URL tenant that does not match the credential.
const CLOSE_TENANT_MISMATCH: u16 = 4003;

type SocketSender = mpsc::UnboundedSender<String>;

/// Registry of dashboard sockets per tenant.
#[derive(Default)]
pub struct ConnectionManager {
    connections: Mutex<HashMap<Uuid, Vec<(Uuid, SocketSender)>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn connect(&self, tenant_id: Uuid, sender: SocketSender) -> Uuid {
        let socket_id = Uuid::new_v4();
        let mut connections = self.connections.lock();
        connections.entry(tenant_id).or_default().push((socket_id, sender));
        tracing::info!(%tenant_id, %socket_id, "dashboard socket connected");
        socket_id
    }

    fn disconnect(&self, tenant_id: Uuid, socket_id: Uuid) {
        let mut connections = self.connections.lock();
        if let Some(sockets) = connections.get_mut(&tenant_id) {
            sockets.retain(|(id, _)| *id != socket_id);
            if sockets.is_empty() {
                connections.remove(&tenant_id);
            }
        }
        tracing::info!(%tenant_id, %socket_id, "dashboard socket disconnected");
    }

    /// Send a frame to every socket of a tenant, dropping dead ones.
    pub fn broadcast_to_tenant(&self, tenant_id: Uuid, frame: &str) {
        let mut connections = self.connections.lock();
        if let Some(sockets) = connections.get_mut(&tenant_id) {
            sockets.retain(|(_, sender)| sender.send(frame.to_string()).is_ok());
            if sockets.is_empty() {
                connections.remove(&tenant_id);
            }
        }
    }

    pub fn connection_count(&self, tenant_id: Uuid) -> usize {
        self.connections
            .lock()
            .get(&tenant_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Send a reply to one specific socket of a tenant.
    fn send_to_socket(&self, tenant_id: Uuid, socket_id: Uuid, frame: &str) {
        let connections = self.connections.lock();
        if let Some(sockets) = connections.get(&tenant_id) {
            if let Some((_, sender)) = sockets.iter().find(|(id, _)| *id == socket_id) {
                let _ = sender.send(frame.to_string());
            }
        }
    }
}

/// Pump bus realtime frames into per-tenant dashboard sockets. Runs for
/// the process lifetime.
pub async fn run_realtime_pump(state: AppState) {
    loop {
        let mut rx = match state.bus.subscribe_realtime().await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::error!(error = %e, "realtime subscribe failed, retrying");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                continue;
            }
        };
        while let Some(frame) = rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(raw) => state.ws.broadcast_to_tenant(frame.tenant_id, &raw),
                Err(e) => tracing::warn!(error = %e, "realtime frame serialization failed"),
            }
        }
        tracing::warn!("realtime subscription ended, resubscribing");
    }
}

/// `GET /api/v1/ws/{tenant_id}?api_key=…`
pub async fn dashboard_ws(
    ws: WebSocketUpgrade,
    Path(tenant_id): Path<Uuid>,
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let api_key = extract_api_key(&headers, query.as_deref());
    ws.on_upgrade(move |socket| handle_dashboard_socket(socket, state, tenant_id, api_key))
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_dashboard_socket(
    socket: WebSocket,
    state: AppState,
    tenant_id: Uuid,
    api_key: Option<String>,
) {
    let identity = match api_key {
        Some(key) => state.validator.validate(&key).await.ok().flatten(),
        None => None,
    };
    let Some(identity) = identity else {
        tracing::warn!(%tenant_id, "dashboard auth failed");
        close_with(socket, CLOSE_UNAUTHENTICATED, "Authentication required").await;
        return;
    };
    if identity.tenant_id != tenant_id {
        tracing::warn!(%tenant_id, actual = %identity.tenant_id, "dashboard tenant mismatch");
        close_with(socket, CLOSE_TENANT_MISMATCH, "Tenant mismatch").await;
        return;
    }

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let socket_id = state.ws.connect(tenant_id, tx);

    // Outbound: broadcast frames to this socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    // Inbound: ping/pong and topic subscribe acknowledgements.
    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            if matches!(message, Message::Close(_)) {
                break;
            }
            continue;
        };
        let Ok(request) = serde_json::from_str::<serde_json::Value>(&text) else {
            continue;
        };
        let reply = match request.get("type").and_then(|t| t.as_str()) {
            Some("ping") => Some(json!({"type": "pong"})),
            Some("subscribe") => Some(json!({
                "type": "subscribed",
                "channel": request.get("channel"),
            })),
            _ => None,
        };
        if let Some(reply) = reply {
            state.ws.send_to_socket(tenant_id, socket_id, &reply.to_string());
        }
    }

    state.ws.disconnect(tenant_id, socket_id);
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_drops_dead_sockets() {
        let manager = ConnectionManager::new();
        let tenant = Uuid::new_v4();

        let (alive_tx, mut alive_rx) = mpsc::unbounded_channel();
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        drop(dead_rx);

        manager.connect(tenant, alive_tx);
        manager.connect(tenant, dead_tx);
        assert_eq!(manager.connection_count(tenant), 2);

        manager.broadcast_to_tenant(tenant, "{\"type\":\"x\"}");
        assert_eq!(manager.connection_count(tenant), 1);
        assert_eq!(alive_rx.try_recv().unwrap(), "{\"type\":\"x\"}");
    }

    #[test]
    fn test_broadcast_is_tenant_scoped() {
        let manager = ConnectionManager::new();
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        manager.connect(tenant_a, tx_a);
        manager.connect(tenant_b, tx_b);

        manager.broadcast_to_tenant(tenant_a, "frame-for-a");
        assert_eq!(rx_a.try_recv().unwrap(), "frame-for-a");
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_disconnect_removes_socket() {
        let manager = ConnectionManager::new();
        let tenant = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        let socket_id = manager.connect(tenant, tx);
        manager.disconnect(tenant, socket_id);
        assert_eq!(manager.connection_count(tenant), 0);
    }
}
