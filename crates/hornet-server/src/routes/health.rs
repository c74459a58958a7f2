//! HORNET: Health and Status Routes
//!
//! Unauthenticated liveness and readiness surface.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use hornet_bus::EventBus;
use hornet_store::Storage;

use crate::state::AppState;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// `GET /api/v1/health`
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let bus_healthy = state.bus.health_check().await;
    let storage_healthy = state.storage.health_check().await;
    let queue_depth = state.bus.queue_depth().await.unwrap_or(0);
    let (retry_pending, dlq_len) = state.retry_queue.stats();

    Json(json!({
        "status": if bus_healthy && storage_healthy { "healthy" } else { "degraded" },
        "version": VERSION,
        "timestamp": chrono::Utc::now(),
        "components": {
            "bus": if bus_healthy { "healthy" } else { "unhealthy" },
            "storage": if storage_healthy { "healthy" } else { "unhealthy" },
        },
        "metrics": {
            "queue_depth": queue_depth,
            "retry_pending": retry_pending,
            "dlq": dlq_len,
            "edge_agents": state.edge.connected_count(),
        },
    }))
}

/// `GET /api/v1/health/ready`: readiness from the last health probe.
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let snapshot = state.health.snapshot();
    let ready = state.health.ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({"ready": ready, "components": snapshot})))
}

/// `GET /api/v1/health/live`
pub async fn live() -> Json<serde_json::Value> {
    Json(json!({"live": true}))
}

/// `GET /api/v1/health/agents`
pub async fn agents(State(state): State<AppState>) -> Json<serde_json::Value> {
    let names = state.registry.names();
    Json(json!({
        "total_agents": names.len(),
        "agents": names
            .iter()
            .map(|name| (name.clone(), json!({"status": "ready"})))
            .collect::<serde_json::Map<String, serde_json::Value>>(),
    }))
}

/// `GET /api/v1/dispatcher/status`
pub async fn dispatcher_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let status = state.dispatcher.status();
    let queue_depth = state.bus.queue_depth().await.unwrap_or(0);
    let pending_acks = state
        .bus
        .pending_count(hornet_bus::DISPATCHER_GROUP)
        .await
        .unwrap_or(0);

    Json(json!({
        "dispatcher": status,
        "queue_depth": queue_depth,
        "pending_acks": pending_acks,
    }))
}

/// `GET /`
pub async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "name": "HORNET",
        "version": VERSION,
        "status": "operational",
        "health": "/api/v1/health",
        "dispatcher": "/api/v1/dispatcher/status",
        "metrics": "/metrics",
    }))
}
