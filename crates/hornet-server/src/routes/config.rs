//! HORNET: Configuration Routes

use axum::extract::{Path, State};
use axum::Json;
use serde_json::json;

use hornet_engine::ThresholdUpdate;

use crate::auth::AuthedTenant;
use crate::error::ApiError;
use crate::state::AppState;

/// `GET /api/v1/config/thresholds`
pub async fn get_thresholds(
    AuthedTenant(_identity): AuthedTenant,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    let values = state.thresholds.get();
    Json(json!({
        "DISMISS": values.dismiss,
        "INVESTIGATE": values.investigate,
        "CONFIRM": values.confirm,
        "DETECTION": values.detection,
    }))
}

/// `PUT /api/v1/config/thresholds`: bounded 0..1.
pub async fn put_thresholds(
    AuthedTenant(identity): AuthedTenant,
    State(state): State<AppState>,
    Json(update): Json<ThresholdUpdate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let values = state.thresholds.update(update)?;

    if let Err(e) = state
        .audit
        .log_config_change(
            identity.tenant_id,
            &format!("key:{}", identity.key_id),
            "thresholds",
            json!({
                "DISMISS": values.dismiss,
                "INVESTIGATE": values.investigate,
                "CONFIRM": values.confirm,
                "DETECTION": values.detection,
            }),
        )
        .await
    {
        tracing::warn!(error = %e, "threshold audit failed");
    }

    Ok(Json(json!({
        "status": "updated",
        "thresholds": {
            "DISMISS": values.dismiss,
            "INVESTIGATE": values.investigate,
            "CONFIRM": values.confirm,
            "DETECTION": values.detection,
        }
    })))
}

/// `GET /api/v1/config/playbooks`
pub async fn playbooks(
    AuthedTenant(_identity): AuthedTenant,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    let playbooks = state.playbooks.all();
    Json(json!({
        "total": playbooks.len(),
        "playbooks": playbooks
            .iter()
            .map(|p| json!({
                "id": p.id,
                "name": p.name,
                "description": p.description,
                "triggers": p.triggers,
                "priority": p.priority,
                "auto_approve_all": p.auto_approve_all,
                "requires_oversight": p.requires_oversight,
                "steps_count": p.steps.len(),
            }))
            .collect::<Vec<_>>(),
    }))
}

/// `GET /api/v1/config/playbooks/{id}`
pub async fn playbook(
    AuthedTenant(_identity): AuthedTenant,
    State(state): State<AppState>,
    Path(playbook_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let playbook = state
        .playbooks
        .get(&playbook_id)
        .ok_or_else(ApiError::not_found)?;
    Ok(Json(
        serde_json::to_value(&playbook)
            .map_err(|e| ApiError::internal(e.to_string()))?,
    ))
}

/// `GET /api/v1/config/agents`
pub async fn agents(
    AuthedTenant(_identity): AuthedTenant,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    let names = state.registry.names();
    Json(json!({
        "total": names.len(),
        "agents": names
            .iter()
            .map(|name| json!({"name": name, "enabled": true}))
            .collect::<Vec<_>>(),
    }))
}
