//! HORNET: Incident Routes

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use hornet_store::Storage;
use hornet_types::{HumanResponse, IncidentFilter};

use crate::auth::AuthedTenant;
use crate::error::ApiError;
use crate::state::AppState;

/// `GET /api/v1/incidents`
pub async fn list(
    AuthedTenant(identity): AuthedTenant,
    State(state): State<AppState>,
    Query(filter): Query<IncidentFilter>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = filter.limit.unwrap_or(50).clamp(1, 100);
    let filter = IncidentFilter {
        limit: Some(limit),
        ..filter
    };
    let incidents = state.storage.list_incidents(identity.tenant_id, &filter).await?;
    Ok(Json(json!({
        "data": incidents,
        "meta": {
            "total": incidents.len(),
            "limit": limit,
            "offset": filter.offset.unwrap_or(0),
        }
    })))
}

/// `GET /api/v1/incidents/{id}`: full incident with findings and actions.
/// Missing and cross-tenant both read as 404.
pub async fn get_one(
    AuthedTenant(identity): AuthedTenant,
    State(state): State<AppState>,
    Path(incident_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let incident = state
        .storage
        .get_incident(identity.tenant_id, incident_id)
        .await?
        .ok_or_else(ApiError::not_found)?;
    let findings = state
        .storage
        .get_findings(identity.tenant_id, incident_id)
        .await?;
    let actions = state
        .storage
        .list_actions(identity.tenant_id, incident_id)
        .await?;

    Ok(Json(json!({
        "incident": incident,
        "findings": findings,
        "actions": actions,
    })))
}

/// `GET /api/v1/incidents/{id}/timeline`
pub async fn timeline(
    AuthedTenant(identity): AuthedTenant,
    State(state): State<AppState>,
    Path(incident_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .storage
        .get_incident(identity.tenant_id, incident_id)
        .await?
        .ok_or_else(ApiError::not_found)?;

    let findings = state
        .storage
        .get_findings(identity.tenant_id, incident_id)
        .await?;
    let entries: Vec<serde_json::Value> = findings
        .iter()
        .filter(|f| f.finding_type == "timeline")
        .map(|f| {
            json!({
                "timestamp": f.created_at,
                "agent": f.agent,
                "event": f.content.get("event"),
                "state": f.content.get("state"),
                "details": f.content.get("details"),
            })
        })
        .collect();

    Ok(Json(json!({
        "incident_id": incident_id,
        "timeline": entries,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ActionDecision {
    pub response_type: HumanResponse,
    #[serde(default)]
    pub justification: String,
    #[serde(default)]
    pub action_id: Option<Uuid>,
    #[serde(default)]
    pub modifications: Option<serde_json::Value>,
}

/// `POST /api/v1/incidents/{id}/action`: human approve/reject/modify.
pub async fn submit_action(
    AuthedTenant(identity): AuthedTenant,
    State(state): State<AppState>,
    Path(incident_id): Path<Uuid>,
    Json(decision): Json<ActionDecision>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .coordinator
        .human_decision(
            identity.tenant_id,
            incident_id,
            decision.action_id,
            decision.response_type,
            &decision.justification,
        )
        .await?;

    let override_type = match decision.response_type {
        HumanResponse::Approve => "approve",
        HumanResponse::ApproveModified => "approve_modified",
        HumanResponse::Reject => "reject",
        HumanResponse::Investigate => "investigate",
        HumanResponse::OverrideVeto => "override_veto",
    };
    if let Err(e) = state
        .audit
        .log_human_override(
            identity.tenant_id,
            &format!("key:{}", identity.key_id),
            incident_id,
            override_type,
            &decision.justification,
        )
        .await
    {
        tracing::warn!(error = %e, "human override audit failed");
    }

    Ok(Json(json!({
        "incident_id": incident_id,
        "action": decision.response_type,
        "modifications": decision.modifications,
        "status": "accepted",
    })))
}
