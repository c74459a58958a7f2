//! HORNET: Campaign Routes

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use hornet_store::Storage;

use crate::auth::AuthedTenant;
use crate::error::ApiError;
use crate::state::AppState;

const MAX_HOURS_BACK: i64 = 168;

#[derive(Debug, Deserialize)]
pub struct GraphQuery {
    #[serde(default = "default_hours")]
    pub hours_back: i64,
}

fn default_hours() -> i64 {
    24
}

/// `GET /api/v1/campaigns/graph?hours_back=`
pub async fn graph(
    AuthedTenant(identity): AuthedTenant,
    State(state): State<AppState>,
    Query(query): Query<GraphQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let hours_back = query.hours_back.clamp(1, MAX_HOURS_BACK);
    let graph = state
        .storage
        .campaign_graph(identity.tenant_id, hours_back)
        .await?;
    Ok(Json(json!({
        "nodes": graph.nodes,
        "edges": graph.edges,
    })))
}

/// `GET /api/v1/campaigns/stats`
pub async fn stats(
    AuthedTenant(identity): AuthedTenant,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = state.storage.campaign_stats(identity.tenant_id).await?;
    Ok(Json(json!({
        "total_links": stats.total_links,
        "high_confidence_links": stats.high_confidence_links,
        "linked_incidents": stats.linked_incidents,
        "top_shared_entities": stats.top_shared_entities,
        "link_types": stats.link_types,
    })))
}

/// `GET /api/v1/campaigns/{id}/related`: related incidents via shared
/// entities plus the recursive campaign membership (depth-bounded).
pub async fn related(
    AuthedTenant(identity): AuthedTenant,
    State(state): State<AppState>,
    Path(incident_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .storage
        .get_incident(identity.tenant_id, incident_id)
        .await?
        .ok_or_else(ApiError::not_found)?;

    let related = state.correlator.related(identity.tenant_id, incident_id).await?;
    let members = state
        .storage
        .get_campaign_incidents(identity.tenant_id, incident_id)
        .await?;

    Ok(Json(json!({
        "incident_id": incident_id,
        "related": related,
        "campaign_members": members,
    })))
}
