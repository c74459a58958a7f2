//! HORNET: Dead-Letter Queue Routes

use axum::extract::{Path, State};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use crate::auth::AuthedTenant;
use crate::error::ApiError;
use crate::state::AppState;

/// `GET /api/v1/dlq`
pub async fn list(
    AuthedTenant(identity): AuthedTenant,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    let jobs = state.retry_queue.list_dlq(Some(identity.tenant_id));
    Json(json!({
        "items": jobs
            .iter()
            .map(|j| json!({
                "id": j.id,
                "job_type": j.job_type,
                "target": j.target,
                "attempts": j.attempts,
                "max_attempts": j.max_attempts,
                "created_at": j.created_at,
                "errors": j.error_history,
            }))
            .collect::<Vec<_>>(),
    }))
}

/// `POST /api/v1/dlq/{id}/replay`
pub async fn replay(
    AuthedTenant(identity): AuthedTenant,
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Only jobs in the caller's DLQ slice may be replayed.
    let owned = state
        .retry_queue
        .list_dlq(Some(identity.tenant_id))
        .iter()
        .any(|j| j.id == job_id);
    if !owned {
        return Err(ApiError::not_found());
    }

    let success = state.retry_queue.replay(job_id);
    if success {
        if let Err(e) = state
            .audit
            .log(
                identity.tenant_id,
                &format!("key:{}", identity.key_id),
                "dlq.replay",
                "retry_job",
                Some(job_id),
                json!({}),
                None,
            )
            .await
        {
            tracing::warn!(error = %e, "dlq replay audit failed");
        }
    }
    Ok(Json(json!({"success": success})))
}
