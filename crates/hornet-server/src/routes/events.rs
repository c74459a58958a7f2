//! HORNET: Event Ingestion Routes

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hornet_bus::EventBus;
use hornet_types::{Entity, Event, Severity, TenantIdentity};

use crate::auth::AuthedTenant;
use crate::error::ApiError;
use crate::state::AppState;

const MAX_BATCH: usize = 100;

#[derive(Debug, Deserialize)]
pub struct EventCreate {
    pub event_type: String,
    pub source: String,
    pub source_type: String,
    pub severity: Severity,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct EventAccepted {
    pub id: Uuid,
    pub incident_id: Uuid,
}

fn normalize(identity: &TenantIdentity, create: EventCreate) -> Result<Event, ApiError> {
    if create.event_type.is_empty() {
        return Err(ApiError::validation("event_type is required"));
    }
    Ok(Event {
        id: Uuid::new_v4(),
        tenant_id: identity.tenant_id,
        incident_id: Uuid::new_v4(),
        timestamp: create.timestamp.unwrap_or_else(Utc::now),
        source: create.source,
        source_type: create.source_type,
        event_type: create.event_type,
        severity: create.severity,
        entities: create.entities,
        raw_payload: create.data,
    })
}

async fn publish(state: &AppState, event: &Event) -> Result<(), ApiError> {
    let payload = serde_json::to_value(event)
        .map_err(|e| ApiError::internal(format!("event serialization failed: {e}")))?;
    state.bus.publish_event(&payload).await?;
    Ok(())
}

/// `POST /api/v1/events`
pub async fn ingest(
    AuthedTenant(identity): AuthedTenant,
    State(state): State<AppState>,
    Json(create): Json<EventCreate>,
) -> Result<(StatusCode, Json<EventAccepted>), ApiError> {
    let event = normalize(&identity, create)?;
    publish(&state, &event).await?;
    Ok((
        StatusCode::CREATED,
        Json(EventAccepted {
            id: event.id,
            incident_id: event.incident_id,
        }),
    ))
}

/// `POST /api/v1/events/batch`
pub async fn ingest_batch(
    AuthedTenant(identity): AuthedTenant,
    State(state): State<AppState>,
    Json(batch): Json<Vec<EventCreate>>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if batch.len() > MAX_BATCH {
        return Err(ApiError::validation(format!(
            "maximum {MAX_BATCH} events per batch"
        )));
    }

    let mut accepted = Vec::with_capacity(batch.len());
    for create in batch {
        let event = normalize(&identity, create)?;
        publish(&state, &event).await?;
        accepted.push(EventAccepted {
            id: event.id,
            incident_id: event.incident_id,
        });
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "accepted": accepted.len(),
            "events": accepted,
        })),
    ))
}
