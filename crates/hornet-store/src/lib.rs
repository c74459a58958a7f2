//! HORNET: Storage Layer
//!
//! Typed, tenant-aware access to incidents, findings, the entity index,
//! incident links, actions, and the audit log. Two backends implement the
//! same trait:
//!
//! - [`PgStorage`]: PostgreSQL via sqlx. Every tenant-scoped operation
//!   runs in a transaction that issues `SET LOCAL app.current_tenant_id`,
//!   so the database's row-level policies filter every read and write. The
//!   setting dies with the transaction and cannot leak across pool
//!   checkouts.
//! - [`MemoryStorage`]: process-local maps with the same tenant filtering,
//!   used by tests and single-node development runs.
//!
//! The tenant identity is an explicit argument on every call; it is never
//! read from a process global.

pub mod apikey;
pub mod audit;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use hornet_types::{
    Action, ActionStatus, AgentFinding, Entity, Event, HornetError, Incident, IncidentFilter,
    IncidentSummary, IncidentUpdate, Severity,
};

pub use apikey::{
    generate_api_key, hash_api_key, ApiKeyValidator, PgApiKeyValidator, StaticApiKeys,
    API_KEY_PREFIX,
};
pub use audit::{AuditEntry, AuditLogger};
pub use memory::MemoryStorage;
pub use postgres::PgStorage;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database failure: {0}")]
    Database(String),

    #[error("invalid identifier: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("row not found")]
    NotFound,
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            other => StoreError::Database(other.to_string()),
        }
    }
}

impl From<StoreError> for HornetError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(msg) => HornetError::Transient(msg),
            StoreError::Validation(msg) => HornetError::Validation(msg),
            StoreError::Conflict(msg) => HornetError::Conflict(msg),
            StoreError::NotFound => HornetError::TenantIsolation,
        }
    }
}

/// A finding about to be recorded.
#[derive(Debug, Clone)]
pub struct NewFinding {
    pub incident_id: Uuid,
    pub agent: String,
    pub finding_type: String,
    pub confidence: f64,
    pub severity: Severity,
    pub content: serde_json::Value,
    pub reasoning: String,
    pub tokens_consumed: i64,
}

/// Partial update applied to an action row. Status changes are validated
/// against the action ladder; an illegal change is a conflict.
#[derive(Debug, Clone, Default)]
pub struct ActionUpdate {
    pub status: Option<ActionStatus>,
    pub approved_by: Option<String>,
    pub result: Option<serde_json::Value>,
    pub rollback_handle: Option<String>,
    pub veto_reason: Option<String>,
}

/// One incident related to another through shared entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedIncident {
    pub id: Uuid,
    pub state: String,
    pub severity: Option<Severity>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub summary: Option<String>,
    /// Entities this incident shares with the queried one
    pub shared_entities: Vec<Entity>,
}

/// Aggregate for one shared entity across the related set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedEntityStat {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub value: String,
    /// Incidents in the window the entity occurs in, the queried one included
    pub incident_count: usize,
}

/// Result of a related-incident query, with campaign scoring applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelatedIncidents {
    pub related: Vec<RelatedIncident>,
    pub shared_entities: Vec<SharedEntityStat>,
    pub campaign_score: f64,
    pub is_campaign: bool,
}

/// Node in the campaign graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: Uuid,
    pub state: String,
    pub severity: Option<Severity>,
    pub confidence: f64,
    pub summary: Option<String>,
    pub entity_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Edge in the campaign graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: Uuid,
    pub target: Uuid,
    pub link_type: String,
    pub confidence: f64,
}

/// Campaign graph for visualization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

/// Link-type aggregate row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkTypeStat {
    pub link_type: String,
    pub count: i64,
    pub avg_confidence: f64,
}

/// Entity aggregate row (entities seen on two or more incidents).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopEntityStat {
    pub entity_type: String,
    pub entity_value: String,
    pub incident_count: i64,
}

/// Campaign statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignStats {
    pub total_links: i64,
    pub high_confidence_links: i64,
    pub linked_incidents: i64,
    pub top_shared_entities: Vec<TopEntityStat>,
    pub link_types: Vec<LinkTypeStat>,
}

/// Campaign score from its three clamped factors:
/// 0.4·related + 0.3·diversity + 0.3·frequency.
pub fn campaign_score(
    related_count: usize,
    distinct_entity_types: usize,
    max_entity_occurrences: usize,
) -> f64 {
    if related_count == 0 {
        return 0.0;
    }
    let incident_factor = (related_count as f64 / 5.0).min(1.0);
    let diversity_factor = (distinct_entity_types as f64 / 3.0).min(1.0);
    let frequency_factor = (max_entity_occurrences as f64 / 3.0).min(1.0);
    incident_factor * 0.4 + diversity_factor * 0.3 + frequency_factor * 0.3
}

/// A pair of incident ids in canonical (sorted) order, so the undirected
/// link (a,b) is stored exactly once.
pub fn canonical_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// The storage abstraction. Every call takes the caller's tenant id.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Create an incident (state DETECTION) from a promoted event, persist
    /// the event row, and index the event's entities. Returns false when an
    /// incident with this id already exists (idempotent replay).
    async fn create_incident(
        &self,
        tenant_id: Uuid,
        event: &Event,
        severity: Severity,
        token_budget: i64,
    ) -> Result<bool, StoreError>;

    /// Apply a partial update. A state change outside the transition table
    /// is rejected as a conflict; a transition to CLOSED stamps `closed_at`
    /// once.
    async fn update_incident(
        &self,
        tenant_id: Uuid,
        incident_id: Uuid,
        update: IncidentUpdate,
    ) -> Result<(), StoreError>;

    async fn get_incident(
        &self,
        tenant_id: Uuid,
        incident_id: Uuid,
    ) -> Result<Option<Incident>, StoreError>;

    async fn list_incidents(
        &self,
        tenant_id: Uuid,
        filter: &IncidentFilter,
    ) -> Result<Vec<Incident>, StoreError>;

    /// Append a finding. Returns false when the incident does not exist for
    /// this tenant.
    async fn add_finding(&self, tenant_id: Uuid, finding: NewFinding) -> Result<bool, StoreError>;

    async fn get_findings(
        &self,
        tenant_id: Uuid,
        incident_id: Uuid,
    ) -> Result<Vec<AgentFinding>, StoreError>;

    async fn find_incidents_by_entity(
        &self,
        tenant_id: Uuid,
        entity_type: &str,
        entity_value: &str,
        minutes_back: i64,
        exclude: Option<Uuid>,
    ) -> Result<Vec<Incident>, StoreError>;

    /// Join on the entity index, aggregate per-related shared entities, and
    /// score the set as a campaign.
    async fn find_related_incidents(
        &self,
        tenant_id: Uuid,
        incident_id: Uuid,
        minutes_back: i64,
    ) -> Result<RelatedIncidents, StoreError>;

    /// Idempotently insert an undirected link. Returns false when the
    /// canonical pair is already linked.
    async fn link_incidents(
        &self,
        tenant_id: Uuid,
        incident_a: Uuid,
        incident_b: Uuid,
        link_type: &str,
        confidence: f64,
        shared_entities: &[Entity],
        link_reason: &str,
    ) -> Result<bool, StoreError>;

    /// Assign a fresh campaign id to every member and write pairwise links.
    async fn create_campaign(
        &self,
        tenant_id: Uuid,
        incident_ids: &[Uuid],
    ) -> Result<Option<Uuid>, StoreError>;

    /// Recursive campaign membership through the link graph, depth ≤ 10.
    async fn get_campaign_incidents(
        &self,
        tenant_id: Uuid,
        incident_id: Uuid,
    ) -> Result<Vec<Incident>, StoreError>;

    async fn get_entity_timeline(
        &self,
        tenant_id: Uuid,
        entity_type: &str,
        entity_value: &str,
        hours_back: i64,
    ) -> Result<Vec<IncidentSummary>, StoreError>;

    async fn insert_action(&self, tenant_id: Uuid, action: &Action) -> Result<(), StoreError>;

    async fn update_action(
        &self,
        tenant_id: Uuid,
        action_id: Uuid,
        update: ActionUpdate,
    ) -> Result<(), StoreError>;

    async fn list_actions(
        &self,
        tenant_id: Uuid,
        incident_id: Uuid,
    ) -> Result<Vec<Action>, StoreError>;

    async fn campaign_graph(
        &self,
        tenant_id: Uuid,
        hours_back: i64,
    ) -> Result<CampaignGraph, StoreError>;

    async fn campaign_stats(&self, tenant_id: Uuid) -> Result<CampaignStats, StoreError>;

    /// Append an audit entry. The audit log accepts inserts only.
    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;

    /// Backend reachability.
    async fn health_check(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_campaign_score_factors() {
        // 5+ related, 3+ types, 3+ occurrences saturate every factor.
        assert!((campaign_score(5, 3, 3) - 1.0).abs() < f64::EPSILON);
        // No related incidents scores zero.
        assert_eq!(campaign_score(0, 0, 0), 0.0);
        // Two related, one type, each entity seen twice:
        // 0.4*(2/5) + 0.3*(1/3) + 0.3*(2/3) = 0.16 + 0.1 + 0.2
        assert!((campaign_score(2, 1, 2) - 0.46).abs() < 1e-9);
    }

    #[test]
    fn test_campaign_score_clamps() {
        assert!(campaign_score(100, 50, 50) <= 1.0);
    }

    #[test]
    fn test_canonical_pair_orders() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(canonical_pair(a, b), canonical_pair(b, a));
        let (x, y) = canonical_pair(a, b);
        assert!(x <= y);
    }
}
