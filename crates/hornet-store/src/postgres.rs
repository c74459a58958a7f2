//! HORNET: PostgreSQL Storage
//!
//! Every tenant-scoped operation runs inside a transaction that issues
//! `SET LOCAL app.current_tenant_id` before any query, so the database's
//! row-level policies filter all reads and writes. The setting is scoped to
//! the transaction; returning the connection to the pool cannot leak one
//! tenant's identity into another operation.
//!
//! Queries also carry explicit tenant predicates where the row-level policy
//! alone would do. The policy is the isolation boundary; the predicates keep
//! query plans tight.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use uuid::Uuid;

use hornet_types::{
    Action, ActionRisk, ActionStatus, AgentFinding, Entity, Event, Incident, IncidentFilter,
    IncidentState, IncidentSummary, IncidentUpdate, Severity,
};

use crate::{
    campaign_score, canonical_pair, ActionUpdate, AuditEntry, CampaignGraph, CampaignStats,
    GraphEdge, GraphNode, LinkTypeStat, NewFinding, RelatedIncident, RelatedIncidents,
    SharedEntityStat, Storage, StoreError, TopEntityStat,
};

/// PostgreSQL storage backend.
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    /// Connect and build the pool.
    pub async fn connect(database_url: &str, pool_size: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded migrations. Additive only.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Open a transaction with the tenant identity attached. `SET LOCAL`
    /// does not take bind parameters; the value is a `Uuid` rendered by its
    /// own formatter, which is the validation gate for anything interpolated
    /// here.
    async fn tenant_tx(&self, tenant_id: Uuid) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "SET LOCAL app.current_tenant_id = '{tenant_id}'"
        ))
        .execute(&mut *tx)
        .await?;
        Ok(tx)
    }

    fn incident_from_row(row: &PgRow) -> Result<Incident, StoreError> {
        let state: String = row.try_get("state")?;
        let severity: Option<String> = row.try_get("severity")?;
        Ok(Incident {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            state: IncidentState::parse(&state)
                .ok_or_else(|| StoreError::Database(format!("unknown state {state}")))?,
            severity: severity.map(|s| Severity::parse_lossy(&s)),
            confidence: row.try_get("confidence")?,
            summary: row.try_get("summary")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            closed_at: row.try_get("closed_at")?,
            outcome: row.try_get("outcome")?,
            tokens_used: row.try_get("tokens_used")?,
            token_budget: row.try_get("token_budget")?,
            escalation_reason: row.try_get("escalation_reason")?,
            campaign_id: row.try_get("campaign_id")?,
        })
    }

    fn finding_from_row(row: &PgRow) -> Result<AgentFinding, StoreError> {
        let severity: String = row.try_get("severity")?;
        Ok(AgentFinding {
            id: row.try_get("id")?,
            incident_id: row.try_get("incident_id")?,
            tenant_id: row.try_get("tenant_id")?,
            agent: row.try_get("agent")?,
            finding_type: row.try_get("finding_type")?,
            confidence: row.try_get("confidence")?,
            severity: Severity::parse_lossy(&severity),
            content: row.try_get("content")?,
            reasoning: row.try_get("reasoning")?,
            tokens_consumed: row.try_get("tokens_consumed")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn action_from_row(row: &PgRow) -> Result<Action, StoreError> {
        let status: String = row.try_get("status")?;
        let risk: String = row.try_get("risk_level")?;
        Ok(Action {
            id: row.try_get("id")?,
            incident_id: row.try_get("incident_id")?,
            tenant_id: row.try_get("tenant_id")?,
            action_type: row.try_get("action_type")?,
            target: row.try_get("target")?,
            parameters: row.try_get("parameters")?,
            risk_level: ActionRisk::parse_lossy(&risk),
            status: ActionStatus::parse(&status)
                .ok_or_else(|| StoreError::Database(format!("unknown action status {status}")))?,
            proposed_by: row.try_get("proposed_by")?,
            proposed_at: row.try_get("proposed_at")?,
            approved_by: row.try_get("approved_by")?,
            approved_at: row.try_get("approved_at")?,
            executed_at: row.try_get("executed_at")?,
            result: row.try_get("result")?,
            rollback_plan: row.try_get("rollback_plan")?,
            rollback_handle: row.try_get("rollback_handle")?,
            justification: row.try_get("justification")?,
            veto_reason: row.try_get("veto_reason")?,
        })
    }

    const INCIDENT_COLUMNS: &'static str = "id, tenant_id, state, severity, confidence, summary, \
         created_at, updated_at, closed_at, outcome, tokens_used, token_budget, \
         escalation_reason, campaign_id";
}

#[async_trait]
impl Storage for PgStorage {
    async fn create_incident(
        &self,
        tenant_id: Uuid,
        event: &Event,
        severity: Severity,
        token_budget: i64,
    ) -> Result<bool, StoreError> {
        let mut tx = self.tenant_tx(tenant_id).await?;

        let inserted = sqlx::query(
            "INSERT INTO incidents \
             (id, tenant_id, state, severity, confidence, tokens_used, token_budget, created_at, updated_at) \
             VALUES ($1, $2, 'DETECTION', $3, 0.0, 0, $4, NOW(), NOW()) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(event.incident_id)
        .bind(tenant_id)
        .bind(severity.as_str())
        .bind(token_budget)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.commit().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO events \
             (id, tenant_id, incident_id, timestamp, source, source_type, event_type, severity, entities, raw_payload) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(event.id)
        .bind(tenant_id)
        .bind(event.incident_id)
        .bind(event.timestamp)
        .bind(&event.source)
        .bind(&event.source_type)
        .bind(&event.event_type)
        .bind(event.severity.as_str())
        .bind(serde_json::to_value(&event.entities).unwrap_or_default())
        .bind(&event.raw_payload)
        .execute(&mut *tx)
        .await?;

        for entity in &event.entities {
            if entity.value.is_empty() {
                continue;
            }
            sqlx::query(
                "INSERT INTO incident_entities (incident_id, tenant_id, entity_type, entity_value) \
                 VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
            )
            .bind(event.incident_id)
            .bind(tenant_id)
            .bind(&entity.entity_type)
            .bind(&entity.value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::debug!(incident_id = %event.incident_id, %tenant_id, "incident persisted");
        Ok(true)
    }

    async fn update_incident(
        &self,
        tenant_id: Uuid,
        incident_id: Uuid,
        update: IncidentUpdate,
    ) -> Result<(), StoreError> {
        let mut tx = self.tenant_tx(tenant_id).await?;

        let row = sqlx::query("SELECT state FROM incidents WHERE id = $1 FOR UPDATE")
            .bind(incident_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound)?;
        let current: String = row.try_get("state")?;
        let current = IncidentState::parse(&current)
            .ok_or_else(|| StoreError::Database(format!("unknown state {current}")))?;

        if let Some(new_state) = update.state {
            if new_state != current && !current.can_transition(new_state) {
                return Err(StoreError::Conflict(format!(
                    "illegal transition {current} -> {new_state}"
                )));
            }
        }

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("UPDATE incidents SET updated_at = NOW()");
        if let Some(state) = update.state {
            builder.push(", state = ").push_bind(state.as_str());
            if state == IncidentState::Closed {
                builder.push(", closed_at = COALESCE(closed_at, NOW())");
            }
        }
        if let Some(confidence) = update.confidence {
            builder.push(", confidence = ").push_bind(confidence);
        }
        if let Some(severity) = update.severity {
            builder.push(", severity = ").push_bind(severity.as_str());
        }
        if let Some(tokens_used) = update.tokens_used {
            builder.push(", tokens_used = ").push_bind(tokens_used);
        }
        if let Some(summary) = update.summary {
            let truncated: String = summary.chars().take(1000).collect();
            builder.push(", summary = ").push_bind(truncated);
        }
        if let Some(outcome) = update.outcome {
            builder.push(", outcome = ").push_bind(outcome);
        }
        if let Some(reason) = update.escalation_reason {
            builder.push(", escalation_reason = ").push_bind(reason);
        }
        if let Some(campaign_id) = update.campaign_id {
            builder.push(", campaign_id = ").push_bind(campaign_id);
        }
        builder.push(" WHERE id = ").push_bind(incident_id);
        builder.build().execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_incident(
        &self,
        tenant_id: Uuid,
        incident_id: Uuid,
    ) -> Result<Option<Incident>, StoreError> {
        let mut tx = self.tenant_tx(tenant_id).await?;
        let row = sqlx::query(&format!(
            "SELECT {} FROM incidents WHERE id = $1",
            Self::INCIDENT_COLUMNS
        ))
        .bind(incident_id)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        row.as_ref().map(Self::incident_from_row).transpose()
    }

    async fn list_incidents(
        &self,
        tenant_id: Uuid,
        filter: &IncidentFilter,
    ) -> Result<Vec<Incident>, StoreError> {
        let mut tx = self.tenant_tx(tenant_id).await?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM incidents WHERE tenant_id = ",
            Self::INCIDENT_COLUMNS
        ));
        builder.push_bind(tenant_id);
        if let Some(state) = filter.state {
            builder.push(" AND state = ").push_bind(state.as_str());
        }
        if let Some(severity) = filter.severity {
            builder.push(" AND severity = ").push_bind(severity.as_str());
        }
        builder
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(filter.limit.unwrap_or(50))
            .push(" OFFSET ")
            .push_bind(filter.offset.unwrap_or(0));

        let rows = builder.build().fetch_all(&mut *tx).await?;
        tx.commit().await?;
        rows.iter().map(Self::incident_from_row).collect()
    }

    async fn add_finding(&self, tenant_id: Uuid, finding: NewFinding) -> Result<bool, StoreError> {
        let mut tx = self.tenant_tx(tenant_id).await?;
        let inserted = sqlx::query(
            "INSERT INTO agent_findings \
             (id, incident_id, tenant_id, agent, finding_type, confidence, severity, content, reasoning, tokens_consumed, created_at) \
             SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW() \
             WHERE EXISTS (SELECT 1 FROM incidents WHERE id = $2)",
        )
        .bind(Uuid::new_v4())
        .bind(finding.incident_id)
        .bind(tenant_id)
        .bind(&finding.agent)
        .bind(&finding.finding_type)
        .bind(finding.confidence)
        .bind(finding.severity.as_str())
        .bind(&finding.content)
        .bind(&finding.reasoning)
        .bind(finding.tokens_consumed)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(inserted == 1)
    }

    async fn get_findings(
        &self,
        tenant_id: Uuid,
        incident_id: Uuid,
    ) -> Result<Vec<AgentFinding>, StoreError> {
        let mut tx = self.tenant_tx(tenant_id).await?;
        let rows = sqlx::query(
            "SELECT id, incident_id, tenant_id, agent, finding_type, confidence, severity, \
             content, reasoning, tokens_consumed, created_at \
             FROM agent_findings WHERE incident_id = $1 ORDER BY created_at",
        )
        .bind(incident_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        rows.iter().map(Self::finding_from_row).collect()
    }

    async fn find_incidents_by_entity(
        &self,
        tenant_id: Uuid,
        entity_type: &str,
        entity_value: &str,
        minutes_back: i64,
        exclude: Option<Uuid>,
    ) -> Result<Vec<Incident>, StoreError> {
        let mut tx = self.tenant_tx(tenant_id).await?;
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT {} FROM incidents i \
             JOIN incident_entities ie ON i.id = ie.incident_id \
             WHERE ie.tenant_id = $1 \
               AND ie.entity_type = $2 \
               AND ie.entity_value = $3 \
               AND i.created_at >= NOW() - make_interval(mins => $4::int) \
               AND ($5::uuid IS NULL OR i.id != $5) \
             ORDER BY i.created_at DESC \
             LIMIT 50",
            Self::INCIDENT_COLUMNS
                .split(", ")
                .map(|c| format!("i.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(tenant_id)
        .bind(entity_type)
        .bind(entity_value)
        .bind(minutes_back)
        .bind(exclude)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        rows.iter().map(Self::incident_from_row).collect()
    }

    async fn find_related_incidents(
        &self,
        tenant_id: Uuid,
        incident_id: Uuid,
        minutes_back: i64,
    ) -> Result<RelatedIncidents, StoreError> {
        let own_entities = {
            let mut tx = self.tenant_tx(tenant_id).await?;
            let rows = sqlx::query(
                "SELECT entity_type, entity_value FROM incident_entities WHERE incident_id = $1",
            )
            .bind(incident_id)
            .fetch_all(&mut *tx)
            .await?;
            tx.commit().await?;
            rows.iter()
                .map(|row| {
                    Ok(Entity {
                        entity_type: row.try_get("entity_type")?,
                        value: row.try_get("entity_value")?,
                    })
                })
                .collect::<Result<Vec<Entity>, StoreError>>()?
        };
        if own_entities.is_empty() {
            return Ok(RelatedIncidents::default());
        }

        let mut related: HashMap<Uuid, RelatedIncident> = HashMap::new();
        let mut shared_entities: Vec<SharedEntityStat> = Vec::new();

        for entity in &own_entities {
            let matches = self
                .find_incidents_by_entity(
                    tenant_id,
                    &entity.entity_type,
                    &entity.value,
                    minutes_back,
                    Some(incident_id),
                )
                .await?;
            if matches.is_empty() {
                continue;
            }
            shared_entities.push(SharedEntityStat {
                entity_type: entity.entity_type.clone(),
                value: entity.value.clone(),
                incident_count: matches.len() + 1,
            });
            for incident in matches {
                related
                    .entry(incident.id)
                    .or_insert_with(|| RelatedIncident {
                        id: incident.id,
                        state: incident.state.as_str().to_string(),
                        severity: incident.severity,
                        confidence: incident.confidence,
                        created_at: incident.created_at,
                        summary: incident.summary.clone(),
                        shared_entities: Vec::new(),
                    })
                    .shared_entities
                    .push(entity.clone());
            }
        }

        let distinct_types: HashSet<&str> = shared_entities
            .iter()
            .map(|s| s.entity_type.as_str())
            .collect();
        let max_occurrences = shared_entities
            .iter()
            .map(|s| s.incident_count)
            .max()
            .unwrap_or(1);
        let score = campaign_score(related.len(), distinct_types.len(), max_occurrences);
        let is_campaign = score >= 0.5 || related.len() >= 3;

        Ok(RelatedIncidents {
            related: related.into_values().collect(),
            shared_entities,
            campaign_score: score,
            is_campaign,
        })
    }

    async fn link_incidents(
        &self,
        tenant_id: Uuid,
        incident_a: Uuid,
        incident_b: Uuid,
        link_type: &str,
        confidence: f64,
        shared_entities: &[Entity],
        link_reason: &str,
    ) -> Result<bool, StoreError> {
        if incident_a == incident_b {
            return Err(StoreError::Validation("cannot link an incident to itself".into()));
        }
        let (a, b) = canonical_pair(incident_a, incident_b);
        let mut tx = self.tenant_tx(tenant_id).await?;
        let inserted = sqlx::query(
            "INSERT INTO incident_links \
             (incident_a, incident_b, tenant_id, link_type, confidence, shared_entities, link_reason, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, NOW()) \
             ON CONFLICT (tenant_id, incident_a, incident_b) DO NOTHING",
        )
        .bind(a)
        .bind(b)
        .bind(tenant_id)
        .bind(link_type)
        .bind(confidence)
        .bind(serde_json::to_value(shared_entities).unwrap_or_default())
        .bind(link_reason)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(inserted == 1)
    }

    async fn create_campaign(
        &self,
        tenant_id: Uuid,
        incident_ids: &[Uuid],
    ) -> Result<Option<Uuid>, StoreError> {
        if incident_ids.is_empty() {
            return Ok(None);
        }
        let campaign_id = Uuid::new_v4();
        let mut tx = self.tenant_tx(tenant_id).await?;
        for id in incident_ids {
            sqlx::query(
                "UPDATE incidents SET campaign_id = $1, updated_at = NOW() \
                 WHERE id = $2 AND tenant_id = $3",
            )
            .bind(campaign_id)
            .bind(id)
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;
        }
        for (i, a) in incident_ids.iter().enumerate() {
            for b in incident_ids.iter().skip(i + 1) {
                let (x, y) = canonical_pair(*a, *b);
                sqlx::query(
                    "INSERT INTO incident_links \
                     (incident_a, incident_b, tenant_id, link_type, confidence, shared_entities, link_reason, created_at) \
                     VALUES ($1, $2, $3, 'campaign', 0.95, '[]'::jsonb, 'campaign grouping', NOW()) \
                     ON CONFLICT (tenant_id, incident_a, incident_b) DO NOTHING",
                )
                .bind(x)
                .bind(y)
                .bind(tenant_id)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        tracing::info!(%campaign_id, incidents = incident_ids.len(), "campaign created");
        Ok(Some(campaign_id))
    }

    async fn get_campaign_incidents(
        &self,
        tenant_id: Uuid,
        incident_id: Uuid,
    ) -> Result<Vec<Incident>, StoreError> {
        let mut tx = self.tenant_tx(tenant_id).await?;
        let columns = Self::INCIDENT_COLUMNS
            .split(", ")
            .map(|c| format!("i.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = sqlx::query(&format!(
            "WITH RECURSIVE campaign AS ( \
                 SELECT $1::uuid AS incident_id, 0 AS depth \
                 UNION \
                 SELECT CASE WHEN il.incident_a = c.incident_id THEN il.incident_b \
                             ELSE il.incident_a END AS incident_id, \
                        c.depth + 1 \
                 FROM incident_links il \
                 JOIN campaign c \
                   ON il.incident_a = c.incident_id OR il.incident_b = c.incident_id \
                 WHERE c.depth < 10 \
             ) \
             SELECT DISTINCT {columns} FROM incidents i \
             JOIN campaign c ON i.id = c.incident_id \
             WHERE i.tenant_id = $2 \
             ORDER BY i.created_at ASC",
        ))
        .bind(incident_id)
        .bind(tenant_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        rows.iter().map(Self::incident_from_row).collect()
    }

    async fn get_entity_timeline(
        &self,
        tenant_id: Uuid,
        entity_type: &str,
        entity_value: &str,
        hours_back: i64,
    ) -> Result<Vec<IncidentSummary>, StoreError> {
        let mut tx = self.tenant_tx(tenant_id).await?;
        let rows = sqlx::query(
            "SELECT i.id, i.state, i.severity, i.confidence, i.summary, i.created_at, \
                    array_remove(array_agg(DISTINCT af.agent), NULL) AS agents, \
                    array_remove(array_agg(DISTINCT af.finding_type), NULL) AS finding_types \
             FROM incidents i \
             JOIN incident_entities ie ON i.id = ie.incident_id \
             LEFT JOIN agent_findings af ON i.id = af.incident_id \
             WHERE ie.tenant_id = $1 \
               AND ie.entity_type = $2 \
               AND ie.entity_value = $3 \
               AND i.created_at >= NOW() - make_interval(hours => $4::int) \
             GROUP BY i.id, i.state, i.severity, i.confidence, i.summary, i.created_at \
             ORDER BY i.created_at ASC",
        )
        .bind(tenant_id)
        .bind(entity_type)
        .bind(entity_value)
        .bind(hours_back)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        rows.iter()
            .map(|row| {
                let state: String = row.try_get("state")?;
                let severity: Option<String> = row.try_get("severity")?;
                Ok(IncidentSummary {
                    id: row.try_get("id")?,
                    state: IncidentState::parse(&state)
                        .ok_or_else(|| StoreError::Database(format!("unknown state {state}")))?,
                    severity: severity.map(|s| Severity::parse_lossy(&s)),
                    confidence: row.try_get("confidence")?,
                    summary: row.try_get("summary")?,
                    created_at: row.try_get("created_at")?,
                    agents: row.try_get("agents")?,
                    finding_types: row.try_get("finding_types")?,
                })
            })
            .collect()
    }

    async fn insert_action(&self, tenant_id: Uuid, action: &Action) -> Result<(), StoreError> {
        if action.tenant_id != tenant_id {
            return Err(StoreError::Validation("action tenant mismatch".into()));
        }
        let mut tx = self.tenant_tx(tenant_id).await?;
        sqlx::query(
            "INSERT INTO actions \
             (id, incident_id, tenant_id, action_type, target, parameters, risk_level, status, \
              proposed_by, proposed_at, approved_by, approved_at, justification, rollback_plan) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(action.id)
        .bind(action.incident_id)
        .bind(tenant_id)
        .bind(&action.action_type)
        .bind(&action.target)
        .bind(&action.parameters)
        .bind(action.risk_level.as_str())
        .bind(action.status.as_str())
        .bind(&action.proposed_by)
        .bind(action.proposed_at)
        .bind(&action.approved_by)
        .bind(action.approved_at)
        .bind(&action.justification)
        .bind(&action.rollback_plan)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_action(
        &self,
        tenant_id: Uuid,
        action_id: Uuid,
        update: ActionUpdate,
    ) -> Result<(), StoreError> {
        let mut tx = self.tenant_tx(tenant_id).await?;

        let row = sqlx::query("SELECT status FROM actions WHERE id = $1 FOR UPDATE")
            .bind(action_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound)?;
        let current: String = row.try_get("status")?;
        let current = ActionStatus::parse(&current)
            .ok_or_else(|| StoreError::Database(format!("unknown action status {current}")))?;

        if let Some(status) = update.status {
            if status != current && !current.can_transition(status) {
                return Err(StoreError::Conflict(format!(
                    "illegal action transition {current} -> {status}"
                )));
            }
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE actions SET ");
        {
            let mut separated = builder.separated(", ");
            if let Some(status) = update.status {
            separated.push("status = ").push_bind_unseparated(status.as_str());
                match status {
                    ActionStatus::Approved => {
                        separated.push("approved_at = COALESCE(approved_at, NOW())");
                    }
                    ActionStatus::Executing => {
                        separated.push("executed_at = COALESCE(executed_at, NOW())");
                    }
                    _ => {}
                }
            }
            if let Some(approved_by) = update.approved_by {
                separated.push("approved_by = ").push_bind_unseparated(approved_by);
            }
            if let Some(result) = update.result {
                separated.push("result = ").push_bind_unseparated(result);
            }
            if let Some(handle) = update.rollback_handle {
                separated.push("rollback_handle = ").push_bind_unseparated(handle);
            }
            if let Some(reason) = update.veto_reason {
                separated.push("veto_reason = ").push_bind_unseparated(reason);
            }
            // Anchor keeps the statement valid when nothing else changed.
            separated.push("id = id");
        }
        builder.push(" WHERE id = ").push_bind(action_id);
        builder.build().execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_actions(
        &self,
        tenant_id: Uuid,
        incident_id: Uuid,
    ) -> Result<Vec<Action>, StoreError> {
        let mut tx = self.tenant_tx(tenant_id).await?;
        let rows = sqlx::query(
            "SELECT id, incident_id, tenant_id, action_type, target, parameters, risk_level, \
                    status, proposed_by, proposed_at, approved_by, approved_at, executed_at, \
                    result, rollback_plan, rollback_handle, justification, veto_reason \
             FROM actions WHERE incident_id = $1 ORDER BY proposed_at ASC",
        )
        .bind(incident_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        rows.iter().map(Self::action_from_row).collect()
    }

    async fn campaign_graph(
        &self,
        tenant_id: Uuid,
        hours_back: i64,
    ) -> Result<CampaignGraph, StoreError> {
        let mut tx = self.tenant_tx(tenant_id).await?;

        let node_rows = sqlx::query(
            "SELECT i.id, i.state, i.severity, i.confidence, i.summary, i.created_at, \
                    COUNT(DISTINCT ie.entity_value) AS entity_count \
             FROM incidents i \
             LEFT JOIN incident_entities ie ON i.id = ie.incident_id \
             WHERE i.tenant_id = $1 \
               AND i.created_at >= NOW() - make_interval(hours => $2::int) \
             GROUP BY i.id, i.state, i.severity, i.confidence, i.summary, i.created_at \
             ORDER BY i.created_at DESC \
             LIMIT 100",
        )
        .bind(tenant_id)
        .bind(hours_back)
        .fetch_all(&mut *tx)
        .await?;

        let edge_rows = sqlx::query(
            "SELECT incident_a, incident_b, link_type, confidence \
             FROM incident_links \
             WHERE tenant_id = $1 \
               AND created_at >= NOW() - make_interval(hours => $2::int)",
        )
        .bind(tenant_id)
        .bind(hours_back)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let nodes = node_rows
            .iter()
            .map(|row| {
                let severity: Option<String> = row.try_get("severity")?;
                Ok(GraphNode {
                    id: row.try_get("id")?,
                    state: row.try_get("state")?,
                    severity: severity.map(|s| Severity::parse_lossy(&s)),
                    confidence: row.try_get("confidence")?,
                    summary: row.try_get("summary")?,
                    entity_count: row.try_get("entity_count")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let edges = edge_rows
            .iter()
            .map(|row| {
                Ok(GraphEdge {
                    source: row.try_get("incident_a")?,
                    target: row.try_get("incident_b")?,
                    link_type: row.try_get("link_type")?,
                    confidence: row.try_get("confidence")?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(CampaignGraph { nodes, edges })
    }

    async fn campaign_stats(&self, tenant_id: Uuid) -> Result<CampaignStats, StoreError> {
        let mut tx = self.tenant_tx(tenant_id).await?;

        let totals = sqlx::query(
            "SELECT COUNT(*) AS total, \
                    COUNT(*) FILTER (WHERE confidence >= 0.7) AS high_confidence \
             FROM incident_links WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_one(&mut *tx)
        .await?;

        let linked: i64 = sqlx::query(
            "SELECT COUNT(DISTINCT incident_id) AS total FROM ( \
                 SELECT incident_a AS incident_id FROM incident_links WHERE tenant_id = $1 \
                 UNION \
                 SELECT incident_b AS incident_id FROM incident_links WHERE tenant_id = $1 \
             ) linked",
        )
        .bind(tenant_id)
        .fetch_one(&mut *tx)
        .await?
        .try_get("total")?;

        let entity_rows = sqlx::query(
            "SELECT entity_type, entity_value, COUNT(DISTINCT incident_id) AS incident_count \
             FROM incident_entities WHERE tenant_id = $1 \
             GROUP BY entity_type, entity_value \
             HAVING COUNT(DISTINCT incident_id) >= 2 \
             ORDER BY incident_count DESC \
             LIMIT 10",
        )
        .bind(tenant_id)
        .fetch_all(&mut *tx)
        .await?;

        let type_rows = sqlx::query(
            "SELECT link_type, COUNT(*) AS count, AVG(confidence) AS avg_confidence \
             FROM incident_links WHERE tenant_id = $1 \
             GROUP BY link_type ORDER BY count DESC",
        )
        .bind(tenant_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(CampaignStats {
            total_links: totals.try_get("total")?,
            high_confidence_links: totals.try_get("high_confidence")?,
            linked_incidents: linked,
            top_shared_entities: entity_rows
                .iter()
                .map(|row| {
                    Ok(TopEntityStat {
                        entity_type: row.try_get("entity_type")?,
                        entity_value: row.try_get("entity_value")?,
                        incident_count: row.try_get("incident_count")?,
                    })
                })
                .collect::<Result<Vec<_>, StoreError>>()?,
            link_types: type_rows
                .iter()
                .map(|row| {
                    Ok(LinkTypeStat {
                        link_type: row.try_get("link_type")?,
                        count: row.try_get("count")?,
                        avg_confidence: row.try_get("avg_confidence")?,
                    })
                })
                .collect::<Result<Vec<_>, StoreError>>()?,
        })
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let mut tx = self.tenant_tx(entry.tenant_id).await?;
        sqlx::query(
            "INSERT INTO audit_log \
             (id, tenant_id, timestamp, actor, action, resource_type, resource_id, details, ip_address, signature) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(entry.id)
        .bind(entry.tenant_id)
        .bind(entry.timestamp)
        .bind(&entry.actor)
        .bind(&entry.action)
        .bind(&entry.resource_type)
        .bind(entry.resource_id)
        .bind(&entry.details)
        .bind(&entry.ip_address)
        .bind(&entry.signature)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
