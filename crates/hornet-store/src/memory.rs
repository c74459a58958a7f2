//! HORNET: In-Memory Storage
//!
//! Process-local backend with the same tenant filtering the PostgreSQL
//! row-level policies provide. Used by tests and single-node development.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use hornet_types::{
    Action, ActionStatus, AgentFinding, Entity, Event, Incident, IncidentFilter, IncidentState,
    IncidentSummary, IncidentUpdate, Severity,
};

use crate::{
    campaign_score, canonical_pair, ActionUpdate, AuditEntry, CampaignGraph, CampaignStats,
    GraphEdge, GraphNode, LinkTypeStat, NewFinding, RelatedIncident, RelatedIncidents,
    SharedEntityStat, Storage, StoreError, TopEntityStat,
};

const CAMPAIGN_DEPTH_LIMIT: usize = 10;

struct EntityRow {
    incident_id: Uuid,
    tenant_id: Uuid,
    entity: Entity,
}

struct LinkRow {
    tenant_id: Uuid,
    incident_a: Uuid,
    incident_b: Uuid,
    link_type: String,
    confidence: f64,
    #[allow(dead_code)]
    shared_entities: Vec<Entity>,
    #[allow(dead_code)]
    link_reason: String,
    created_at: chrono::DateTime<Utc>,
}

/// In-memory storage backend.
#[derive(Default)]
pub struct MemoryStorage {
    incidents: RwLock<HashMap<Uuid, Incident>>,
    events: RwLock<HashMap<Uuid, Event>>,
    entities: RwLock<Vec<EntityRow>>,
    findings: RwLock<Vec<AgentFinding>>,
    links: RwLock<Vec<LinkRow>>,
    actions: RwLock<HashMap<Uuid, Action>>,
    audit: RwLock<Vec<AuditEntry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Audit entries recorded so far (test observation point).
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.read().clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_incident(
        &self,
        tenant_id: Uuid,
        event: &Event,
        severity: Severity,
        token_budget: i64,
    ) -> Result<bool, StoreError> {
        let mut incidents = self.incidents.write();
        if incidents.contains_key(&event.incident_id) {
            return Ok(false);
        }
        let now = Utc::now();
        incidents.insert(
            event.incident_id,
            Incident {
                id: event.incident_id,
                tenant_id,
                state: IncidentState::Detection,
                severity: Some(severity),
                confidence: 0.0,
                summary: None,
                created_at: now,
                updated_at: now,
                closed_at: None,
                outcome: None,
                tokens_used: 0,
                token_budget,
                escalation_reason: None,
                campaign_id: None,
            },
        );
        drop(incidents);

        self.events.write().entry(event.id).or_insert_with(|| event.clone());

        let mut entities = self.entities.write();
        for entity in &event.entities {
            if entity.value.is_empty() {
                continue;
            }
            let exists = entities.iter().any(|row| {
                row.incident_id == event.incident_id
                    && row.entity.entity_type == entity.entity_type
                    && row.entity.value == entity.value
            });
            if !exists {
                entities.push(EntityRow {
                    incident_id: event.incident_id,
                    tenant_id,
                    entity: entity.clone(),
                });
            }
        }
        Ok(true)
    }

    async fn update_incident(
        &self,
        tenant_id: Uuid,
        incident_id: Uuid,
        update: IncidentUpdate,
    ) -> Result<(), StoreError> {
        let mut incidents = self.incidents.write();
        let incident = incidents
            .get_mut(&incident_id)
            .filter(|i| i.tenant_id == tenant_id)
            .ok_or(StoreError::NotFound)?;

        if let Some(new_state) = update.state {
            if new_state != incident.state {
                if !incident.state.can_transition(new_state) {
                    return Err(StoreError::Conflict(format!(
                        "illegal transition {} -> {}",
                        incident.state, new_state
                    )));
                }
                incident.state = new_state;
                if new_state == IncidentState::Closed && incident.closed_at.is_none() {
                    incident.closed_at = Some(Utc::now());
                }
            }
        }
        if let Some(confidence) = update.confidence {
            incident.confidence = confidence;
        }
        if let Some(severity) = update.severity {
            incident.severity = Some(severity);
        }
        if let Some(tokens_used) = update.tokens_used {
            incident.tokens_used = tokens_used;
        }
        if let Some(summary) = update.summary {
            incident.summary = Some(summary);
        }
        if let Some(outcome) = update.outcome {
            incident.outcome = Some(outcome);
        }
        if let Some(reason) = update.escalation_reason {
            incident.escalation_reason = Some(reason);
        }
        if let Some(campaign_id) = update.campaign_id {
            incident.campaign_id = Some(campaign_id);
        }
        incident.updated_at = Utc::now();
        Ok(())
    }

    async fn get_incident(
        &self,
        tenant_id: Uuid,
        incident_id: Uuid,
    ) -> Result<Option<Incident>, StoreError> {
        Ok(self
            .incidents
            .read()
            .get(&incident_id)
            .filter(|i| i.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_incidents(
        &self,
        tenant_id: Uuid,
        filter: &IncidentFilter,
    ) -> Result<Vec<Incident>, StoreError> {
        let mut rows: Vec<Incident> = self
            .incidents
            .read()
            .values()
            .filter(|i| i.tenant_id == tenant_id)
            .filter(|i| filter.state.map(|s| i.state == s).unwrap_or(true))
            .filter(|i| filter.severity.map(|s| i.severity == Some(s)).unwrap_or(true))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.unwrap_or(50).max(0) as usize;
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn add_finding(&self, tenant_id: Uuid, finding: NewFinding) -> Result<bool, StoreError> {
        let ok = self
            .incidents
            .read()
            .get(&finding.incident_id)
            .map(|i| i.tenant_id == tenant_id)
            .unwrap_or(false);
        if !ok {
            return Ok(false);
        }
        self.findings.write().push(AgentFinding {
            id: Uuid::new_v4(),
            incident_id: finding.incident_id,
            tenant_id,
            agent: finding.agent,
            finding_type: finding.finding_type,
            confidence: finding.confidence,
            severity: finding.severity,
            content: finding.content,
            reasoning: finding.reasoning,
            tokens_consumed: finding.tokens_consumed,
            created_at: Utc::now(),
        });
        Ok(true)
    }

    async fn get_findings(
        &self,
        tenant_id: Uuid,
        incident_id: Uuid,
    ) -> Result<Vec<AgentFinding>, StoreError> {
        let mut rows: Vec<AgentFinding> = self
            .findings
            .read()
            .iter()
            .filter(|f| f.incident_id == incident_id && f.tenant_id == tenant_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn find_incidents_by_entity(
        &self,
        tenant_id: Uuid,
        entity_type: &str,
        entity_value: &str,
        minutes_back: i64,
        exclude: Option<Uuid>,
    ) -> Result<Vec<Incident>, StoreError> {
        let cutoff = Utc::now() - Duration::minutes(minutes_back);
        let ids: HashSet<Uuid> = self
            .entities
            .read()
            .iter()
            .filter(|row| {
                row.tenant_id == tenant_id
                    && row.entity.entity_type == entity_type
                    && row.entity.value == entity_value
                    && Some(row.incident_id) != exclude
            })
            .map(|row| row.incident_id)
            .collect();

        let incidents = self.incidents.read();
        let mut rows: Vec<Incident> = ids
            .into_iter()
            .filter_map(|id| incidents.get(&id))
            .filter(|i| i.tenant_id == tenant_id && i.created_at >= cutoff)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(50);
        Ok(rows)
    }

    async fn find_related_incidents(
        &self,
        tenant_id: Uuid,
        incident_id: Uuid,
        minutes_back: i64,
    ) -> Result<RelatedIncidents, StoreError> {
        let own_entities: Vec<Entity> = self
            .entities
            .read()
            .iter()
            .filter(|row| row.incident_id == incident_id && row.tenant_id == tenant_id)
            .map(|row| row.entity.clone())
            .collect();
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
        let mut links = self.links.write();
        if links
            .iter()
            .any(|l| l.tenant_id == tenant_id && l.incident_a == a && l.incident_b == b)
        {
            return Ok(false);
        }
        links.push(LinkRow {
            tenant_id,
            incident_a: a,
            incident_b: b,
            link_type: link_type.to_string(),
            confidence,
            shared_entities: shared_entities.to_vec(),
            link_reason: link_reason.to_string(),
            created_at: Utc::now(),
        });
        Ok(true)
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
        {
            let mut incidents = self.incidents.write();
            for id in incident_ids {
                if let Some(incident) = incidents.get_mut(id) {
                    if incident.tenant_id == tenant_id {
                        incident.campaign_id = Some(campaign_id);
                        incident.updated_at = Utc::now();
                    }
                }
            }
        }
        for (i, a) in incident_ids.iter().enumerate() {
            for b in incident_ids.iter().skip(i + 1) {
                let _ = self
                    .link_incidents(tenant_id, *a, *b, "campaign", 0.95, &[], "campaign grouping")
                    .await?;
            }
        }
        Ok(Some(campaign_id))
    }

    async fn get_campaign_incidents(
        &self,
        tenant_id: Uuid,
        incident_id: Uuid,
    ) -> Result<Vec<Incident>, StoreError> {
        let links = self.links.read();
        let mut visited: HashSet<Uuid> = HashSet::new();
        let mut frontier = vec![incident_id];
        visited.insert(incident_id);

        for _ in 0..CAMPAIGN_DEPTH_LIMIT {
            let mut next = Vec::new();
            for id in &frontier {
                for link in links.iter().filter(|l| l.tenant_id == tenant_id) {
                    let neighbor = if link.incident_a == *id {
                        link.incident_b
                    } else if link.incident_b == *id {
                        link.incident_a
                    } else {
                        continue;
                    };
                    if visited.insert(neighbor) {
                        next.push(neighbor);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        drop(links);

        let incidents = self.incidents.read();
        let mut rows: Vec<Incident> = visited
            .into_iter()
            .filter_map(|id| incidents.get(&id))
            .filter(|i| i.tenant_id == tenant_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn get_entity_timeline(
        &self,
        tenant_id: Uuid,
        entity_type: &str,
        entity_value: &str,
        hours_back: i64,
    ) -> Result<Vec<IncidentSummary>, StoreError> {
        let incidents =
            self.find_incidents_by_entity(tenant_id, entity_type, entity_value, hours_back * 60, None)
                .await?;
        let findings = self.findings.read();
        let mut rows: Vec<IncidentSummary> = incidents
            .into_iter()
            .map(|incident| {
                let mut agents: Vec<String> = Vec::new();
                let mut finding_types: Vec<String> = Vec::new();
                for finding in findings.iter().filter(|f| f.incident_id == incident.id) {
                    if !agents.contains(&finding.agent) {
                        agents.push(finding.agent.clone());
                    }
                    if !finding_types.contains(&finding.finding_type) {
                        finding_types.push(finding.finding_type.clone());
                    }
                }
                IncidentSummary {
                    id: incident.id,
                    state: incident.state,
                    severity: incident.severity,
                    confidence: incident.confidence,
                    summary: incident.summary,
                    created_at: incident.created_at,
                    agents,
                    finding_types,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn insert_action(&self, tenant_id: Uuid, action: &Action) -> Result<(), StoreError> {
        if action.tenant_id != tenant_id {
            return Err(StoreError::Validation("action tenant mismatch".into()));
        }
        self.actions.write().insert(action.id, action.clone());
        Ok(())
    }

    async fn update_action(
        &self,
        tenant_id: Uuid,
        action_id: Uuid,
        update: ActionUpdate,
    ) -> Result<(), StoreError> {
        let mut actions = self.actions.write();
        let action = actions
            .get_mut(&action_id)
            .filter(|a| a.tenant_id == tenant_id)
            .ok_or(StoreError::NotFound)?;

        if let Some(status) = update.status {
            if status != action.status {
                if !action.status.can_transition(status) {
                    return Err(StoreError::Conflict(format!(
                        "illegal action transition {} -> {}",
                        action.status, status
                    )));
                }
                action.status = status;
                match status {
                    ActionStatus::Approved => action.approved_at = Some(Utc::now()),
                    ActionStatus::Executing => action.executed_at = Some(Utc::now()),
                    _ => {}
                }
            }
        }
        if let Some(approved_by) = update.approved_by {
            action.approved_by = Some(approved_by);
        }
        if let Some(result) = update.result {
            action.result = Some(result);
        }
        if let Some(handle) = update.rollback_handle {
            action.rollback_handle = Some(handle);
        }
        if let Some(reason) = update.veto_reason {
            action.veto_reason = Some(reason);
        }
        Ok(())
    }

    async fn list_actions(
        &self,
        tenant_id: Uuid,
        incident_id: Uuid,
    ) -> Result<Vec<Action>, StoreError> {
        let mut rows: Vec<Action> = self
            .actions
            .read()
            .values()
            .filter(|a| a.tenant_id == tenant_id && a.incident_id == incident_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.proposed_at.cmp(&b.proposed_at));
        Ok(rows)
    }

    async fn campaign_graph(
        &self,
        tenant_id: Uuid,
        hours_back: i64,
    ) -> Result<CampaignGraph, StoreError> {
        let cutoff = Utc::now() - Duration::hours(hours_back);
        let entities = self.entities.read();
        let mut nodes: Vec<GraphNode> = self
            .incidents
            .read()
            .values()
            .filter(|i| i.tenant_id == tenant_id && i.created_at >= cutoff)
            .map(|i| GraphNode {
                id: i.id,
                state: i.state.as_str().to_string(),
                severity: i.severity,
                confidence: i.confidence,
                summary: i.summary.clone(),
                entity_count: entities.iter().filter(|e| e.incident_id == i.id).count() as i64,
                created_at: i.created_at,
            })
            .collect();
        nodes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        nodes.truncate(100);

        let edges: Vec<GraphEdge> = self
            .links
            .read()
            .iter()
            .filter(|l| l.tenant_id == tenant_id && l.created_at >= cutoff)
            .map(|l| GraphEdge {
                source: l.incident_a,
                target: l.incident_b,
                link_type: l.link_type.clone(),
                confidence: l.confidence,
            })
            .collect();

        Ok(CampaignGraph { nodes, edges })
    }

    async fn campaign_stats(&self, tenant_id: Uuid) -> Result<CampaignStats, StoreError> {
        let links = self.links.read();
        let tenant_links: Vec<&LinkRow> =
            links.iter().filter(|l| l.tenant_id == tenant_id).collect();

        let mut linked: HashSet<Uuid> = HashSet::new();
        let mut by_type: HashMap<String, (i64, f64)> = HashMap::new();
        for link in &tenant_links {
            linked.insert(link.incident_a);
            linked.insert(link.incident_b);
            let entry = by_type.entry(link.link_type.clone()).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += link.confidence;
        }
        let mut link_types: Vec<LinkTypeStat> = by_type
            .into_iter()
            .map(|(link_type, (count, sum))| LinkTypeStat {
                link_type,
                count,
                avg_confidence: sum / count as f64,
            })
            .collect();
        link_types.sort_by(|a, b| b.count.cmp(&a.count));

        let entities = self.entities.read();
        let mut entity_incidents: HashMap<(String, String), HashSet<Uuid>> = HashMap::new();
        for row in entities.iter().filter(|e| e.tenant_id == tenant_id) {
            entity_incidents
                .entry((row.entity.entity_type.clone(), row.entity.value.clone()))
                .or_default()
                .insert(row.incident_id);
        }
        let mut top_shared_entities: Vec<TopEntityStat> = entity_incidents
            .into_iter()
            .filter(|(_, ids)| ids.len() >= 2)
            .map(|((entity_type, entity_value), ids)| TopEntityStat {
                entity_type,
                entity_value,
                incident_count: ids.len() as i64,
            })
            .collect();
        top_shared_entities.sort_by(|a, b| b.incident_count.cmp(&a.incident_count));
        top_shared_entities.truncate(10);

        Ok(CampaignStats {
            total_links: tenant_links.len() as i64,
            high_confidence_links: tenant_links.iter().filter(|l| l.confidence >= 0.7).count()
                as i64,
            linked_incidents: linked.len() as i64,
            top_shared_entities,
            link_types,
        })
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.audit.write().push(entry.clone());
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event_for(tenant: Uuid, entities: Vec<Entity>) -> Event {
        Event {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            incident_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: "test".into(),
            source_type: "test".into(),
            event_type: "auth.brute_force".into(),
            severity: Severity::High,
            entities,
            raw_payload: json!({}),
        }
    }

    #[tokio::test]
    async fn test_create_incident_is_idempotent() {
        let store = MemoryStorage::new();
        let tenant = Uuid::new_v4();
        let event = event_for(tenant, vec![Entity::new("ip", "1.2.3.4")]);

        assert!(store
            .create_incident(tenant, &event, Severity::High, 50_000)
            .await
            .unwrap());
        assert!(!store
            .create_incident(tenant, &event, Severity::High, 50_000)
            .await
            .unwrap());
        assert_eq!(
            store
                .list_incidents(tenant, &IncidentFilter::default())
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_cross_tenant_reads_return_nothing() {
        let store = MemoryStorage::new();
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();
        let event = event_for(tenant_a, vec![Entity::new("user", "jdoe")]);
        store
            .create_incident(tenant_a, &event, Severity::High, 50_000)
            .await
            .unwrap();

        assert!(store
            .get_incident(tenant_b, event.incident_id)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .list_incidents(tenant_b, &IncidentFilter::default())
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .get_findings(tenant_b, event.incident_id)
            .await
            .unwrap()
            .is_empty());
        assert!(matches!(
            store
                .update_incident(tenant_b, event.incident_id, IncidentUpdate::default())
                .await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_illegal_state_transition_is_conflict() {
        let store = MemoryStorage::new();
        let tenant = Uuid::new_v4();
        let event = event_for(tenant, vec![]);
        store
            .create_incident(tenant, &event, Severity::Low, 50_000)
            .await
            .unwrap();

        // DETECTION -> EXECUTION is not in the table.
        let result = store
            .update_incident(
                tenant,
                event.incident_id,
                IncidentUpdate::state(IncidentState::Execution),
            )
            .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_closed_at_is_stamped_once() {
        let store = MemoryStorage::new();
        let tenant = Uuid::new_v4();
        let event = event_for(tenant, vec![]);
        store
            .create_incident(tenant, &event, Severity::Low, 50_000)
            .await
            .unwrap();

        store
            .update_incident(
                tenant,
                event.incident_id,
                IncidentUpdate::state(IncidentState::Closed),
            )
            .await
            .unwrap();
        let incident = store
            .get_incident(tenant, event.incident_id)
            .await
            .unwrap()
            .unwrap();
        assert!(incident.closed_at.is_some());
    }

    #[tokio::test]
    async fn test_link_insert_is_idempotent_and_canonical() {
        let store = MemoryStorage::new();
        let tenant = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(store
            .link_incidents(tenant, a, b, "shared_ip", 0.8, &[], "test")
            .await
            .unwrap());
        // Same pair reversed is the same undirected link.
        assert!(!store
            .link_incidents(tenant, b, a, "shared_ip", 0.8, &[], "test")
            .await
            .unwrap());
        assert!(store
            .link_incidents(tenant, a, a, "shared_ip", 0.8, &[], "test")
            .await
            .is_err());

        let stats = store.campaign_stats(tenant).await.unwrap();
        assert_eq!(stats.total_links, 1);
    }

    #[tokio::test]
    async fn test_campaign_formation_from_shared_entity() {
        let store = MemoryStorage::new();
        let tenant = Uuid::new_v4();
        let shared = Entity::new("user", "jdoe");

        let mut ids = Vec::new();
        for _ in 0..3 {
            let event = event_for(tenant, vec![shared.clone()]);
            store
                .create_incident(tenant, &event, Severity::High, 50_000)
                .await
                .unwrap();
            ids.push(event.incident_id);
        }

        let related = store
            .find_related_incidents(tenant, ids[2], 60)
            .await
            .unwrap();
        assert_eq!(related.related.len(), 2);
        assert!(related.is_campaign);
        assert!(related.campaign_score > 0.0);

        let campaign_id = store.create_campaign(tenant, &ids).await.unwrap().unwrap();
        for id in &ids {
            let incident = store.get_incident(tenant, *id).await.unwrap().unwrap();
            assert_eq!(incident.campaign_id, Some(campaign_id));
        }
        // Pairwise links over 3 members: 3 undirected edges.
        assert_eq!(store.campaign_stats(tenant).await.unwrap().total_links, 3);

        let members = store.get_campaign_incidents(tenant, ids[0]).await.unwrap();
        assert_eq!(members.len(), 3);
    }

    #[tokio::test]
    async fn test_campaign_traversal_is_depth_bounded() {
        let store = MemoryStorage::new();
        let tenant = Uuid::new_v4();

        // A chain of 15 incidents linked end to end.
        let mut ids = Vec::new();
        for _ in 0..15 {
            let event = event_for(tenant, vec![]);
            store
                .create_incident(tenant, &event, Severity::Low, 50_000)
                .await
                .unwrap();
            ids.push(event.incident_id);
        }
        for pair in ids.windows(2) {
            store
                .link_incidents(tenant, pair[0], pair[1], "chain", 0.9, &[], "test")
                .await
                .unwrap();
        }

        let members = store.get_campaign_incidents(tenant, ids[0]).await.unwrap();
        // Seed plus at most 10 hops.
        assert_eq!(members.len(), CAMPAIGN_DEPTH_LIMIT + 1);
    }

    #[tokio::test]
    async fn test_entity_timeline_collects_agents() {
        let store = MemoryStorage::new();
        let tenant = Uuid::new_v4();
        let event = event_for(tenant, vec![Entity::new("ip", "10.0.0.1")]);
        store
            .create_incident(tenant, &event, Severity::Medium, 50_000)
            .await
            .unwrap();
        store
            .add_finding(
                tenant,
                NewFinding {
                    incident_id: event.incident_id,
                    agent: "hunter".into(),
                    finding_type: "detection".into(),
                    confidence: 0.7,
                    severity: Severity::Medium,
                    content: json!({}),
                    reasoning: String::new(),
                    tokens_consumed: 10,
                },
            )
            .await
            .unwrap();

        let timeline = store
            .get_entity_timeline(tenant, "ip", "10.0.0.1", 24)
            .await
            .unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].agents, vec!["hunter"]);
        assert_eq!(timeline[0].finding_types, vec!["detection"]);
    }

    #[tokio::test]
    async fn test_action_ladder_enforced() {
        let store = MemoryStorage::new();
        let tenant = Uuid::new_v4();
        let action = Action {
            id: Uuid::new_v4(),
            incident_id: Uuid::new_v4(),
            tenant_id: tenant,
            action_type: "block_ip".into(),
            target: "1.2.3.4".into(),
            parameters: json!({}),
            risk_level: hornet_types::ActionRisk::Medium,
            status: ActionStatus::Proposed,
            proposed_by: "responder".into(),
            proposed_at: Utc::now(),
            approved_by: None,
            approved_at: None,
            executed_at: None,
            result: None,
            rollback_plan: json!({}),
            rollback_handle: None,
            justification: "test".into(),
            veto_reason: None,
        };
        store.insert_action(tenant, &action).await.unwrap();

        // PROPOSED -> COMPLETED skips the ladder.
        let result = store
            .update_action(
                tenant,
                action.id,
                ActionUpdate {
                    status: Some(ActionStatus::Completed),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));

        for status in [
            ActionStatus::Approved,
            ActionStatus::Executing,
            ActionStatus::Completed,
        ] {
            store
                .update_action(
                    tenant,
                    action.id,
                    ActionUpdate {
                        status: Some(status),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        let rows = store.list_actions(tenant, action.incident_id).await.unwrap();
        assert_eq!(rows[0].status, ActionStatus::Completed);
        assert!(rows[0].approved_at.is_some());
        assert!(rows[0].executed_at.is_some());
    }
}
