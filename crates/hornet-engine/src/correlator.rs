//! HORNET: Campaign Correlator
//!
//! Joins an incident against others sharing entities inside a sliding
//! window, scores the set as a campaign, and persists links. Runs during
//! enrichment.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use hornet_store::{RelatedIncidents, Storage};
use hornet_types::{Entity, HornetConfig, HornetError};

/// Score at or above which a related set is a campaign.
const CAMPAIGN_SCORE_THRESHOLD: f64 = 0.5;
/// Members (related + this incident) required for a campaign grouping.
const CAMPAIGN_MIN_MEMBERS: usize = 3;

/// What correlation concluded for one incident.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CorrelationOutcome {
    pub related_count: usize,
    pub campaign_score: f64,
    pub is_campaign: bool,
    pub links_created: usize,
    pub campaign_id: Option<Uuid>,
}

/// Entity-driven cross-incident correlation.
pub struct CampaignCorrelator {
    storage: Arc<dyn Storage>,
    window_minutes: i64,
}

impl CampaignCorrelator {
    pub fn new(storage: Arc<dyn Storage>, config: &HornetConfig) -> Self {
        Self {
            storage,
            window_minutes: config.campaign_window_minutes,
        }
    }

    /// Correlate one incident. Links are inserted idempotently; a campaign
    /// grouping is created once the confirmed set reaches the member floor.
    pub async fn correlate(
        &self,
        tenant_id: Uuid,
        incident_id: Uuid,
    ) -> Result<CorrelationOutcome, HornetError> {
        let related = self
            .storage
            .find_related_incidents(tenant_id, incident_id, self.window_minutes)
            .await?;

        let mut outcome = CorrelationOutcome {
            related_count: related.related.len(),
            campaign_score: related.campaign_score,
            is_campaign: related.is_campaign,
            links_created: 0,
            campaign_id: None,
        };

        if !related.is_campaign {
            return Ok(outcome);
        }

        for other in &related.related {
            let link_type = link_type_for(&other.shared_entities);
            let reason = format!(
                "shares {} entit{} within {} minutes",
                other.shared_entities.len(),
                if other.shared_entities.len() == 1 { "y" } else { "ies" },
                self.window_minutes
            );
            let inserted = self
                .storage
                .link_incidents(
                    tenant_id,
                    incident_id,
                    other.id,
                    &link_type,
                    related.campaign_score.max(CAMPAIGN_SCORE_THRESHOLD),
                    &other.shared_entities,
                    &reason,
                )
                .await?;
            if inserted {
                outcome.links_created += 1;
            }
        }

        if related.related.len() + 1 >= CAMPAIGN_MIN_MEMBERS {
            let mut members: Vec<Uuid> = related.related.iter().map(|r| r.id).collect();
            members.push(incident_id);
            outcome.campaign_id = self.storage.create_campaign(tenant_id, &members).await?;
            if let Some(campaign_id) = outcome.campaign_id {
                tracing::info!(
                    %incident_id,
                    %campaign_id,
                    members = members.len(),
                    score = related.campaign_score,
                    "campaign confirmed"
                );
                metrics::increment_counter!("hornet_campaigns_total");
            }
        }

        Ok(outcome)
    }

    /// Raw related-incident view without side effects.
    pub async fn related(
        &self,
        tenant_id: Uuid,
        incident_id: Uuid,
    ) -> Result<RelatedIncidents, HornetError> {
        Ok(self
            .storage
            .find_related_incidents(tenant_id, incident_id, self.window_minutes)
            .await?)
    }
}

/// Link type from the dominant shared-entity class ("shared_ip",
/// "shared_user", ...). Ties resolve to the lexicographically first class.
pub fn link_type_for(shared: &[Entity]) -> String {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for entity in shared {
        *counts.entry(entity.entity_type.as_str()).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
        .map(|(entity_type, _)| format!("shared_{entity_type}"))
        .unwrap_or_else(|| "shared_entity".to_string())
}
