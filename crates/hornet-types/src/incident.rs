//! HORNET: Incidents
//!
//! The incident record and its finite-state machine. Transitions are a
//! static table on the state enum; any transition outside the table is
//! rejected by the coordinator and the storage layer stays untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::Severity;

/// FSM states an incident moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IncidentState {
    Idle,
    Detection,
    Enrichment,
    Analysis,
    Proposal,
    Oversight,
    Execution,
    Escalated,
    Closed,
    Error,
}

impl IncidentState {
    /// Uppercase wire form, as stored and logged.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Detection => "DETECTION",
            Self::Enrichment => "ENRICHMENT",
            Self::Analysis => "ANALYSIS",
            Self::Proposal => "PROPOSAL",
            Self::Oversight => "OVERSIGHT",
            Self::Execution => "EXECUTION",
            Self::Escalated => "ESCALATED",
            Self::Closed => "CLOSED",
            Self::Error => "ERROR",
        }
    }

    /// Parse the uppercase wire form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IDLE" => Some(Self::Idle),
            "DETECTION" => Some(Self::Detection),
            "ENRICHMENT" => Some(Self::Enrichment),
            "ANALYSIS" => Some(Self::Analysis),
            "PROPOSAL" => Some(Self::Proposal),
            "OVERSIGHT" => Some(Self::Oversight),
            "EXECUTION" => Some(Self::Execution),
            "ESCALATED" => Some(Self::Escalated),
            "CLOSED" => Some(Self::Closed),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    /// States reachable from this one. Every active phase can fall into
    /// ERROR: an unhandled failure inside a phase lands there before the
    /// cleanup step closes the incident.
    pub fn allowed_transitions(&self) -> &'static [IncidentState] {
        use IncidentState::*;
        match self {
            Idle => &[Detection],
            Detection => &[Enrichment, Closed, Escalated, Error],
            Enrichment => &[Analysis, Escalated, Error],
            Analysis => &[Proposal, Closed, Escalated, Error],
            Proposal => &[Oversight, Closed, Escalated, Error],
            Oversight => &[Execution, Closed, Escalated, Error],
            Execution => &[Closed, Error, Escalated],
            Escalated => &[Closed, Analysis],
            Error => &[Closed],
            Closed => &[],
        }
    }

    /// Whether `to` is a legal next state.
    pub fn can_transition(&self, to: IncidentState) -> bool {
        self.allowed_transitions().contains(&to)
    }

    /// CLOSED is the only state with no exits.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Active phases the coordinator drives (everything before a resting state).
    pub fn is_active_phase(&self) -> bool {
        matches!(
            self,
            Self::Detection
                | Self::Enrichment
                | Self::Analysis
                | Self::Proposal
                | Self::Oversight
                | Self::Execution
        )
    }
}

impl std::fmt::Display for IncidentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Analyst verdict on an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Confirmed,
    Dismissed,
    Uncertain,
}

/// A tenant-scoped incident record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    /// Incident id
    pub id: Uuid,
    /// Owning tenant
    pub tenant_id: Uuid,
    /// Current FSM state
    pub state: IncidentState,
    /// Severity, once assessed
    pub severity: Option<Severity>,
    /// Aggregated confidence in [0,1]
    pub confidence: f64,
    /// Analyst summary
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set exactly once, when the incident closes
    pub closed_at: Option<DateTime<Utc>>,
    /// Closure outcome (resolved, dismissed, budget_exhausted, ...)
    pub outcome: Option<String>,
    /// Tokens consumed by agent calls; monotonic
    pub tokens_used: i64,
    /// Token budget for the whole run
    pub token_budget: i64,
    /// Reason recorded on VETO / ESCALATE
    pub escalation_reason: Option<String>,
    /// Campaign membership, if correlated
    pub campaign_id: Option<Uuid>,
}

/// Partial update applied to an incident row.
#[derive(Debug, Clone, Default)]
pub struct IncidentUpdate {
    pub state: Option<IncidentState>,
    pub confidence: Option<f64>,
    pub severity: Option<Severity>,
    pub tokens_used: Option<i64>,
    pub summary: Option<String>,
    pub outcome: Option<String>,
    pub escalation_reason: Option<String>,
    pub campaign_id: Option<Uuid>,
}

impl IncidentUpdate {
    pub fn state(state: IncidentState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }
}

/// Listing filter for incidents.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncidentFilter {
    pub state: Option<IncidentState>,
    pub severity: Option<Severity>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Compact incident view used by entity timelines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentSummary {
    pub id: Uuid,
    pub state: IncidentState,
    pub severity: Option<Severity>,
    pub confidence: f64,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Agents that produced findings on the incident
    pub agents: Vec<String>,
    /// Distinct finding types recorded
    pub finding_types: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use IncidentState::*;
        assert!(Idle.can_transition(Detection));
        assert!(Detection.can_transition(Enrichment));
        assert!(Detection.can_transition(Closed));
        assert!(Enrichment.can_transition(Analysis));
        assert!(Oversight.can_transition(Execution));
        assert!(Execution.can_transition(Error));
        assert!(Escalated.can_transition(Analysis));
        assert!(Error.can_transition(Closed));
    }

    #[test]
    fn test_illegal_transitions() {
        use IncidentState::*;
        assert!(!Closed.can_transition(Detection));
        assert!(!Detection.can_transition(Execution));
        assert!(!Enrichment.can_transition(Closed));
        assert!(!Analysis.can_transition(Execution));
        assert!(!Idle.can_transition(Closed));
    }

    #[test]
    fn test_closed_is_terminal() {
        assert!(IncidentState::Closed.is_terminal());
        assert!(IncidentState::Closed.allowed_transitions().is_empty());
        assert!(!IncidentState::Escalated.is_terminal());
    }

    #[test]
    fn test_state_parse_roundtrip() {
        for s in [
            "IDLE",
            "DETECTION",
            "ENRICHMENT",
            "ANALYSIS",
            "PROPOSAL",
            "OVERSIGHT",
            "EXECUTION",
            "ESCALATED",
            "CLOSED",
            "ERROR",
        ] {
            let state = IncidentState::parse(s).unwrap();
            assert_eq!(state.as_str(), s);
        }
        assert!(IncidentState::parse("BOGUS").is_none());
    }

    #[test]
    fn test_every_path_reaches_closed() {
        // From any state there is a path to CLOSED (no dead ends besides CLOSED).
        use std::collections::HashSet;
        let all = [
            IncidentState::Idle,
            IncidentState::Detection,
            IncidentState::Enrichment,
            IncidentState::Analysis,
            IncidentState::Proposal,
            IncidentState::Oversight,
            IncidentState::Execution,
            IncidentState::Escalated,
            IncidentState::Error,
        ];
        for start in all {
            let mut seen = HashSet::new();
            let mut frontier = vec![start];
            while let Some(s) = frontier.pop() {
                if !seen.insert(s) {
                    continue;
                }
                frontier.extend(s.allowed_transitions().iter().copied());
            }
            assert!(seen.contains(&IncidentState::Closed), "{start} cannot reach CLOSED");
        }
    }
}
