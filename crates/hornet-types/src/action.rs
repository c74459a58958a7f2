//! HORNET: Response Actions
//!
//! Actions proposed by the responder, decided in oversight, and executed
//! through connectors. Status transitions are monotonic; a terminal status
//! is never left.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Action lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionStatus {
    Proposed,
    Approved,
    Rejected,
    Vetoed,
    Executing,
    Completed,
    Failed,
    RolledBack,
}

impl ActionStatus {
    /// Uppercase wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "PROPOSED",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Vetoed => "VETOED",
            Self::Executing => "EXECUTING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::RolledBack => "ROLLED_BACK",
        }
    }

    /// Parse the uppercase wire form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PROPOSED" => Some(Self::Proposed),
            "APPROVED" => Some(Self::Approved),
            "REJECTED" => Some(Self::Rejected),
            "VETOED" => Some(Self::Vetoed),
            "EXECUTING" => Some(Self::Executing),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "ROLLED_BACK" => Some(Self::RolledBack),
            _ => None,
        }
    }

    /// Legal next statuses. Terminal statuses return an empty slice, except
    /// COMPLETED which may still be rolled back explicitly.
    pub fn allowed_transitions(&self) -> &'static [ActionStatus] {
        use ActionStatus::*;
        match self {
            Proposed => &[Approved, Rejected, Vetoed],
            Approved => &[Executing],
            Executing => &[Completed, Failed],
            Completed => &[RolledBack],
            Rejected | Vetoed | Failed | RolledBack => &[],
        }
    }

    pub fn can_transition(&self, to: ActionStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared risk of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionRisk {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl ActionRisk {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn parse_lossy(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Self::None,
            "MEDIUM" => Self::Medium,
            "HIGH" => Self::High,
            "CRITICAL" => Self::Critical,
            _ => Self::Low,
        }
    }
}

/// Decision emitted by the oversight agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OversightDecision {
    Approve,
    Partial,
    Veto,
    Escalate,
}

/// Human decision on a pending action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HumanResponse {
    Approve,
    ApproveModified,
    Reject,
    Investigate,
    OverrideVeto,
}

/// A response action owned by an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub tenant_id: Uuid,
    /// Action verb (block_ip, disable_account, isolate_endpoint, ...)
    pub action_type: String,
    /// Target the action applies to
    pub target: String,
    /// Connector-specific parameters
    pub parameters: serde_json::Value,
    pub risk_level: ActionRisk,
    pub status: ActionStatus,
    /// Agent that proposed the action
    pub proposed_by: String,
    pub proposed_at: DateTime<Utc>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    /// Connector result payload
    pub result: Option<serde_json::Value>,
    /// Rollback descriptor supplied in the proposal
    pub rollback_plan: serde_json::Value,
    /// Opaque handle issued by the connector on success
    pub rollback_handle: Option<String>,
    pub justification: String,
    pub veto_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ladder() {
        use ActionStatus::*;
        assert!(Proposed.can_transition(Approved));
        assert!(Approved.can_transition(Executing));
        assert!(Executing.can_transition(Completed));
        assert!(Executing.can_transition(Failed));
        assert!(Completed.can_transition(RolledBack));
    }

    #[test]
    fn test_no_return_from_terminal() {
        use ActionStatus::*;
        for terminal in [Rejected, Vetoed, Failed, RolledBack] {
            assert!(terminal.allowed_transitions().is_empty());
        }
        // Failure never rolls back implicitly.
        assert!(!Failed.can_transition(RolledBack));
        // No skipping the approval gate.
        assert!(!Proposed.can_transition(Executing));
        assert!(!Proposed.can_transition(Completed));
    }

    #[test]
    fn test_risk_ordering() {
        assert!(ActionRisk::Critical > ActionRisk::High);
        assert!(ActionRisk::None < ActionRisk::Low);
        assert_eq!(ActionRisk::parse_lossy("high"), ActionRisk::High);
        assert_eq!(ActionRisk::parse_lossy("unknown"), ActionRisk::Low);
    }

    #[test]
    fn test_oversight_decision_wire_form() {
        let d: OversightDecision = serde_json::from_str("\"VETO\"").unwrap();
        assert_eq!(d, OversightDecision::Veto);
        let h: HumanResponse = serde_json::from_str("\"APPROVE_MODIFIED\"").unwrap();
        assert_eq!(h, HumanResponse::ApproveModified);
    }
}
