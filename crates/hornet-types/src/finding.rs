//! HORNET: Agent Findings
//!
//! Append-only records produced by agents while an incident is processed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::Severity;

/// A finding recorded by an agent against an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentFinding {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub tenant_id: Uuid,
    /// Agent persona that produced the finding
    pub agent: String,
    /// Finding class (detection, intel, verdict, proposal, timeline, ...)
    pub finding_type: String,
    /// Agent confidence in [0,1]
    pub confidence: f64,
    pub severity: Severity,
    /// Agent payload, opaque to the core
    pub content: serde_json::Value,
    /// Free-text reasoning
    pub reasoning: String,
    /// LLM tokens the producing call consumed
    pub tokens_consumed: i64,
    pub created_at: DateTime<Utc>,
}
