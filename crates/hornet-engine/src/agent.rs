//! HORNET: Agent Seam
//!
//! The core treats an agent as an opaque async function from context to
//! output with a declared token cost. Implementations (prompts, LLM calls)
//! live outside the engine and are registered by name at startup.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hornet_types::{
    ActionRisk, Event, HornetError, IncidentState, OversightDecision, Severity, Verdict,
};

/// Context handed to every agent invocation.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub incident_id: Uuid,
    pub tenant_id: Uuid,
    /// FSM phase the call happens in
    pub state: IncidentState,
    /// Events attached to the incident; first is the triggering one
    pub events: Vec<Event>,
    /// Findings accumulated so far
    pub findings: Vec<AgentOutput>,
    /// Entity values grouped by class
    pub entities: HashMap<String, BTreeSet<String>>,
    pub token_budget: i64,
    pub tokens_used: i64,
}

impl AgentContext {
    /// Build a context from a triggering event.
    pub fn from_event(event: Event, state: IncidentState, token_budget: i64) -> Self {
        let mut entities: HashMap<String, BTreeSet<String>> = HashMap::new();
        for entity in &event.entities {
            entities
                .entry(entity.entity_type.clone())
                .or_default()
                .insert(entity.value.clone());
        }
        Self {
            incident_id: event.incident_id,
            tenant_id: event.tenant_id,
            state,
            events: vec![event],
            findings: Vec::new(),
            entities,
            token_budget,
            tokens_used: 0,
        }
    }
}

/// What an agent returns. `content` stays opaque to the core except for the
/// analyst verdict, the oversight decision, and the responder proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub agent_name: String,
    /// Output class (detection, routing, intel, verdict, proposal, decision)
    pub output_type: String,
    pub confidence: f64,
    pub severity: Severity,
    pub reasoning: String,
    pub content: serde_json::Value,
    pub tokens_used: i64,
}

/// One LLM-backed worker persona.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, context: &AgentContext) -> Result<AgentOutput, HornetError>;
}

/// Holds agent instances by name.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent: Arc<dyn Agent>) {
        let name = agent.name().to_string();
        self.agents.write().insert(name.clone(), agent);
        tracing::debug!(agent = %name, "agent registered");
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }
}

/// Agent returning a fixed output. Used for development wiring and tests;
/// real personas implement [`Agent`] outside the engine.
pub struct StaticAgent {
    name: String,
    output_type: String,
    confidence: f64,
    severity: Severity,
    content: serde_json::Value,
    tokens_used: i64,
}

impl StaticAgent {
    pub fn new(name: impl Into<String>, output_type: impl Into<String>, confidence: f64) -> Self {
        Self {
            name: name.into(),
            output_type: output_type.into(),
            confidence,
            severity: Severity::Medium,
            content: serde_json::Value::Object(Default::default()),
            tokens_used: 100,
        }
    }

    pub fn with_content(mut self, content: serde_json::Value) -> Self {
        self.content = content;
        self
    }

    pub fn with_tokens(mut self, tokens: i64) -> Self {
        self.tokens_used = tokens;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

#[async_trait]
impl Agent for StaticAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, _context: &AgentContext) -> Result<AgentOutput, HornetError> {
        Ok(AgentOutput {
            agent_name: self.name.clone(),
            output_type: self.output_type.clone(),
            confidence: self.confidence,
            severity: self.severity,
            reasoning: String::new(),
            content: self.content.clone(),
            tokens_used: self.tokens_used,
        })
    }
}

// ----------------------------------------------------------------------------
// Typed views over the three agent payloads the core does inspect.
// ----------------------------------------------------------------------------

/// Router agent payload: which agents to activate, initial confidence.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouterDecision {
    #[serde(default)]
    pub activated_agents: Vec<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Analyst agent payload.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalystVerdict {
    pub verdict: Verdict,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// One action proposed by the responder.
#[derive(Debug, Clone, Deserialize)]
pub struct ProposedAction {
    pub action_type: String,
    pub target: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default = "default_risk")]
    pub risk_level: ActionRisk,
    #[serde(default)]
    pub justification: String,
    #[serde(default)]
    pub rollback_plan: serde_json::Value,
    /// Execution wave; actions sharing an order value may run concurrently
    #[serde(default)]
    pub order: i32,
    /// Indices into the proposal's action list this action depends on
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

fn default_risk() -> ActionRisk {
    ActionRisk::Low
}

/// Responder agent payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponderProposal {
    #[serde(default)]
    pub actions: Vec<ProposedAction>,
}

/// Oversight agent payload.
#[derive(Debug, Clone, Deserialize)]
pub struct OversightOutcome {
    pub decision: OversightDecision,
    #[serde(default)]
    pub reason: Option<String>,
    /// For PARTIAL: indices into the proposal's action list that survive
    #[serde(default)]
    pub approved_actions: Option<Vec<usize>>,
}
