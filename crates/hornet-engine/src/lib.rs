//! HORNET: Core Engine
//!
//! The pieces that decide and act: the event dispatcher, the incident
//! coordinator FSM, the action executor, the campaign correlator, the
//! retry queue with dead-lettering, playbooks, threshold state, and the
//! periodic jobs. Agents and connectors are opaque seams implemented
//! outside this crate.

pub mod agent;
pub mod coordinator;
pub mod correlator;
pub mod dispatcher;
pub mod executor;
pub mod jobs;
pub mod playbooks;
pub mod retry;
pub mod thresholds;

// Re-exports
pub use agent::{
    Agent, AgentContext, AgentOutput, AgentRegistry, AnalystVerdict, OversightOutcome,
    ProposedAction, ResponderProposal, RouterDecision, StaticAgent,
};
pub use coordinator::{BudgetStatus, Coordinator, IncidentRun};
pub use correlator::{link_type_for, CampaignCorrelator, CorrelationOutcome};
pub use dispatcher::{DispatcherStatus, EventDispatcher};
pub use executor::{
    connector_type_for, ActionExecutor, Connector, ConnectorOutcome, ExecutionDisposition,
    ExecutionPlan, ExecutionRecord, MockConnector, PlannedAction,
};
pub use jobs::{
    Assessment, BaselineEngine, BaselineRollupJob, ComponentHealth, DlqAgingJob, FeedbackLog,
    HealthProbeJob, HealthSnapshot, Job, JobScheduler, ThresholdTunerJob, TimeoutScanJob,
};
pub use playbooks::{Playbook, PlaybookPriority, PlaybookRegistry, PlaybookStep};
pub use retry::{
    sign_payload, verify_signature, JobHandler, RetryQueue, WebhookDeliverer, BACKOFF_SECONDS,
};
pub use thresholds::{ThresholdUpdate, ThresholdValues, Thresholds};
