//! HORNET: Incident Coordinator
//!
//! One coordinator run owns one incident and drives it through the FSM:
//! detection, enrichment, analysis, proposal, oversight, execution.
//! Ownership is a distributed lock on `incident:{id}` with a TTL larger
//! than the sum of all phase deadlines; TTL expiry permits takeover after
//! a crash. State transitions persist to storage before anything is
//! published; realtime frames are best-effort hints.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use uuid::Uuid;

use hornet_bus::{EventBus, RealtimeFrame};
use hornet_store::{ActionUpdate, NewFinding, Storage};
use hornet_types::{
    Action, ActionStatus, Event, HornetConfig, HornetError, HumanResponse, IncidentState,
    IncidentUpdate, OversightDecision, Severity,
};

use crate::agent::{
    AgentContext, AgentOutput, AgentRegistry, AnalystVerdict, OversightOutcome, ProposedAction,
    ResponderProposal, RouterDecision,
};
use crate::correlator::CampaignCorrelator;
use crate::executor::{ActionExecutor, ExecutionDisposition, ExecutionPlan, PlannedAction};
use crate::jobs::{Assessment, FeedbackLog};
use crate::thresholds::Thresholds;

/// Budget band before entering a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    Ok,
    Warning,
    ForceTransition,
    Critical,
}

/// In-flight state of one coordinator run. Everything here is per-run
/// local; the incident row and the bus counters are the shared truth.
#[derive(Debug)]
pub struct IncidentRun {
    pub incident_id: Uuid,
    pub tenant_id: Uuid,
    pub state: IncidentState,
    pub severity: Severity,
    pub confidence: f64,
    pub summary: Option<String>,
    pub events: Vec<Event>,
    pub findings: Vec<AgentOutput>,
    pub entities: HashMap<String, BTreeSet<String>>,
    pub activated_agents: BTreeSet<String>,
    pub tokens_used: i64,
    pub token_budget: i64,
    pub escalation_reason: Option<String>,
    pub proposal: Option<ResponderProposal>,
    /// Approved action rows, in proposal order: (row id, proposal index)
    pub approved: Vec<(Uuid, usize)>,
}

struct ActiveRun {
    tenant_id: Uuid,
    started_at: DateTime<Utc>,
}

/// Drives incidents through the FSM.
pub struct Coordinator {
    storage: Arc<dyn Storage>,
    bus: Arc<dyn EventBus>,
    registry: Arc<AgentRegistry>,
    executor: Arc<ActionExecutor>,
    correlator: Arc<CampaignCorrelator>,
    thresholds: Arc<Thresholds>,
    feedback: Arc<FeedbackLog>,
    config: Arc<HornetConfig>,
    runner_id: String,
    active: Mutex<HashMap<Uuid, ActiveRun>>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn Storage>,
        bus: Arc<dyn EventBus>,
        registry: Arc<AgentRegistry>,
        executor: Arc<ActionExecutor>,
        correlator: Arc<CampaignCorrelator>,
        thresholds: Arc<Thresholds>,
        feedback: Arc<FeedbackLog>,
        config: Arc<HornetConfig>,
    ) -> Self {
        Self {
            storage,
            bus,
            registry,
            executor,
            correlator,
            thresholds,
            feedback,
            config,
            runner_id: format!("coordinator_{}", Uuid::new_v4().simple()),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Incidents currently owned by this coordinator.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Create the incident from a promoted event and return the seeded run.
    /// `None` means the incident id already exists and this delivery is a
    /// replay.
    pub async fn seed_incident(
        &self,
        event: Event,
        detection_findings: Vec<AgentOutput>,
        confidence: f64,
        triggering_agent: Option<&str>,
    ) -> Result<Option<IncidentRun>, HornetError> {
        let tenant_id = event.tenant_id;
        let incident_id = event.incident_id;

        let created = self
            .storage
            .create_incident(
                tenant_id,
                &event,
                event.severity,
                self.config.token_budget_per_incident,
            )
            .await?;
        if !created {
            tracing::debug!(%incident_id, "incident already exists, replay ignored");
            return Ok(None);
        }

        let mut detection_tokens = 0;
        for finding in &detection_findings {
            detection_tokens += finding.tokens_used;
            self.storage
                .add_finding(
                    tenant_id,
                    NewFinding {
                        incident_id,
                        agent: finding.agent_name.clone(),
                        finding_type: finding.output_type.clone(),
                        confidence: finding.confidence,
                        severity: finding.severity,
                        content: finding.content.clone(),
                        reasoning: finding.reasoning.clone(),
                        tokens_consumed: finding.tokens_used,
                    },
                )
                .await?;
        }

        let tokens_used = self
            .bus
            .incr_tokens(incident_id, detection_tokens)
            .await
            .unwrap_or(detection_tokens);

        self.storage
            .update_incident(
                tenant_id,
                incident_id,
                IncidentUpdate {
                    confidence: Some(confidence),
                    tokens_used: Some(tokens_used),
                    ..Default::default()
                },
            )
            .await?;

        let run = IncidentRun {
            incident_id,
            tenant_id,
            state: IncidentState::Detection,
            severity: event.severity,
            confidence,
            summary: None,
            entities: group_entities(&event),
            events: vec![event.clone()],
            findings: detection_findings,
            activated_agents: BTreeSet::new(),
            tokens_used,
            token_budget: self.config.token_budget_per_incident,
            escalation_reason: None,
            proposal: None,
            approved: Vec::new(),
        };

        self.timeline(
            &run,
            "detection_triggered",
            triggering_agent,
            json!({
                "confidence": confidence,
                "detection_agents": run.findings.len(),
            }),
        )
        .await;

        let frame = RealtimeFrame::new(
            "incident_created",
            tenant_id,
            json!({
                "incident_id": incident_id,
                "event_type": event.event_type,
                "confidence": confidence,
                "triggering_agent": triggering_agent,
            }),
        );
        if let Err(e) = self.bus.publish_realtime(&frame).await {
            tracing::warn!(error = %e, "realtime publish failed");
        }

        metrics::increment_counter!(
            "hornet_incidents_total",
            "severity" => run.severity.as_str()
        );
        tracing::info!(%incident_id, %tenant_id, confidence, "incident created");
        Ok(Some(run))
    }

    /// Seed and process in the background. Returns the incident id.
    pub async fn promote(
        self: &Arc<Self>,
        event: Event,
        detection_findings: Vec<AgentOutput>,
        confidence: f64,
        triggering_agent: Option<&str>,
    ) -> Result<Uuid, HornetError> {
        let incident_id = event.incident_id;
        if let Some(run) = self
            .seed_incident(event, detection_findings, confidence, triggering_agent)
            .await?
        {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.process_incident(run).await;
            });
        }
        Ok(incident_id)
    }

    /// Drive one incident to a resting state. Exclusive per incident id.
    pub async fn process_incident(&self, mut run: IncidentRun) {
        let lock_key = format!("incident:{}", run.incident_id);
        let acquired = self
            .bus
            .try_acquire(&lock_key, &self.runner_id, self.config.incident_lock_ttl())
            .await
            .unwrap_or(false);
        if !acquired {
            tracing::warn!(incident_id = %run.incident_id, "incident already owned, skipping run");
            return;
        }

        self.active.lock().insert(
            run.incident_id,
            ActiveRun {
                tenant_id: run.tenant_id,
                started_at: Utc::now(),
            },
        );

        if let Err(e) = self.drive(&mut run).await {
            tracing::error!(incident_id = %run.incident_id, error = %e, "incident processing failed");
            self.fail_run(&mut run, &e.to_string()).await;
        }

        self.active.lock().remove(&run.incident_id);
        if let Err(e) = self.bus.release(&lock_key, &self.runner_id).await {
            tracing::warn!(error = %e, "lock release failed");
        }
    }

    async fn drive(&self, run: &mut IncidentRun) -> Result<(), HornetError> {
        loop {
            if matches!(
                run.state,
                IncidentState::Closed | IncidentState::Error | IncidentState::Escalated
            ) {
                return Ok(());
            }

            match self.check_budget(run) {
                BudgetStatus::Critical => {
                    self.timeline(run, "budget_exhausted", None, json!({"tokens_used": run.tokens_used}))
                        .await;
                    self.close_path(run, "budget_exhausted").await?;
                    return Ok(());
                }
                BudgetStatus::ForceTransition => {
                    self.timeline(
                        run,
                        "budget_force_transition",
                        None,
                        json!({"tokens_used": run.tokens_used}),
                    )
                    .await;
                    self.close_path(run, "budget_exhausted").await?;
                    return Ok(());
                }
                BudgetStatus::Warning => {
                    tracing::warn!(
                        incident_id = %run.incident_id,
                        tokens_used = run.tokens_used,
                        token_budget = run.token_budget,
                        "token budget warning"
                    );
                }
                BudgetStatus::Ok => {}
            }

            let phase = run.state;
            let deadline = self.config.phase_deadline(phase);
            match tokio::time::timeout(deadline, self.run_phase(run)).await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    tracing::warn!(incident_id = %run.incident_id, phase = %phase, "phase deadline expired");
                    self.timeline(run, "phase_timeout", None, json!({"phase": phase.as_str()}))
                        .await;
                    let outcome = match phase {
                        IncidentState::Detection | IncidentState::Enrichment => {
                            "timeout_low_confidence"
                        }
                        _ => "deadline_exceeded",
                    };
                    self.close_path(run, outcome).await?;
                    return Ok(());
                }
            }
        }
    }

    async fn run_phase(&self, run: &mut IncidentRun) -> Result<(), HornetError> {
        match run.state {
            IncidentState::Detection => self.run_detection(run).await,
            IncidentState::Enrichment => self.run_enrichment(run).await,
            IncidentState::Analysis => self.run_analysis(run).await,
            IncidentState::Proposal => self.run_proposal(run).await,
            IncidentState::Oversight => self.run_oversight(run).await,
            IncidentState::Execution => self.run_execution(run).await,
            _ => Ok(()),
        }
    }

    /// DETECTION: merge the router's view, then recompute the dismiss gate
    /// rather than trusting the dispatcher's.
    async fn run_detection(&self, run: &mut IncidentRun) -> Result<(), HornetError> {
        if let Some(output) = self.call_agent(run, "router", "routing").await? {
            let decision: RouterDecision =
                serde_json::from_value(output.content.clone()).unwrap_or_default();
            run.activated_agents.extend(decision.activated_agents);
            run.confidence = decision.confidence.unwrap_or(output.confidence);
            self.timeline(
                run,
                "router_activated",
                Some("router"),
                json!({"agents": run.activated_agents, "confidence": run.confidence}),
            )
            .await;
        }

        let dismiss = self.thresholds.get().dismiss;
        if run.confidence < dismiss {
            tracing::info!(
                incident_id = %run.incident_id,
                confidence = run.confidence,
                threshold = dismiss,
                "incident dismissed after detection"
            );
            self.transition(run, IncidentState::Closed, Some("dismissed")).await
        } else {
            self.transition(run, IncidentState::Enrichment, None).await
        }
    }

    /// ENRICHMENT: external intel plus campaign correlation on the current
    /// entity set.
    async fn run_enrichment(&self, run: &mut IncidentRun) -> Result<(), HornetError> {
        if self.call_agent(run, "intel", "intel").await?.is_some() {
            self.timeline(run, "intel_enrichment", Some("intel"), json!({})).await;
        }

        match self.correlator.correlate(run.tenant_id, run.incident_id).await {
            Ok(outcome) if outcome.related_count > 0 => {
                self.storage
                    .add_finding(
                        run.tenant_id,
                        NewFinding {
                            incident_id: run.incident_id,
                            agent: "correlator".into(),
                            finding_type: "related_incidents".into(),
                            confidence: outcome.campaign_score,
                            severity: run.severity,
                            content: serde_json::to_value(&outcome)
                                .unwrap_or(serde_json::Value::Null),
                            reasoning: String::new(),
                            tokens_consumed: 0,
                        },
                    )
                    .await?;
                self.timeline(
                    run,
                    "campaign_correlated",
                    Some("correlator"),
                    json!({
                        "related": outcome.related_count,
                        "score": outcome.campaign_score,
                        "is_campaign": outcome.is_campaign,
                    }),
                )
                .await;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "campaign correlation failed"),
        }

        self.transition(run, IncidentState::Analysis, None).await
    }

    /// ANALYSIS: the analyst's verdict sets confidence, severity, summary.
    async fn run_analysis(&self, run: &mut IncidentRun) -> Result<(), HornetError> {
        if let Some(output) = self.call_agent(run, "analyst", "verdict").await? {
            match serde_json::from_value::<AnalystVerdict>(output.content.clone()) {
                Ok(verdict) => {
                    run.confidence = verdict.confidence.unwrap_or(output.confidence);
                    if let Some(severity) = verdict.severity {
                        run.severity = severity;
                    }
                    if verdict.summary.is_some() {
                        run.summary = verdict.summary.clone();
                    }
                    self.timeline(
                        run,
                        "analyst_verdict",
                        Some("analyst"),
                        json!({"verdict": verdict.verdict, "confidence": run.confidence}),
                    )
                    .await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "analyst verdict unparseable, using raw confidence");
                    run.confidence = output.confidence;
                }
            }
        }

        if run.confidence < self.thresholds.get().investigate {
            self.transition(run, IncidentState::Closed, Some("dismissed")).await
        } else {
            self.transition(run, IncidentState::Proposal, None).await
        }
    }

    /// PROPOSAL: the responder emits ordered actions with risk levels and
    /// rollback descriptors.
    async fn run_proposal(&self, run: &mut IncidentRun) -> Result<(), HornetError> {
        if let Some(output) = self.call_agent(run, "responder", "proposal").await? {
            let proposal: ResponderProposal =
                serde_json::from_value(output.content.clone()).unwrap_or_default();
            self.timeline(
                run,
                "proposal_generated",
                Some("responder"),
                json!({"actions": proposal.actions.len()}),
            )
            .await;
            run.proposal = Some(proposal);
        }
        self.transition(run, IncidentState::Oversight, None).await
    }

    /// OVERSIGHT: approve, partially approve, veto, or escalate.
    async fn run_oversight(&self, run: &mut IncidentRun) -> Result<(), HornetError> {
        let outcome = match self.call_agent(run, "oversight", "decision").await? {
            Some(output) => serde_json::from_value::<OversightOutcome>(output.content.clone())
                .unwrap_or(OversightOutcome {
                    decision: OversightDecision::Approve,
                    reason: None,
                    approved_actions: None,
                }),
            None => OversightOutcome {
                decision: OversightDecision::Approve,
                reason: None,
                approved_actions: None,
            },
        };

        match outcome.decision {
            OversightDecision::Veto => {
                run.escalation_reason =
                    Some(outcome.reason.unwrap_or_else(|| "governance veto".into()));
                self.timeline(
                    run,
                    "oversight_veto",
                    Some("oversight"),
                    json!({"reason": run.escalation_reason}),
                )
                .await;
                self.transition(run, IncidentState::Escalated, None).await
            }
            OversightDecision::Escalate => {
                run.escalation_reason =
                    Some(outcome.reason.unwrap_or_else(|| "requires human review".into()));
                self.timeline(
                    run,
                    "oversight_escalated",
                    Some("oversight"),
                    json!({"reason": run.escalation_reason}),
                )
                .await;
                self.transition(run, IncidentState::Escalated, None).await
            }
            OversightDecision::Approve | OversightDecision::Partial => {
                let proposal = run.proposal.clone().unwrap_or_default();
                let approved_indices: Vec<usize> = match outcome.decision {
                    OversightDecision::Partial => outcome.approved_actions.unwrap_or_default(),
                    _ => (0..proposal.actions.len()).collect(),
                };

                for idx in approved_indices {
                    let Some(proposed) = proposal.actions.get(idx) else {
                        continue;
                    };
                    let action_id = self.persist_approved_action(run, proposed).await?;
                    run.approved.push((action_id, idx));
                }

                self.timeline(
                    run,
                    "actions_approved",
                    Some("oversight"),
                    json!({"count": run.approved.len()}),
                )
                .await;
                self.transition(run, IncidentState::Execution, None).await
            }
        }
    }

    async fn persist_approved_action(
        &self,
        run: &IncidentRun,
        proposed: &ProposedAction,
    ) -> Result<Uuid, HornetError> {
        let action = Action {
            id: Uuid::new_v4(),
            incident_id: run.incident_id,
            tenant_id: run.tenant_id,
            action_type: proposed.action_type.clone(),
            target: proposed.target.clone(),
            parameters: proposed.parameters.clone(),
            risk_level: proposed.risk_level,
            status: ActionStatus::Proposed,
            proposed_by: "responder".into(),
            proposed_at: Utc::now(),
            approved_by: None,
            approved_at: None,
            executed_at: None,
            result: None,
            rollback_plan: proposed.rollback_plan.clone(),
            rollback_handle: None,
            justification: proposed.justification.clone(),
            veto_reason: None,
        };
        self.storage.insert_action(run.tenant_id, &action).await?;
        self.storage
            .update_action(
                run.tenant_id,
                action.id,
                ActionUpdate {
                    status: Some(ActionStatus::Approved),
                    approved_by: Some("oversight".into()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(action.id)
    }

    /// EXECUTION: hand the approved actions to the executor, then close.
    async fn run_execution(&self, run: &mut IncidentRun) -> Result<(), HornetError> {
        self.timeline(run, "execution_started", None, json!({"actions": run.approved.len()}))
            .await;

        let plan = self.build_plan(run);
        let records = self.executor.execute_plan(&plan).await;

        let completed = records
            .iter()
            .filter(|r| r.disposition == ExecutionDisposition::Completed)
            .count();
        let all_completed = completed == records.len();
        self.timeline(
            run,
            "execution_completed",
            None,
            json!({"completed": completed, "total": records.len()}),
        )
        .await;

        let outcome = if all_completed { "resolved" } else { "partial_failure" };
        self.transition(run, IncidentState::Closed, Some(outcome)).await
    }

    fn build_plan(&self, run: &IncidentRun) -> ExecutionPlan {
        let proposal = run.proposal.clone().unwrap_or_default();
        let id_by_index: HashMap<usize, Uuid> =
            run.approved.iter().map(|(id, idx)| (*idx, *id)).collect();

        let mut actions = Vec::new();
        let mut dependencies: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        let mut by_order: Vec<(i32, Uuid)> = Vec::new();

        for (action_id, idx) in &run.approved {
            let Some(proposed) = proposal.actions.get(*idx) else {
                continue;
            };
            actions.push(PlannedAction {
                action_id: *action_id,
                action_type: proposed.action_type.clone(),
                target: proposed.target.clone(),
                parameters: proposed.parameters.clone(),
            });
            by_order.push((proposed.order, *action_id));
            let deps: Vec<Uuid> = proposed
                .depends_on
                .iter()
                .filter_map(|dep_idx| id_by_index.get(dep_idx).copied())
                .collect();
            if !deps.is_empty() {
                dependencies.insert(*action_id, deps);
            }
        }

        by_order.sort_by_key(|(order, _)| *order);
        let mut parallel_groups: Vec<Vec<Uuid>> = Vec::new();
        let mut last_order = None;
        for (order, action_id) in by_order {
            if last_order != Some(order) {
                parallel_groups.push(Vec::new());
                last_order = Some(order);
            }
            if let Some(group) = parallel_groups.last_mut() {
                group.push(action_id);
            }
        }

        ExecutionPlan {
            incident_id: run.incident_id,
            tenant_id: run.tenant_id,
            actions,
            parallel_groups,
            dependencies,
        }
    }

    /// Call one agent with the per-call deadline. Timeouts and errors
    /// degrade to `None`; they never abort the phase on their own.
    async fn call_agent(
        &self,
        run: &mut IncidentRun,
        name: &str,
        finding_type: &str,
    ) -> Result<Option<AgentOutput>, HornetError> {
        let Some(agent) = self.registry.get(name) else {
            tracing::debug!(agent = name, "agent not registered");
            return Ok(None);
        };

        let context = self.agent_context(run);
        let started = std::time::Instant::now();
        let output =
            match tokio::time::timeout(self.config.agent_call_timeout, agent.process(&context))
                .await
            {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    tracing::warn!(agent = name, error = %e, "agent call failed");
                    metrics::increment_counter!("hornet_agent_calls_total", "agent" => name.to_string(), "status" => "error");
                    return Ok(None);
                }
                Err(_) => {
                    tracing::warn!(agent = name, "agent call timed out");
                    metrics::increment_counter!("hornet_agent_calls_total", "agent" => name.to_string(), "status" => "timeout");
                    return Ok(None);
                }
            };

        metrics::increment_counter!("hornet_agent_calls_total", "agent" => name.to_string(), "status" => "ok");
        metrics::histogram!("hornet_agent_latency_seconds", started.elapsed().as_secs_f64(), "agent" => name.to_string());

        let total = self
            .bus
            .incr_tokens(run.incident_id, output.tokens_used)
            .await
            .unwrap_or(run.tokens_used + output.tokens_used);
        run.tokens_used = total.max(run.tokens_used);

        self.storage
            .add_finding(
                run.tenant_id,
                NewFinding {
                    incident_id: run.incident_id,
                    agent: output.agent_name.clone(),
                    finding_type: finding_type.into(),
                    confidence: output.confidence,
                    severity: output.severity,
                    content: output.content.clone(),
                    reasoning: output.reasoning.clone(),
                    tokens_consumed: output.tokens_used,
                },
            )
            .await?;

        let frame = RealtimeFrame::new(
            "finding",
            run.tenant_id,
            json!({
                "incident_id": run.incident_id,
                "agent": output.agent_name,
                "finding_type": finding_type,
                "confidence": output.confidence,
            }),
        );
        if let Err(e) = self.bus.publish_realtime(&frame).await {
            tracing::debug!(error = %e, "realtime finding publish failed");
        }

        run.findings.push(output.clone());
        Ok(Some(output))
    }

    fn agent_context(&self, run: &IncidentRun) -> AgentContext {
        AgentContext {
            incident_id: run.incident_id,
            tenant_id: run.tenant_id,
            state: run.state,
            events: run.events.clone(),
            findings: run.findings.clone(),
            entities: run.entities.clone(),
            token_budget: run.token_budget,
            tokens_used: run.tokens_used,
        }
    }

    fn check_budget(&self, run: &IncidentRun) -> BudgetStatus {
        if run.token_budget <= 0 {
            return BudgetStatus::Ok;
        }
        let ratio = run.tokens_used as f64 / run.token_budget as f64;
        if ratio >= self.config.token_critical_threshold {
            BudgetStatus::Critical
        } else if ratio >= self.config.token_force_threshold {
            BudgetStatus::ForceTransition
        } else if ratio >= self.config.token_warning_threshold {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Ok
        }
    }

    /// Persist a state transition, then publish it. Persist failure aborts
    /// the transition; publish failure is logged only.
    async fn transition(
        &self,
        run: &mut IncidentRun,
        to: IncidentState,
        outcome: Option<&str>,
    ) -> Result<(), HornetError> {
        if !run.state.can_transition(to) {
            tracing::warn!(
                incident_id = %run.incident_id,
                from = %run.state,
                to = %to,
                "transition rejected"
            );
            return Err(HornetError::Conflict(format!(
                "illegal transition {} -> {}",
                run.state, to
            )));
        }

        self.storage
            .update_incident(
                run.tenant_id,
                run.incident_id,
                IncidentUpdate {
                    state: Some(to),
                    confidence: Some(run.confidence),
                    severity: Some(run.severity),
                    tokens_used: Some(run.tokens_used),
                    summary: run.summary.clone(),
                    outcome: outcome.map(String::from),
                    escalation_reason: run.escalation_reason.clone(),
                    campaign_id: None,
                },
            )
            .await?;

        let from = run.state;
        run.state = to;
        tracing::info!(
            incident_id = %run.incident_id,
            from = %from,
            to = %to,
            outcome = outcome.unwrap_or(""),
            "state transition"
        );

        let payload = json!({
            "incident_id": run.incident_id,
            "from": from.as_str(),
            "to": to.as_str(),
            "confidence": run.confidence,
            "outcome": outcome,
        });
        let frame = RealtimeFrame::new("incident_state_changed", run.tenant_id, payload.clone());
        if let Err(e) = self.bus.publish_realtime(&frame).await {
            tracing::debug!(error = %e, "realtime state publish failed");
        }
        if let Err(e) = self
            .bus
            .publish_incident_message(run.incident_id, &payload)
            .await
        {
            tracing::debug!(error = %e, "incident substream publish failed");
        }
        Ok(())
    }

    /// Close via the shortest legal path: CLOSED directly, else through
    /// ERROR, else through ESCALATED.
    async fn close_path(&self, run: &mut IncidentRun, outcome: &str) -> Result<(), HornetError> {
        if run.state == IncidentState::Closed {
            return Ok(());
        }
        if run.state.can_transition(IncidentState::Closed) {
            return self.transition(run, IncidentState::Closed, Some(outcome)).await;
        }
        if run.state.can_transition(IncidentState::Error) {
            self.transition(run, IncidentState::Error, None).await?;
            return self.transition(run, IncidentState::Closed, Some(outcome)).await;
        }
        if run.state.can_transition(IncidentState::Escalated) {
            self.transition(run, IncidentState::Escalated, None).await?;
            return self.transition(run, IncidentState::Closed, Some(outcome)).await;
        }
        Err(HornetError::Conflict(format!(
            "no close path from {}",
            run.state
        )))
    }

    /// Error path: record the failure, move to ERROR, then run the cleanup
    /// step that closes the incident.
    async fn fail_run(&self, run: &mut IncidentRun, message: &str) {
        self.timeline(
            run,
            "phase_error",
            None,
            json!({"phase": run.state.as_str(), "error": message}),
        )
        .await;

        if run.state != IncidentState::Error {
            if let Err(e) = self.transition(run, IncidentState::Error, None).await {
                tracing::error!(incident_id = %run.incident_id, error = %e, "error transition failed");
                return;
            }
        }
        if let Err(e) = self.transition(run, IncidentState::Closed, Some("error")).await {
            tracing::error!(incident_id = %run.incident_id, error = %e, "error cleanup failed");
        }
    }

    /// Record a timeline entry as a finding. Observability only; failures
    /// are logged and swallowed.
    async fn timeline(
        &self,
        run: &IncidentRun,
        event: &str,
        agent: Option<&str>,
        details: serde_json::Value,
    ) {
        let result = self
            .storage
            .add_finding(
                run.tenant_id,
                NewFinding {
                    incident_id: run.incident_id,
                    agent: agent.unwrap_or("coordinator").into(),
                    finding_type: "timeline".into(),
                    confidence: 0.0,
                    severity: Severity::Low,
                    content: json!({
                        "event": event,
                        "state": run.state.as_str(),
                        "details": details,
                    }),
                    reasoning: String::new(),
                    tokens_consumed: 0,
                },
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, event, "timeline entry failed");
        }
    }

    /// Apply a human decision to a pending action and, when the incident is
    /// parked in ESCALATED, resume or close it.
    pub async fn human_decision(
        self: &Arc<Self>,
        tenant_id: Uuid,
        incident_id: Uuid,
        action_id: Option<Uuid>,
        response: HumanResponse,
        justification: &str,
    ) -> Result<(), HornetError> {
        let incident = self
            .storage
            .get_incident(tenant_id, incident_id)
            .await?
            .ok_or(HornetError::TenantIsolation)?;

        if let Some(action_id) = action_id {
            let update = match response {
                HumanResponse::Approve
                | HumanResponse::ApproveModified
                | HumanResponse::OverrideVeto => ActionUpdate {
                    status: Some(ActionStatus::Approved),
                    approved_by: Some("human".into()),
                    ..Default::default()
                },
                HumanResponse::Reject => ActionUpdate {
                    status: Some(ActionStatus::Rejected),
                    veto_reason: Some(justification.to_string()),
                    ..Default::default()
                },
                HumanResponse::Investigate => ActionUpdate::default(),
            };
            self.storage.update_action(tenant_id, action_id, update).await?;
        }

        match response {
            HumanResponse::Reject => self.feedback.record(tenant_id, Assessment::FalsePositive),
            HumanResponse::Approve | HumanResponse::ApproveModified | HumanResponse::OverrideVeto => {
                self.feedback.record(tenant_id, Assessment::TruePositive)
            }
            HumanResponse::Investigate => {}
        }

        if incident.state == IncidentState::Escalated {
            match response {
                HumanResponse::Reject => {
                    self.storage
                        .update_incident(
                            tenant_id,
                            incident_id,
                            IncidentUpdate {
                                state: Some(IncidentState::Closed),
                                outcome: Some("rejected".into()),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                HumanResponse::Approve
                | HumanResponse::ApproveModified
                | HumanResponse::OverrideVeto => {
                    self.storage
                        .update_incident(
                            tenant_id,
                            incident_id,
                            IncidentUpdate::state(IncidentState::Analysis),
                        )
                        .await?;
                    self.resume_incident(tenant_id, incident_id).await?;
                }
                HumanResponse::Investigate => {}
            }
        }
        Ok(())
    }

    /// Rebuild a run from storage and continue processing in the
    /// background. Used for human resumption after ESCALATED.
    pub async fn resume_incident(
        self: &Arc<Self>,
        tenant_id: Uuid,
        incident_id: Uuid,
    ) -> Result<(), HornetError> {
        let incident = self
            .storage
            .get_incident(tenant_id, incident_id)
            .await?
            .ok_or(HornetError::TenantIsolation)?;
        let findings = self.storage.get_findings(tenant_id, incident_id).await?;

        let run = IncidentRun {
            incident_id,
            tenant_id,
            state: incident.state,
            severity: incident.severity.unwrap_or(Severity::Medium),
            confidence: incident.confidence,
            summary: incident.summary,
            events: Vec::new(),
            findings: findings
                .into_iter()
                .filter(|f| f.finding_type != "timeline")
                .map(|f| AgentOutput {
                    agent_name: f.agent,
                    output_type: f.finding_type,
                    confidence: f.confidence,
                    severity: f.severity,
                    reasoning: f.reasoning,
                    content: f.content,
                    tokens_used: f.tokens_consumed,
                })
                .collect(),
            entities: HashMap::new(),
            activated_agents: BTreeSet::new(),
            tokens_used: self.bus.get_tokens(incident_id).await.unwrap_or(incident.tokens_used),
            token_budget: incident.token_budget,
            escalation_reason: incident.escalation_reason,
            proposal: None,
            approved: Vec::new(),
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.process_incident(run).await;
        });
        Ok(())
    }

    /// Close incidents that exceeded the wall-clock cap. Called by the
    /// periodic timeout scan.
    pub async fn check_timeouts(&self) -> usize {
        let overdue: Vec<(Uuid, Uuid)> = {
            let active = self.active.lock();
            let cutoff = Utc::now()
                - chrono::Duration::from_std(self.config.max_incident_duration)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300));
            active
                .iter()
                .filter(|(_, run)| run.started_at < cutoff)
                .map(|(id, run)| (*id, run.tenant_id))
                .collect()
        };

        let mut closed = 0;
        for (incident_id, tenant_id) in overdue {
            tracing::warn!(%incident_id, "incident exceeded max duration, forcing closure");
            if self.force_close(tenant_id, incident_id, "timeout").await {
                closed += 1;
                self.active.lock().remove(&incident_id);
            }
        }
        closed
    }

    /// Force an incident to CLOSED through whatever legal path exists.
    async fn force_close(&self, tenant_id: Uuid, incident_id: Uuid, outcome: &str) -> bool {
        let Ok(Some(incident)) = self.storage.get_incident(tenant_id, incident_id).await else {
            return false;
        };
        let mut state = incident.state;
        for _ in 0..3 {
            if state == IncidentState::Closed {
                return true;
            }
            let next = if state.can_transition(IncidentState::Closed) {
                IncidentState::Closed
            } else if state.can_transition(IncidentState::Error) {
                IncidentState::Error
            } else if state.can_transition(IncidentState::Escalated) {
                IncidentState::Escalated
            } else {
                return false;
            };
            let update = IncidentUpdate {
                state: Some(next),
                outcome: (next == IncidentState::Closed).then(|| outcome.to_string()),
                ..Default::default()
            };
            if self
                .storage
                .update_incident(tenant_id, incident_id, update)
                .await
                .is_err()
            {
                return false;
            }
            state = next;
        }
        state == IncidentState::Closed
    }
}

fn group_entities(event: &Event) -> HashMap<String, BTreeSet<String>> {
    let mut entities: HashMap<String, BTreeSet<String>> = HashMap::new();
    for entity in &event.entities {
        entities
            .entry(entity.entity_type.clone())
            .or_default()
            .insert(entity.value.clone());
    }
    entities
}

#[cfg(test)]
mod tests {
    use super::*;
    use hornet_bus::MemoryBus;
    use hornet_store::{MemoryStorage, Storage};
    use hornet_types::Entity;

    use crate::agent::StaticAgent;
    use crate::executor::MockConnector;

    struct Harness {
        coordinator: Arc<Coordinator>,
        storage: Arc<MemoryStorage>,
        registry: Arc<AgentRegistry>,
        executor: Arc<ActionExecutor>,
    }

    fn harness_with_config(config: HornetConfig) -> Harness {
        let config = Arc::new(config);
        let storage = Arc::new(MemoryStorage::new());
        let bus = Arc::new(MemoryBus::new());
        let registry = Arc::new(AgentRegistry::new());
        let executor = Arc::new(ActionExecutor::new(
            storage.clone(),
            config.connector_call_timeout,
        ));
        let correlator = Arc::new(CampaignCorrelator::new(storage.clone(), &config));
        let thresholds = Arc::new(Thresholds::from_config(&config));
        let feedback = Arc::new(FeedbackLog::new());
        let coordinator = Arc::new(Coordinator::new(
            storage.clone(),
            bus,
            registry.clone(),
            executor.clone(),
            correlator,
            thresholds,
            feedback,
            config,
        ));
        Harness {
            coordinator,
            storage,
            registry,
            executor,
        }
    }

    fn harness() -> Harness {
        harness_with_config(HornetConfig::default())
    }

    fn event(tenant: Uuid) -> Event {
        Event {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            incident_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: "edr".into(),
            source_type: "edr".into(),
            event_type: "auth.brute_force".into(),
            severity: Severity::High,
            entities: vec![
                Entity::new("ip", "192.168.1.100"),
                Entity::new("user", "admin"),
            ],
            raw_payload: json!({}),
        }
    }

    fn detection_output(agent: &str, confidence: f64) -> AgentOutput {
        AgentOutput {
            agent_name: agent.into(),
            output_type: "detection".into(),
            confidence,
            severity: Severity::High,
            reasoning: String::new(),
            content: json!({}),
            tokens_used: 50,
        }
    }

    fn register_full_pipeline(h: &Harness) {
        h.registry.register(Arc::new(
            StaticAgent::new("router", "routing", 0.8)
                .with_content(json!({"activated_agents": ["intel", "analyst"], "confidence": 0.8})),
        ));
        h.registry
            .register(Arc::new(StaticAgent::new("intel", "intel", 0.7)));
        h.registry.register(Arc::new(
            StaticAgent::new("analyst", "verdict", 0.9).with_content(json!({
                "verdict": "CONFIRMED",
                "severity": "HIGH",
                "confidence": 0.9,
                "summary": "credential stuffing from a single source"
            })),
        ));
        h.registry.register(Arc::new(
            StaticAgent::new("responder", "proposal", 0.8).with_content(json!({
                "actions": [
                    {"action_type": "block_ip", "target": "192.168.1.100", "risk_level": "MEDIUM"},
                    {"action_type": "notify_team", "target": "soc", "order": 1}
                ]
            })),
        ));
        h.registry.register(Arc::new(
            StaticAgent::new("oversight", "decision", 0.9)
                .with_content(json!({"decision": "APPROVE"})),
        ));
    }

    async fn seed_and_process(h: &Harness, confidence: f64) -> (Uuid, Uuid) {
        let tenant = Uuid::new_v4();
        let event = event(tenant);
        let incident_id = event.incident_id;
        let run = h
            .coordinator
            .seed_incident(event, vec![detection_output("hunter", confidence)], confidence, Some("hunter"))
            .await
            .unwrap()
            .unwrap();
        h.coordinator.process_incident(run).await;
        (tenant, incident_id)
    }

    #[tokio::test]
    async fn test_full_pipeline_resolves() {
        let h = harness();
        register_full_pipeline(&h);
        h.executor
            .register_connector("firewall", Arc::new(MockConnector::new("firewall")));

        let (tenant, incident_id) = seed_and_process(&h, 0.7).await;

        let incident = h.storage.get_incident(tenant, incident_id).await.unwrap().unwrap();
        assert_eq!(incident.state, IncidentState::Closed);
        assert_eq!(incident.outcome.as_deref(), Some("resolved"));
        assert!(incident.closed_at.is_some());
        assert_eq!(incident.severity, Some(Severity::High));
        assert!(incident.summary.is_some());
        assert!(incident.tokens_used > 0);

        let actions = h.storage.list_actions(tenant, incident_id).await.unwrap();
        assert_eq!(actions.len(), 2);
        assert!(actions.iter().all(|a| a.status == ActionStatus::Completed));

        // Routing finding recorded before the incident left DETECTION.
        let findings = h.storage.get_findings(tenant, incident_id).await.unwrap();
        assert!(findings.iter().any(|f| f.finding_type == "routing"));
        assert!(findings.iter().any(|f| f.finding_type == "detection"));
    }

    #[tokio::test]
    async fn test_low_confidence_dismissed_after_detection() {
        let h = harness();
        h.registry.register(Arc::new(
            StaticAgent::new("router", "routing", 0.1).with_content(json!({"confidence": 0.1})),
        ));

        let (tenant, incident_id) = seed_and_process(&h, 0.5).await;

        let incident = h.storage.get_incident(tenant, incident_id).await.unwrap().unwrap();
        assert_eq!(incident.state, IncidentState::Closed);
        assert_eq!(incident.outcome.as_deref(), Some("dismissed"));
    }

    #[tokio::test]
    async fn test_analysis_gate_dismisses_uncertain_incident() {
        let h = harness();
        h.registry.register(Arc::new(
            StaticAgent::new("analyst", "verdict", 0.4).with_content(json!({
                "verdict": "UNCERTAIN",
                "confidence": 0.4
            })),
        ));

        let (tenant, incident_id) = seed_and_process(&h, 0.5).await;

        let incident = h.storage.get_incident(tenant, incident_id).await.unwrap().unwrap();
        assert_eq!(incident.state, IncidentState::Closed);
        assert_eq!(incident.outcome.as_deref(), Some("dismissed"));
    }

    #[tokio::test]
    async fn test_oversight_veto_escalates() {
        let h = harness();
        register_full_pipeline(&h);
        // Replace oversight with a veto.
        h.registry.register(Arc::new(
            StaticAgent::new("oversight", "decision", 0.9)
                .with_content(json!({"decision": "VETO", "reason": "patient_safety"})),
        ));

        let (tenant, incident_id) = seed_and_process(&h, 0.7).await;

        let incident = h.storage.get_incident(tenant, incident_id).await.unwrap().unwrap();
        assert_eq!(incident.state, IncidentState::Escalated);
        assert_eq!(incident.escalation_reason.as_deref(), Some("patient_safety"));

        let actions = h.storage.list_actions(tenant, incident_id).await.unwrap();
        assert!(actions.iter().all(|a| a.status != ActionStatus::Completed));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_closes_before_analysis() {
        let mut config = HornetConfig::default();
        config.token_budget_per_incident = 1000;
        let h = harness_with_config(config);
        h.registry.register(Arc::new(
            StaticAgent::new("router", "routing", 0.8)
                .with_content(json!({"confidence": 0.8}))
                .with_tokens(5),
        ));
        // Enrichment burns nearly the whole budget.
        h.registry
            .register(Arc::new(StaticAgent::new("intel", "intel", 0.7).with_tokens(990)));
        h.registry.register(Arc::new(
            StaticAgent::new("analyst", "verdict", 0.9).with_content(json!({
                "verdict": "CONFIRMED", "confidence": 0.9
            })),
        ));

        let tenant = Uuid::new_v4();
        let mut seed_event = event(tenant);
        seed_event.severity = Severity::High;
        let incident_id = seed_event.incident_id;
        let mut detection = detection_output("hunter", 0.7);
        detection.tokens_used = 0;
        let run = h
            .coordinator
            .seed_incident(seed_event, vec![detection], 0.7, Some("hunter"))
            .await
            .unwrap()
            .unwrap();
        h.coordinator.process_incident(run).await;

        let incident = h.storage.get_incident(tenant, incident_id).await.unwrap().unwrap();
        assert_eq!(incident.state, IncidentState::Closed);
        assert_eq!(incident.outcome.as_deref(), Some("budget_exhausted"));
        // The analyst never ran.
        let findings = h.storage.get_findings(tenant, incident_id).await.unwrap();
        assert!(!findings.iter().any(|f| f.finding_type == "verdict"));
    }

    #[tokio::test]
    async fn test_missing_agents_degrade_to_dismissal() {
        let h = harness();
        // No agents registered at all: detection keeps the seed confidence,
        // analysis has no verdict and the gate closes the incident.
        let (tenant, incident_id) = seed_and_process(&h, 0.5).await;

        let incident = h.storage.get_incident(tenant, incident_id).await.unwrap().unwrap();
        assert_eq!(incident.state, IncidentState::Closed);
        assert_eq!(incident.outcome.as_deref(), Some("dismissed"));
    }

    #[tokio::test]
    async fn test_seed_is_idempotent_per_incident_id() {
        let h = harness();
        let tenant = Uuid::new_v4();
        let seed_event = event(tenant);

        let first = h
            .coordinator
            .seed_incident(seed_event.clone(), vec![], 0.5, None)
            .await
            .unwrap();
        assert!(first.is_some());
        let second = h
            .coordinator
            .seed_incident(seed_event, vec![], 0.5, None)
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_partial_approval_executes_subset() {
        let h = harness();
        register_full_pipeline(&h);
        h.registry.register(Arc::new(
            StaticAgent::new("oversight", "decision", 0.9)
                .with_content(json!({"decision": "PARTIAL", "approved_actions": [1]})),
        ));

        let (tenant, incident_id) = seed_and_process(&h, 0.7).await;

        let incident = h.storage.get_incident(tenant, incident_id).await.unwrap().unwrap();
        assert_eq!(incident.state, IncidentState::Closed);
        assert_eq!(incident.outcome.as_deref(), Some("resolved"));

        // Only the notification action was persisted and completed.
        let actions = h.storage.list_actions(tenant, incident_id).await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type, "notify_team");
        assert_eq!(actions[0].status, ActionStatus::Completed);
    }

    #[tokio::test]
    async fn test_human_rejection_closes_escalated_incident() {
        let h = harness();
        register_full_pipeline(&h);
        h.registry.register(Arc::new(
            StaticAgent::new("oversight", "decision", 0.9)
                .with_content(json!({"decision": "ESCALATE", "reason": "risky"})),
        ));

        let (tenant, incident_id) = seed_and_process(&h, 0.7).await;
        assert_eq!(
            h.storage
                .get_incident(tenant, incident_id)
                .await
                .unwrap()
                .unwrap()
                .state,
            IncidentState::Escalated
        );

        h.coordinator
            .human_decision(tenant, incident_id, None, HumanResponse::Reject, "false positive")
            .await
            .unwrap();

        let incident = h.storage.get_incident(tenant, incident_id).await.unwrap().unwrap();
        assert_eq!(incident.state, IncidentState::Closed);
        assert_eq!(incident.outcome.as_deref(), Some("rejected"));
    }
}
