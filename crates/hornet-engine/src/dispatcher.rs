//! HORNET: Event Dispatcher
//!
//! Sole consumer of the events stream in its own consumer group. Fans each
//! event out to the detection squad, aggregates confidence, and promotes
//! or dismisses. An event is acked only after its promotion decision is
//! recorded; agent failures degrade aggregation but never block dispatch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use uuid::Uuid;

use hornet_bus::{BusMessage, EventBus, DISPATCHER_GROUP};
use hornet_types::{Event, HornetConfig, HornetError};

use crate::agent::{AgentContext, AgentOutput, AgentRegistry};
use crate::coordinator::Coordinator;
use crate::jobs::BaselineEngine;
use crate::thresholds::Thresholds;

/// Dispatcher statistics for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatus {
    pub running: bool,
    pub processed_events: u64,
    pub incidents_created: u64,
    pub dismissed: u64,
    pub detection_agents: Vec<String>,
    pub threshold: f64,
    pub consumer_group: &'static str,
    pub consumer_name: String,
}

/// Consumes events, runs the detection squad, decides promotion.
pub struct EventDispatcher {
    bus: Arc<dyn EventBus>,
    registry: Arc<AgentRegistry>,
    coordinator: Arc<Coordinator>,
    thresholds: Arc<Thresholds>,
    baseline: Arc<BaselineEngine>,
    config: Arc<HornetConfig>,
    consumer_name: String,
    running: AtomicBool,
    processed: AtomicU64,
    promoted: AtomicU64,
    dismissed: AtomicU64,
}

impl EventDispatcher {
    pub fn new(
        bus: Arc<dyn EventBus>,
        registry: Arc<AgentRegistry>,
        coordinator: Arc<Coordinator>,
        thresholds: Arc<Thresholds>,
        baseline: Arc<BaselineEngine>,
        config: Arc<HornetConfig>,
    ) -> Self {
        Self {
            bus,
            registry,
            coordinator,
            thresholds,
            baseline,
            config,
            consumer_name: format!("dispatcher_{}", Uuid::new_v4().simple()),
            running: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            promoted: AtomicU64::new(0),
            dismissed: AtomicU64::new(0),
        }
    }

    /// Create the dispatcher's consumer group and verify the squad.
    pub async fn initialize(&self) -> Result<(), HornetError> {
        self.bus
            .ensure_group(DISPATCHER_GROUP)
            .await
            .map_err(|e| HornetError::Transient(e.to_string()))?;

        for name in &self.config.detection_squad {
            if self.registry.get(name).is_none() {
                tracing::warn!(agent = %name, "detection agent missing from registry");
            }
        }
        tracing::info!(
            squad = ?self.config.detection_squad,
            threshold = self.thresholds.get().detection,
            consumer_group = DISPATCHER_GROUP,
            "dispatcher initialized"
        );
        Ok(())
    }

    /// Consumption loop until [`stop`](Self::stop).
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(consumer = %self.consumer_name, "dispatcher started");
        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.process_batch().await {
                tracing::error!(error = %e, "dispatcher batch failed");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
        tracing::info!(
            processed = self.processed.load(Ordering::SeqCst),
            promoted = self.promoted.load(Ordering::SeqCst),
            "dispatcher stopped"
        );
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Pull one batch and decide each event. Public so a driver can step
    /// the dispatcher without the loop.
    pub async fn process_batch(&self) -> Result<usize, HornetError> {
        let messages = self
            .bus
            .consume(
                DISPATCHER_GROUP,
                &self.consumer_name,
                self.config.dispatch_batch_size,
                self.config.dispatch_block,
            )
            .await
            .map_err(|e| HornetError::Transient(e.to_string()))?;

        let count = messages.len();
        for message in messages {
            self.handle_message(message).await;
        }
        Ok(count)
    }

    async fn handle_message(&self, message: BusMessage) {
        let event: Event = match serde_json::from_value(message.payload.clone()) {
            Ok(event) => event,
            Err(e) => {
                // Poison messages are acked; redelivery cannot fix them.
                tracing::warn!(
                    stream_id = %message.stream_id,
                    error = %e,
                    "malformed event dropped"
                );
                self.ack(&message.stream_id).await;
                return;
            }
        };

        match self.process_event(event).await {
            Ok(()) => {
                self.processed.fetch_add(1, Ordering::SeqCst);
                self.ack(&message.stream_id).await;
            }
            Err(e) => {
                // Left unacked: the bus redelivers and incident creation is
                // idempotent on the event's incident id.
                tracing::error!(
                    stream_id = %message.stream_id,
                    error = %e,
                    "event processing failed, will redeliver"
                );
            }
        }
    }

    async fn ack(&self, stream_id: &str) {
        if let Err(e) = self.bus.ack(DISPATCHER_GROUP, stream_id).await {
            tracing::warn!(stream_id, error = %e, "ack failed");
        }
    }

    async fn process_event(&self, event: Event) -> Result<(), HornetError> {
        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            source = %event.source,
            "processing event"
        );
        metrics::increment_counter!(
            "hornet_events_total",
            "event_type" => event.event_type.clone()
        );

        let context = AgentContext::from_event(
            event.clone(),
            hornet_types::IncidentState::Detection,
            self.config.token_budget_per_incident,
        );
        let results = self.run_detection_squad(&context).await;

        let mut max_confidence = 0.0_f64;
        let mut triggering_agent: Option<String> = None;
        let mut findings = Vec::new();
        for (agent_name, output) in results {
            let Some(output) = output else { continue };
            if output.confidence > max_confidence {
                max_confidence = output.confidence;
                triggering_agent = Some(agent_name);
            }
            findings.push(output);
        }

        let threshold = self.thresholds.get().detection;
        if max_confidence >= threshold {
            for entity_type in context.entities.keys() {
                self.baseline.observe(event.tenant_id, entity_type);
            }
            self.coordinator
                .promote(event, findings, max_confidence, triggering_agent.as_deref())
                .await?;
            self.promoted.fetch_add(1, Ordering::SeqCst);
        } else {
            tracing::debug!(
                event_id = %event.id,
                confidence = max_confidence,
                threshold,
                "event dismissed"
            );
            self.dismissed.fetch_add(1, Ordering::SeqCst);
            metrics::increment_counter!("hornet_events_dismissed_total");
        }
        Ok(())
    }

    /// Run every squad agent concurrently, each under the per-call
    /// deadline. A timeout or error yields `None` for that agent.
    async fn run_detection_squad(
        &self,
        context: &AgentContext,
    ) -> Vec<(String, Option<AgentOutput>)> {
        let calls = self.config.detection_squad.iter().map(|name| {
            let agent = self.registry.get(name);
            let name = name.clone();
            async move {
                let Some(agent) = agent else {
                    return (name, None);
                };
                match tokio::time::timeout(self.config.agent_call_timeout, agent.process(context))
                    .await
                {
                    Ok(Ok(output)) => (name, Some(output)),
                    Ok(Err(e)) => {
                        tracing::warn!(agent = %name, error = %e, "detection agent failed");
                        (name, None)
                    }
                    Err(_) => {
                        tracing::warn!(agent = %name, "detection agent timed out");
                        (name, None)
                    }
                }
            }
        });
        join_all(calls).await
    }

    pub fn status(&self) -> DispatcherStatus {
        DispatcherStatus {
            running: self.running.load(Ordering::SeqCst),
            processed_events: self.processed.load(Ordering::SeqCst),
            incidents_created: self.promoted.load(Ordering::SeqCst),
            dismissed: self.dismissed.load(Ordering::SeqCst),
            detection_agents: self.config.detection_squad.clone(),
            threshold: self.thresholds.get().detection,
            consumer_group: DISPATCHER_GROUP,
            consumer_name: self.consumer_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use hornet_bus::MemoryBus;
    use hornet_store::{MemoryStorage, Storage};
    use hornet_types::{Entity, IncidentFilter, Severity};
    use serde_json::json;
    use std::time::Duration;

    use crate::agent::{Agent, StaticAgent};
    use crate::correlator::CampaignCorrelator;
    use crate::executor::ActionExecutor;
    use crate::jobs::FeedbackLog;

    struct SlowAgent;

    #[async_trait]
    impl Agent for SlowAgent {
        fn name(&self) -> &str {
            "behavioral"
        }

        async fn process(&self, _context: &AgentContext) -> Result<AgentOutput, HornetError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(AgentOutput {
                agent_name: "behavioral".into(),
                output_type: "detection".into(),
                confidence: 1.0,
                severity: Severity::High,
                reasoning: String::new(),
                content: json!({}),
                tokens_used: 10,
            })
        }
    }

    struct Rig {
        dispatcher: Arc<EventDispatcher>,
        bus: Arc<MemoryBus>,
        storage: Arc<MemoryStorage>,
        registry: Arc<AgentRegistry>,
    }

    fn rig(mut config: HornetConfig) -> Rig {
        config.agent_call_timeout = Duration::from_millis(100);
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
        let coordinator = Arc::new(Coordinator::new(
            storage.clone(),
            bus.clone(),
            registry.clone(),
            executor,
            correlator,
            thresholds.clone(),
            Arc::new(FeedbackLog::new()),
            config.clone(),
        ));
        let dispatcher = Arc::new(EventDispatcher::new(
            bus.clone(),
            registry.clone(),
            coordinator,
            thresholds,
            Arc::new(BaselineEngine::new()),
            config,
        ));
        Rig {
            dispatcher,
            bus,
            storage,
            registry,
        }
    }

    fn brute_force_event(tenant: Uuid) -> serde_json::Value {
        serde_json::to_value(Event {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            incident_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: "fw-01".into(),
            source_type: "firewall".into(),
            event_type: "auth.brute_force".into(),
            severity: Severity::High,
            entities: vec![
                Entity::new("ip", "192.168.1.100"),
                Entity::new("user", "admin"),
            ],
            raw_payload: json!({}),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_event_above_threshold_is_promoted() {
        let r = rig(HornetConfig::default());
        r.registry
            .register(Arc::new(StaticAgent::new("hunter", "detection", 0.7)));
        r.registry
            .register(Arc::new(StaticAgent::new("sentinel", "detection", 0.2)));
        r.dispatcher.initialize().await.unwrap();

        let tenant = Uuid::new_v4();
        r.bus.publish_event(&brute_force_event(tenant)).await.unwrap();
        r.dispatcher.process_batch().await.unwrap();

        let incidents = r
            .storage
            .list_incidents(tenant, &IncidentFilter::default())
            .await
            .unwrap();
        assert_eq!(incidents.len(), 1);
        assert!(incidents[0].confidence >= 0.3);

        let status = r.dispatcher.status();
        assert_eq!(status.processed_events, 1);
        assert_eq!(status.incidents_created, 1);
        assert_eq!(status.dismissed, 0);
        // Decision recorded, so the event is acked.
        assert_eq!(r.bus.pending_count(DISPATCHER_GROUP).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_event_below_threshold_is_dismissed() {
        let r = rig(HornetConfig::default());
        for name in ["hunter", "sentinel", "behavioral", "netwatch", "endpoint"] {
            r.registry
                .register(Arc::new(StaticAgent::new(name, "detection", 0.1)));
        }
        r.dispatcher.initialize().await.unwrap();

        let tenant = Uuid::new_v4();
        r.bus.publish_event(&brute_force_event(tenant)).await.unwrap();
        r.dispatcher.process_batch().await.unwrap();

        assert!(r
            .storage
            .list_incidents(tenant, &IncidentFilter::default())
            .await
            .unwrap()
            .is_empty());
        let status = r.dispatcher.status();
        assert_eq!(status.dismissed, 1);
        assert_eq!(r.bus.pending_count(DISPATCHER_GROUP).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_agent_timeout_degrades_only() {
        let r = rig(HornetConfig::default());
        // behavioral hangs past the per-call deadline; hunter still fires.
        r.registry.register(Arc::new(SlowAgent));
        r.registry
            .register(Arc::new(StaticAgent::new("hunter", "detection", 0.6)));
        r.dispatcher.initialize().await.unwrap();

        let tenant = Uuid::new_v4();
        r.bus.publish_event(&brute_force_event(tenant)).await.unwrap();
        r.dispatcher.process_batch().await.unwrap();

        let incidents = r
            .storage
            .list_incidents(tenant, &IncidentFilter::default())
            .await
            .unwrap();
        assert_eq!(incidents.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_event_is_acked_not_retried() {
        let r = rig(HornetConfig::default());
        r.dispatcher.initialize().await.unwrap();

        r.bus.publish_event(&json!({"not": "an event"})).await.unwrap();
        r.dispatcher.process_batch().await.unwrap();

        assert_eq!(r.bus.pending_count(DISPATCHER_GROUP).await.unwrap(), 0);
        assert_eq!(r.dispatcher.status().processed_events, 0);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_creates_one_incident() {
        let r = rig(HornetConfig::default());
        r.registry
            .register(Arc::new(StaticAgent::new("hunter", "detection", 0.7)));
        r.dispatcher.initialize().await.unwrap();

        let tenant = Uuid::new_v4();
        let event = brute_force_event(tenant);
        r.bus.publish_event(&event).await.unwrap();
        r.bus.publish_event(&event).await.unwrap();
        r.dispatcher.process_batch().await.unwrap();

        let incidents = r
            .storage
            .list_incidents(tenant, &IncidentFilter::default())
            .await
            .unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(r.dispatcher.status().processed_events, 2);
    }
}
