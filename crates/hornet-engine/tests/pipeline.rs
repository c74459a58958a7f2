//! End-to-end pipeline: events published to the bus, consumed by the
//! dispatcher, driven through the FSM, and correlated into a campaign.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use hornet_bus::{EventBus, MemoryBus};
use hornet_engine::{
    ActionExecutor, AgentRegistry, BaselineEngine, CampaignCorrelator, Coordinator,
    EventDispatcher, FeedbackLog, MockConnector, StaticAgent, Thresholds,
};
use hornet_store::{MemoryStorage, Storage};
use hornet_types::{Entity, Event, HornetConfig, IncidentState, Severity};

struct Pipeline {
    dispatcher: Arc<EventDispatcher>,
    bus: Arc<MemoryBus>,
    storage: Arc<MemoryStorage>,
    registry: Arc<AgentRegistry>,
}

fn pipeline() -> Pipeline {
    let mut config = HornetConfig::default();
    config.agent_call_timeout = Duration::from_millis(200);
    let config = Arc::new(config);

    let storage = Arc::new(MemoryStorage::new());
    let bus = Arc::new(MemoryBus::new());
    let registry = Arc::new(AgentRegistry::new());
    let executor = Arc::new(ActionExecutor::new(
        storage.clone(),
        config.connector_call_timeout,
    ));
    executor.register_connector("firewall", Arc::new(MockConnector::new("firewall")));
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

    Pipeline {
        dispatcher,
        bus,
        storage,
        registry,
    }
}

/// Register the detection squad plus every phase agent for a run that
/// resolves end to end.
fn register_full_swarm(registry: &AgentRegistry) {
    registry.register(Arc::new(StaticAgent::new("hunter", "detection", 0.7)));
    registry.register(Arc::new(StaticAgent::new("sentinel", "detection", 0.4)));
    registry.register(Arc::new(
        StaticAgent::new("router", "routing", 0.75).with_content(json!({
            "activated_agents": ["intel", "analyst"],
            "confidence": 0.75
        })),
    ));
    registry.register(Arc::new(StaticAgent::new("intel", "intel", 0.6)));
    registry.register(Arc::new(
        StaticAgent::new("analyst", "verdict", 0.9).with_content(json!({
            "verdict": "CONFIRMED",
            "severity": "HIGH",
            "confidence": 0.9,
            "summary": "repeated credential failures from one source"
        })),
    ));
    registry.register(Arc::new(
        StaticAgent::new("responder", "proposal", 0.8).with_content(json!({
            "actions": [
                {"action_type": "block_ip", "target": "192.168.1.100", "risk_level": "MEDIUM"}
            ]
        })),
    ));
    registry.register(Arc::new(
        StaticAgent::new("oversight", "decision", 0.9).with_content(json!({"decision": "APPROVE"})),
    ));
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

/// Poll until every incident of the tenant is CLOSED.
async fn wait_for_closure(storage: &MemoryStorage, tenant: Uuid, expected: usize) {
    for _ in 0..100 {
        let incidents = storage
            .list_incidents(tenant, &Default::default())
            .await
            .unwrap();
        if incidents.len() == expected
            && incidents.iter().all(|i| i.state == IncidentState::Closed)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("incidents did not close within the deadline");
}

#[tokio::test]
async fn test_brute_force_events_become_a_campaign() {
    let p = pipeline();
    register_full_swarm(&p.registry);
    p.dispatcher.initialize().await.unwrap();

    let tenant = Uuid::new_v4();
    for _ in 0..3 {
        p.bus.publish_event(&brute_force_event(tenant)).await.unwrap();
    }
    p.dispatcher.process_batch().await.unwrap();

    let status = p.dispatcher.status();
    assert_eq!(status.processed_events, 3);
    assert_eq!(status.incidents_created, 3);

    wait_for_closure(&p.storage, tenant, 3).await;

    let incidents = p
        .storage
        .list_incidents(tenant, &Default::default())
        .await
        .unwrap();
    for incident in &incidents {
        assert_eq!(incident.outcome.as_deref(), Some("resolved"));
        assert!(incident.confidence >= 0.3);
        assert!(incident.closed_at.is_some());
        let findings = p.storage.get_findings(tenant, incident.id).await.unwrap();
        assert!(findings.iter().any(|f| f.finding_type == "detection"));
    }

    // Shared entities within the window correlate the set into a campaign.
    let campaign_ids: Vec<_> = incidents.iter().filter_map(|i| i.campaign_id).collect();
    assert_eq!(campaign_ids.len(), 3);
    assert!(campaign_ids.windows(2).all(|w| w[0] == w[1]));

    let stats = p.storage.campaign_stats(tenant).await.unwrap();
    assert!(stats.total_links >= 2);
    assert_eq!(stats.linked_incidents, 3);

    let members = p
        .storage
        .get_campaign_incidents(tenant, incidents[0].id)
        .await
        .unwrap();
    assert_eq!(members.len(), 3);
}

#[tokio::test]
async fn test_quiet_event_is_dismissed_without_incident() {
    let p = pipeline();
    for name in ["hunter", "sentinel", "behavioral", "netwatch", "endpoint"] {
        p.registry
            .register(Arc::new(StaticAgent::new(name, "detection", 0.1)));
    }
    p.dispatcher.initialize().await.unwrap();

    let tenant = Uuid::new_v4();
    p.bus.publish_event(&brute_force_event(tenant)).await.unwrap();
    p.dispatcher.process_batch().await.unwrap();

    assert!(p
        .storage
        .list_incidents(tenant, &Default::default())
        .await
        .unwrap()
        .is_empty());
    assert_eq!(p.dispatcher.status().dismissed, 1);
    assert_eq!(p.dispatcher.status().processed_events, 1);
}
