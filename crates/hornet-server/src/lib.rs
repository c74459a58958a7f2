//! HORNET: Server
//!
//! The HTTP and WebSocket surface over the engine: authenticated REST API,
//! tenant-scoped dashboard channel, edge gateway with signed actions,
//! webhook ingest adapters, and Prometheus metrics.

pub mod auth;
pub mod edge;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use hornet_bus::{EventBus, RateLimiter};
use hornet_engine::{
    ActionExecutor, AgentRegistry, BaselineEngine, BaselineRollupJob, CampaignCorrelator,
    ComponentHealth, Coordinator, DlqAgingJob, EventDispatcher, FeedbackLog, HealthProbeJob,
    JobScheduler, PlaybookRegistry, RetryQueue, ThresholdTunerJob, Thresholds, TimeoutScanJob,
    WebhookDeliverer,
};
use hornet_store::{ApiKeyValidator, AuditLogger, Storage};
use hornet_types::HornetConfig;

pub use state::AppState;

/// Wire the full application from its process-level resources. Returns the
/// shared state and the job scheduler with every periodic job registered.
pub fn wire(
    config: Arc<HornetConfig>,
    storage: Arc<dyn Storage>,
    bus: Arc<dyn EventBus>,
    validator: Arc<dyn ApiKeyValidator>,
) -> (AppState, Arc<JobScheduler>) {
    let registry = Arc::new(AgentRegistry::new());
    let thresholds = Arc::new(Thresholds::from_config(&config));
    let feedback = Arc::new(FeedbackLog::new());
    let baseline = Arc::new(BaselineEngine::new());
    let executor = Arc::new(ActionExecutor::new(
        storage.clone(),
        config.connector_call_timeout,
    ));
    let correlator = Arc::new(CampaignCorrelator::new(storage.clone(), &config));
    let coordinator = Arc::new(Coordinator::new(
        storage.clone(),
        bus.clone(),
        registry.clone(),
        executor.clone(),
        correlator.clone(),
        thresholds.clone(),
        feedback.clone(),
        config.clone(),
    ));
    let dispatcher = Arc::new(EventDispatcher::new(
        bus.clone(),
        registry.clone(),
        coordinator.clone(),
        thresholds.clone(),
        baseline.clone(),
        config.clone(),
    ));

    let retry_queue = Arc::new(RetryQueue::new());
    retry_queue.register_handler("webhook", Arc::new(WebhookDeliverer::new()));

    let audit = Arc::new(AuditLogger::new(
        storage.clone(),
        config.secret_key.as_bytes().to_vec(),
    ));
    let health = Arc::new(ComponentHealth::new());
    let edge = Arc::new(edge::EdgeGateway::new(
        config.secret_key.clone(),
        config.edge_action_ttl,
    ));

    let state = AppState {
        config: config.clone(),
        storage: storage.clone(),
        bus: bus.clone(),
        registry,
        coordinator: coordinator.clone(),
        dispatcher,
        executor: executor.clone(),
        correlator,
        retry_queue: retry_queue.clone(),
        playbooks: Arc::new(PlaybookRegistry::builtin()),
        thresholds: thresholds.clone(),
        validator,
        audit,
        health: health.clone(),
        rate_limiter: Arc::new(RateLimiter::new()),
        ws: Arc::new(ws::ConnectionManager::new()),
        edge,
        metrics: metrics::install_recorder(),
    };

    let scheduler = Arc::new(JobScheduler::new());
    scheduler.register(
        Arc::new(DlqAgingJob::new(retry_queue, config.dlq_retention_hours)),
        Duration::from_secs(3600),
    );
    scheduler.register(
        Arc::new(ThresholdTunerJob::new(feedback, thresholds)),
        Duration::from_secs(24 * 3600),
    );
    scheduler.register(
        Arc::new(BaselineRollupJob::new(baseline)),
        Duration::from_secs(24 * 3600),
    );
    scheduler.register(
        Arc::new(HealthProbeJob::new(bus, storage, executor, health)),
        Duration::from_secs(30),
    );
    scheduler.register(
        Arc::new(TimeoutScanJob::new(coordinator)),
        Duration::from_secs(30),
    );

    (state, scheduler)
}

/// Build the router with all routes and layers.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/events", post(routes::events::ingest))
        .route("/events/batch", post(routes::events::ingest_batch))
        .route("/incidents", get(routes::incidents::list))
        .route("/incidents/{id}", get(routes::incidents::get_one))
        .route("/incidents/{id}/timeline", get(routes::incidents::timeline))
        .route("/incidents/{id}/action", post(routes::incidents::submit_action))
        .route("/campaigns/graph", get(routes::campaigns::graph))
        .route("/campaigns/stats", get(routes::campaigns::stats))
        .route("/campaigns/{id}/related", get(routes::campaigns::related))
        .route(
            "/config/thresholds",
            get(routes::config::get_thresholds).put(routes::config::put_thresholds),
        )
        .route("/config/playbooks", get(routes::config::playbooks))
        .route("/config/playbooks/{id}", get(routes::config::playbook))
        .route("/config/agents", get(routes::config::agents))
        .route("/dlq", get(routes::dlq::list))
        .route("/dlq/{id}/replay", post(routes::dlq::replay))
        .route("/health", get(routes::health::health))
        .route("/health/ready", get(routes::health::ready))
        .route("/health/live", get(routes::health::live))
        .route("/health/agents", get(routes::health::agents))
        .route("/dispatcher/status", get(routes::health::dispatcher_status))
        .route("/webhooks/cloudflare", post(routes::webhooks::cloudflare))
        .route("/webhooks/aws-sns", post(routes::webhooks::aws_sns))
        .route("/webhooks/syslog", post(routes::webhooks::syslog))
        .route("/webhooks/generic", post(routes::webhooks::generic))
        .route("/ws/{tenant_id}", get(ws::dashboard_ws))
        .route("/edge/connect", get(edge::edge_ws))
        .route("/edge/status", get(edge::status))
        .route("/edge/action", post(edge::send_action));

    Router::new()
        .route("/", get(routes::health::root))
        .route("/metrics", get(metrics::render))
        .nest("/api/v1", api)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit,
        ))
        .layer(axum::middleware::from_fn(middleware::request_context))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Spawn the long-running background tasks: dispatcher loop, retry
/// processor, job scheduler, and the realtime fan-out pump.
pub async fn spawn_background(
    state: &AppState,
    scheduler: Arc<JobScheduler>,
) -> Result<Vec<tokio::task::JoinHandle<()>>, hornet_types::HornetError> {
    state.dispatcher.initialize().await?;

    let mut handles = Vec::new();

    let dispatcher = state.dispatcher.clone();
    handles.push(tokio::spawn(async move {
        dispatcher.run().await;
    }));

    let retry_queue = state.retry_queue.clone();
    handles.push(tokio::spawn(async move {
        retry_queue.run(Duration::from_secs(30)).await;
    }));

    handles.push(tokio::spawn(async move {
        scheduler.run(Duration::from_secs(60)).await;
    }));

    let pump_state = state.clone();
    handles.push(tokio::spawn(async move {
        ws::run_realtime_pump(pump_state).await;
    }));

    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hornet_bus::MemoryBus;
    use hornet_store::{MemoryStorage, StaticApiKeys};
    use hornet_types::{SubscriptionTier, TenantIdentity};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_wire_and_build_router() {
        let config = Arc::new(HornetConfig::default());
        let identity = TenantIdentity {
            tenant_id: Uuid::new_v4(),
            tenant_name: "acme".into(),
            key_id: Uuid::new_v4(),
            scopes: vec!["full".into()],
            tier: SubscriptionTier::Pro,
        };
        let validator = Arc::new(StaticApiKeys::new().with_key("hnt_test", identity));

        let (state, _scheduler) = wire(
            config,
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryBus::new()),
            validator,
        );
        let _router = build_router(state.clone());

        assert_eq!(state.playbooks.all().len(), 2);
        assert!(state.registry.is_empty());
    }
}
