//! HORNET: Application State
//!
//! Process-level resources wired once at startup and shared by every
//! handler. Everything tenant-bound flows through arguments, never through
//! this struct.

use std::sync::Arc;

use hornet_bus::{EventBus, RateLimiter};
use hornet_engine::{
    ActionExecutor, AgentRegistry, CampaignCorrelator, ComponentHealth, Coordinator,
    EventDispatcher, PlaybookRegistry, RetryQueue, Thresholds,
};
use hornet_store::{ApiKeyValidator, AuditLogger, Storage};
use hornet_types::HornetConfig;

use crate::edge::EdgeGateway;
use crate::ws::ConnectionManager;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HornetConfig>,
    pub storage: Arc<dyn Storage>,
    pub bus: Arc<dyn EventBus>,
    pub registry: Arc<AgentRegistry>,
    pub coordinator: Arc<Coordinator>,
    pub dispatcher: Arc<EventDispatcher>,
    pub executor: Arc<ActionExecutor>,
    pub correlator: Arc<CampaignCorrelator>,
    pub retry_queue: Arc<RetryQueue>,
    pub playbooks: Arc<PlaybookRegistry>,
    pub thresholds: Arc<Thresholds>,
    pub validator: Arc<dyn ApiKeyValidator>,
    pub audit: Arc<AuditLogger>,
    pub health: Arc<ComponentHealth>,
    pub rate_limiter: Arc<RateLimiter>,
    pub ws: Arc<ConnectionManager>,
    pub edge: Arc<EdgeGateway>,
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}
