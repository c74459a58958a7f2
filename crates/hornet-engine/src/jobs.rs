//! HORNET: Periodic Jobs
//!
//! Interval scheduler plus the background jobs: DLQ aging, threshold
//! tuning from human feedback, entity-activity baseline rollup, component
//! health probes, and the incident timeout scan.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use hornet_bus::EventBus;
use hornet_store::Storage;
use hornet_types::HornetError;

use crate::coordinator::Coordinator;
use crate::executor::ActionExecutor;
use crate::retry::RetryQueue;
use crate::thresholds::Thresholds;

/// A background job.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<(), HornetError>;
}

struct ScheduledJob {
    job: Arc<dyn Job>,
    interval: Duration,
    last_run: Option<Instant>,
}

/// Runs registered jobs on their intervals. A failing job is logged and
/// retried on its next interval; it never takes the scheduler down.
pub struct JobScheduler {
    jobs: Mutex<Vec<ScheduledJob>>,
    running: AtomicBool,
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl JobScheduler {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn register(&self, job: Arc<dyn Job>, interval: Duration) {
        tracing::info!(job = job.name(), interval_secs = interval.as_secs(), "job registered");
        self.jobs.lock().push(ScheduledJob {
            job,
            interval,
            last_run: None,
        });
    }

    /// Run every due job once.
    pub async fn tick(&self) {
        let now = Instant::now();
        let due: Vec<Arc<dyn Job>> = {
            let mut jobs = self.jobs.lock();
            jobs.iter_mut()
                .filter(|j| {
                    j.last_run
                        .map(|last| now.duration_since(last) >= j.interval)
                        .unwrap_or(true)
                })
                .map(|j| {
                    j.last_run = Some(now);
                    j.job.clone()
                })
                .collect()
        };

        for job in due {
            if let Err(e) = job.run().await {
                tracing::error!(job = job.name(), error = %e, "job failed");
            }
        }
    }

    /// Scheduler loop until [`stop`](Self::stop).
    pub async fn run(&self, poll: Duration) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("job scheduler started");
        while self.running.load(Ordering::SeqCst) {
            self.tick().await;
            tokio::time::sleep(poll).await;
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Human feedback and threshold tuning
// ----------------------------------------------------------------------------

/// Human assessment of an automated decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    TruePositive,
    FalsePositive,
    FalseNegative,
}

struct FeedbackEntry {
    #[allow(dead_code)]
    tenant_id: Uuid,
    assessment: Assessment,
}

/// Accumulates human feedback between tuner runs.
#[derive(Default)]
pub struct FeedbackLog {
    entries: Mutex<Vec<FeedbackEntry>>,
}

impl FeedbackLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tenant_id: Uuid, assessment: Assessment) {
        self.entries.lock().push(FeedbackEntry {
            tenant_id,
            assessment,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn rates(&self) -> Option<(usize, f64, f64)> {
        let entries = self.entries.lock();
        if entries.is_empty() {
            return None;
        }
        let total = entries.len();
        let fp = entries
            .iter()
            .filter(|e| e.assessment == Assessment::FalsePositive)
            .count();
        let fn_ = entries
            .iter()
            .filter(|e| e.assessment == Assessment::FalseNegative)
            .count();
        Some((total, fp as f64 / total as f64, fn_ as f64 / total as f64))
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Adjusts the dismiss gate from accumulated feedback. Too many false
/// positives raise the gate, too many misses lower it; each run moves it
/// by at most [`Self::MAX_ADJUSTMENT`].
pub struct ThresholdTunerJob {
    feedback: Arc<FeedbackLog>,
    thresholds: Arc<Thresholds>,
}

impl ThresholdTunerJob {
    pub const MAX_ADJUSTMENT: f64 = 0.10;
    pub const ADJUSTMENT_STEP: f64 = 0.05;
    pub const MIN_SAMPLES: usize = 20;
    pub const FP_RATE_LIMIT: f64 = 0.20;
    pub const FN_RATE_LIMIT: f64 = 0.10;

    pub fn new(feedback: Arc<FeedbackLog>, thresholds: Arc<Thresholds>) -> Self {
        Self {
            feedback,
            thresholds,
        }
    }
}

#[async_trait]
impl Job for ThresholdTunerJob {
    fn name(&self) -> &str {
        "threshold_tuner"
    }

    async fn run(&self) -> Result<(), HornetError> {
        let Some((samples, fp_rate, fn_rate)) = self.feedback.rates() else {
            return Ok(());
        };
        if samples < Self::MIN_SAMPLES {
            tracing::debug!(samples, "tuner skipped, not enough feedback");
            return Ok(());
        }

        let step = Self::ADJUSTMENT_STEP.min(Self::MAX_ADJUSTMENT);
        if fp_rate > Self::FP_RATE_LIMIT {
            let dismiss = self.thresholds.adjust_dismiss(step);
            tracing::info!(fp_rate, dismiss, "dismiss threshold raised");
        } else if fn_rate > Self::FN_RATE_LIMIT {
            let dismiss = self.thresholds.adjust_dismiss(-step);
            tracing::info!(fn_rate, dismiss, "dismiss threshold lowered");
        }
        self.feedback.clear();
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Entity-activity baselines
// ----------------------------------------------------------------------------

const BASELINE_HISTORY: usize = 30;
const ANOMALY_Z_SCORE: f64 = 2.0;

#[derive(Debug, Clone, Default, Serialize)]
pub struct BaselineStat {
    pub mean: f64,
    pub stddev: f64,
    pub samples: usize,
}

/// Per-tenant, per-entity-class activity baselines. The dispatcher feeds
/// the current bucket on each promotion; the rollup job folds it into the
/// history and recomputes mean and deviation.
#[derive(Default)]
pub struct BaselineEngine {
    current: Mutex<HashMap<(Uuid, String), u64>>,
    history: Mutex<HashMap<(Uuid, String), Vec<f64>>>,
}

impl BaselineEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one incident touching an entity class.
    pub fn observe(&self, tenant_id: Uuid, entity_type: &str) {
        *self
            .current
            .lock()
            .entry((tenant_id, entity_type.to_string()))
            .or_insert(0) += 1;
    }

    /// Fold the current bucket into the history.
    pub fn rollup(&self) {
        let bucket: HashMap<(Uuid, String), u64> = std::mem::take(&mut *self.current.lock());
        let mut history = self.history.lock();
        for (key, count) in bucket {
            let series = history.entry(key).or_default();
            series.push(count as f64);
            if series.len() > BASELINE_HISTORY {
                series.remove(0);
            }
        }
    }

    pub fn stat(&self, tenant_id: Uuid, entity_type: &str) -> Option<BaselineStat> {
        let history = self.history.lock();
        let series = history.get(&(tenant_id, entity_type.to_string()))?;
        if series.is_empty() {
            return None;
        }
        let mean = series.iter().sum::<f64>() / series.len() as f64;
        let variance =
            series.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / series.len() as f64;
        Some(BaselineStat {
            mean,
            stddev: variance.sqrt(),
            samples: series.len(),
        })
    }

    /// Whether an observed count deviates from the baseline by at least
    /// two standard deviations.
    pub fn is_anomalous(&self, tenant_id: Uuid, entity_type: &str, count: u64) -> bool {
        let Some(stat) = self.stat(tenant_id, entity_type) else {
            return false;
        };
        if stat.stddev == 0.0 {
            return count as f64 > stat.mean;
        }
        (count as f64 - stat.mean) / stat.stddev >= ANOMALY_Z_SCORE
    }
}

/// Rolls baseline buckets into history on a schedule.
pub struct BaselineRollupJob {
    engine: Arc<BaselineEngine>,
}

impl BaselineRollupJob {
    pub fn new(engine: Arc<BaselineEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Job for BaselineRollupJob {
    fn name(&self) -> &str {
        "baseline_rollup"
    }

    async fn run(&self) -> Result<(), HornetError> {
        self.engine.rollup();
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// DLQ aging
// ----------------------------------------------------------------------------

/// Purges dead-lettered jobs past retention.
pub struct DlqAgingJob {
    queue: Arc<RetryQueue>,
    retention_hours: i64,
}

impl DlqAgingJob {
    pub fn new(queue: Arc<RetryQueue>, retention_hours: i64) -> Self {
        Self {
            queue,
            retention_hours,
        }
    }
}

#[async_trait]
impl Job for DlqAgingJob {
    fn name(&self) -> &str {
        "dlq_aging"
    }

    async fn run(&self) -> Result<(), HornetError> {
        let purged = self.queue.purge_dlq_older_than(self.retention_hours);
        if purged > 0 {
            tracing::info!(purged, "aged DLQ entries purged");
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Component health
// ----------------------------------------------------------------------------

/// Last-probed component health, shared with the readiness endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSnapshot {
    pub bus_healthy: bool,
    pub storage_healthy: bool,
    pub connectors: HashMap<String, bool>,
    pub checked_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct ComponentHealth {
    inner: Mutex<HealthSnapshot>,
}

impl ComponentHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.inner.lock().clone()
    }

    pub fn ready(&self) -> bool {
        let snapshot = self.inner.lock();
        snapshot.checked_at.is_some() && snapshot.bus_healthy && snapshot.storage_healthy
    }
}

/// Probes bus, storage, and connectors.
pub struct HealthProbeJob {
    bus: Arc<dyn EventBus>,
    storage: Arc<dyn Storage>,
    executor: Arc<ActionExecutor>,
    health: Arc<ComponentHealth>,
}

impl HealthProbeJob {
    pub fn new(
        bus: Arc<dyn EventBus>,
        storage: Arc<dyn Storage>,
        executor: Arc<ActionExecutor>,
        health: Arc<ComponentHealth>,
    ) -> Self {
        Self {
            bus,
            storage,
            executor,
            health,
        }
    }
}

#[async_trait]
impl Job for HealthProbeJob {
    fn name(&self) -> &str {
        "health_probe"
    }

    async fn run(&self) -> Result<(), HornetError> {
        let bus_healthy = self.bus.health_check().await;
        let storage_healthy = self.storage.health_check().await;
        let connectors = self.executor.connector_health().await;
        if !bus_healthy || !storage_healthy {
            tracing::warn!(bus_healthy, storage_healthy, "component health degraded");
        }
        *self.health.inner.lock() = HealthSnapshot {
            bus_healthy,
            storage_healthy,
            connectors,
            checked_at: Some(Utc::now()),
        };
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Incident timeout scan
// ----------------------------------------------------------------------------

/// Forces closure of incidents that outlive the wall-clock cap.
pub struct TimeoutScanJob {
    coordinator: Arc<Coordinator>,
}

impl TimeoutScanJob {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl Job for TimeoutScanJob {
    fn name(&self) -> &str {
        "incident_timeout_scan"
    }

    async fn run(&self) -> Result<(), HornetError> {
        let closed = self.coordinator.check_timeouts().await;
        if closed > 0 {
            tracing::warn!(closed, "timed-out incidents closed");
        }
        Ok(())
    }
}
