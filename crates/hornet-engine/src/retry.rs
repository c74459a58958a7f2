//! HORNET: Retry Queue and Dead-Letter Queue
//!
//! Outbound delivery jobs retried on a fixed backoff ladder. A job whose
//! attempts are exhausted moves to the DLQ, where it stays queryable until
//! replayed or aged out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use sha2::Sha256;
use uuid::Uuid;

use hornet_types::{HornetError, RetryAttemptError, RetryJob, RetryStatus};

/// Backoff ladder in seconds, indexed by attempt count.
pub const BACKOFF_SECONDS: [i64; 5] = [0, 30, 120, 600, 3600];
/// Jobs picked up per processing pass.
const PROCESS_BATCH: usize = 10;

/// Handler for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &RetryJob) -> Result<(), HornetError>;
}

/// Retry queue with dead-lettering.
pub struct RetryQueue {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    queue: Mutex<HashMap<Uuid, RetryJob>>,
    dlq: Mutex<HashMap<Uuid, RetryJob>>,
    running: std::sync::atomic::AtomicBool,
}

impl Default for RetryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryQueue {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            queue: Mutex::new(HashMap::new()),
            dlq: Mutex::new(HashMap::new()),
            running: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn register_handler(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.write().insert(job_type.into(), handler);
    }

    /// Enqueue a job, due immediately.
    pub fn enqueue(&self, job: RetryJob) -> Uuid {
        let id = job.id;
        tracing::info!(job_id = %id, job_type = %job.job_type, target = %job.target, "retry job enqueued");
        self.queue.lock().insert(id, job);
        id
    }

    /// One processing pass over due jobs. Returns how many were attempted.
    pub async fn process_due(&self) -> usize {
        let now = Utc::now();
        let due: Vec<RetryJob> = {
            let queue = self.queue.lock();
            let mut due: Vec<RetryJob> = queue.values().filter(|j| j.is_due(now)).cloned().collect();
            due.sort_by_key(|j| j.next_attempt);
            due.truncate(PROCESS_BATCH);
            due
        };

        let attempted = due.len();
        for job in due {
            self.process_job(job).await;
        }
        attempted
    }

    async fn process_job(&self, mut job: RetryJob) {
        let handler = self.handlers.read().get(&job.job_type).cloned();

        job.attempts += 1;
        job.last_attempt = Some(Utc::now());
        job.status = RetryStatus::Retrying;

        let result = match handler {
            Some(handler) => handler.handle(&job).await,
            None => Err(HornetError::Validation(format!(
                "no handler for job type {}",
                job.job_type
            ))),
        };

        match result {
            Ok(()) => {
                job.status = RetryStatus::Succeeded;
                self.queue.lock().remove(&job.id);
                metrics::increment_counter!("hornet_retry_jobs_total", "outcome" => "succeeded");
                tracing::info!(job_id = %job.id, attempts = job.attempts, "retry job succeeded");
            }
            Err(e) => {
                job.error_history.push(RetryAttemptError {
                    attempt: job.attempts,
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                if job.attempts >= job.max_attempts {
                    job.status = RetryStatus::DeadLettered;
                    job.next_attempt = None;
                    self.queue.lock().remove(&job.id);
                    self.dlq.lock().insert(job.id, job.clone());
                    metrics::increment_counter!("hornet_retry_jobs_total", "outcome" => "dead_lettered");
                    tracing::warn!(job_id = %job.id, attempts = job.attempts, "retry job dead-lettered");
                } else {
                    let backoff =
                        BACKOFF_SECONDS[(job.attempts as usize).min(BACKOFF_SECONDS.len() - 1)];
                    job.next_attempt = Some(Utc::now() + chrono::Duration::seconds(backoff));
                    job.status = RetryStatus::Pending;
                    tracing::debug!(
                        job_id = %job.id,
                        attempt = job.attempts,
                        backoff_secs = backoff,
                        "retry scheduled"
                    );
                    self.queue.lock().insert(job.id, job);
                }
            }
        }
    }

    /// Run the processor loop until [`stop`](Self::stop).
    pub async fn run(&self, poll_interval: Duration) {
        self.running
            .store(true, std::sync::atomic::Ordering::SeqCst);
        tracing::info!(poll_secs = poll_interval.as_secs(), "retry processor started");
        while self.running.load(std::sync::atomic::Ordering::SeqCst) {
            self.process_due().await;
            tokio::time::sleep(poll_interval).await;
        }
    }

    pub fn stop(&self) {
        self.running
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// DLQ contents, optionally restricted to one tenant.
    pub fn list_dlq(&self, tenant_id: Option<Uuid>) -> Vec<RetryJob> {
        let mut jobs: Vec<RetryJob> = self
            .dlq
            .lock()
            .values()
            .filter(|j| tenant_id.map(|t| j.tenant_id == t).unwrap_or(true))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Requeue a dead-lettered job: attempts reset, history cleared, due
    /// immediately.
    pub fn replay(&self, job_id: Uuid) -> bool {
        let Some(mut job) = self.dlq.lock().remove(&job_id) else {
            return false;
        };
        job.attempts = 0;
        job.error_history.clear();
        job.status = RetryStatus::Pending;
        job.next_attempt = Some(Utc::now());
        tracing::info!(%job_id, "dead-lettered job replayed");
        self.queue.lock().insert(job.id, job);
        true
    }

    /// Drop DLQ entries older than the retention window. Returns the count
    /// purged.
    pub fn purge_dlq_older_than(&self, retention_hours: i64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::hours(retention_hours);
        let mut dlq = self.dlq.lock();
        let before = dlq.len();
        dlq.retain(|_, j| j.created_at >= cutoff);
        before - dlq.len()
    }

    pub fn stats(&self) -> (usize, usize) {
        (self.queue.lock().len(), self.dlq.lock().len())
    }
}

/// Signature header value for an outbound webhook body.
pub fn sign_payload(payload: &serde_json::Value, secret: &str) -> String {
    let canonical = payload.to_string();
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(canonical.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify an inbound webhook signature in constant time.
pub fn verify_signature(body: &[u8], signature: &str, secret: &str) -> bool {
    let Some(hex_digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(raw) = hex::decode(hex_digest) else {
        return false;
    };
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body);
    mac.verify_slice(&raw).is_ok()
}

/// Delivers webhook payloads, optionally signed.
pub struct WebhookDeliverer {
    client: reqwest::Client,
}

impl Default for WebhookDeliverer {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookDeliverer {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Build a webhook job, attaching a signature header when a secret is
    /// supplied.
    pub fn build_job(
        tenant_id: Uuid,
        url: &str,
        payload: serde_json::Value,
        secret: Option<&str>,
        max_attempts: u32,
    ) -> RetryJob {
        let mut job = RetryJob::new(tenant_id, "webhook", url, payload, max_attempts);
        if let Some(secret) = secret {
            let signature = sign_payload(&job.payload, secret);
            job.metadata = json!({"headers": {"X-HORNET-Signature": signature}});
        }
        job
    }
}

#[async_trait]
impl JobHandler for WebhookDeliverer {
    async fn handle(&self, job: &RetryJob) -> Result<(), HornetError> {
        let mut request = self
            .client
            .post(&job.target)
            .json(&job.payload)
            .header("X-HORNET-Delivery", job.id.to_string());
        if let Some(headers) = job.metadata.get("headers").and_then(|h| h.as_object()) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name.as_str(), value);
                }
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| HornetError::Transient(e.to_string()))?;
        if response.status().is_client_error() || response.status().is_server_error() {
            return Err(HornetError::Transient(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: u32,
    }

    impl CountingHandler {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail_first,
            })
        }
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &RetryJob) -> Result<(), HornetError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(HornetError::Transient("upstream 503".into()))
            } else {
                Ok(())
            }
        }
    }

    fn job(max_attempts: u32) -> RetryJob {
        RetryJob::new(
            Uuid::new_v4(),
            "webhook",
            "https://example.com/hook",
            json!({"k": "v"}),
            max_attempts,
        )
    }

    fn force_due(queue: &RetryQueue) {
        for j in queue.queue.lock().values_mut() {
            j.next_attempt = Some(Utc::now());
        }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let queue = RetryQueue::new();
        queue.register_handler("webhook", CountingHandler::new(0));
        queue.enqueue(job(5));

        assert_eq!(queue.process_due().await, 1);
        assert_eq!(queue.stats(), (0, 0));
    }

    #[tokio::test]
    async fn test_failure_schedules_backoff() {
        let queue = RetryQueue::new();
        queue.register_handler("webhook", CountingHandler::new(10));
        let id = queue.enqueue(job(5));

        queue.process_due().await;
        let stored = queue.queue.lock().get(&id).cloned().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.status, RetryStatus::Pending);
        assert_eq!(stored.error_history.len(), 1);
        // First retry waits ~30s; not due again immediately.
        assert_eq!(queue.process_due().await, 0);
    }

    #[tokio::test]
    async fn test_exhausted_job_dead_letters_with_full_history() {
        let queue = RetryQueue::new();
        queue.register_handler("webhook", CountingHandler::new(100));
        let tenant = Uuid::new_v4();
        let mut j = job(5);
        j.tenant_id = tenant;
        let id = queue.enqueue(j);

        for _ in 0..5 {
            force_due(&queue);
            queue.process_due().await;
        }

        assert_eq!(queue.stats(), (0, 1));
        let dlq = queue.list_dlq(Some(tenant));
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].id, id);
        assert_eq!(dlq[0].status, RetryStatus::DeadLettered);
        assert_eq!(dlq[0].attempts, 5);
        // Exactly max_attempts error entries.
        assert_eq!(dlq[0].error_history.len(), 5);
        // Another tenant sees nothing.
        assert!(queue.list_dlq(Some(Uuid::new_v4())).is_empty());
    }

    #[tokio::test]
    async fn test_replay_resets_job() {
        let queue = RetryQueue::new();
        queue.register_handler("webhook", CountingHandler::new(5));
        let id = queue.enqueue(job(5));
        for _ in 0..5 {
            force_due(&queue);
            queue.process_due().await;
        }
        assert_eq!(queue.stats(), (0, 1));

        assert!(queue.replay(id));
        assert!(!queue.replay(id));
        let stored = queue.queue.lock().get(&id).cloned().unwrap();
        assert_eq!(stored.attempts, 0);
        assert!(stored.error_history.is_empty());
        assert_eq!(stored.status, RetryStatus::Pending);

        // Handler now succeeds (5 failures already consumed).
        queue.process_due().await;
        assert_eq!(queue.stats(), (0, 0));
    }

    #[tokio::test]
    async fn test_dlq_aging() {
        let queue = RetryQueue::new();
        queue.register_handler("webhook", CountingHandler::new(100));
        queue.enqueue(job(1));
        force_due(&queue);
        queue.process_due().await;
        assert_eq!(queue.stats(), (0, 1));

        assert_eq!(queue.purge_dlq_older_than(1), 0);
        // Age the entry artificially.
        for j in queue.dlq.lock().values_mut() {
            j.created_at = Utc::now() - chrono::Duration::hours(100);
        }
        assert_eq!(queue.purge_dlq_older_than(72), 1);
        assert_eq!(queue.stats(), (0, 0));
    }

    #[test]
    fn test_signature_roundtrip() {
        let payload = json!({"b": 2, "a": 1});
        let signature = sign_payload(&payload, "secret");
        assert!(signature.starts_with("sha256="));

        let body = payload.to_string();
        assert!(verify_signature(body.as_bytes(), &signature, "secret"));
        assert!(!verify_signature(body.as_bytes(), &signature, "other"));
        assert!(!verify_signature(b"tampered", &signature, "secret"));
        assert!(!verify_signature(body.as_bytes(), "bogus", "secret"));
    }

    #[test]
    fn test_signed_job_carries_header() {
        let job = WebhookDeliverer::build_job(
            Uuid::new_v4(),
            "https://example.com/hook",
            json!({"x": 1}),
            Some("secret"),
            5,
        );
        let header = job.metadata["headers"]["X-HORNET-Signature"]
            .as_str()
            .unwrap();
        assert!(header.starts_with("sha256="));

        let unsigned = WebhookDeliverer::build_job(
            Uuid::new_v4(),
            "https://example.com/hook",
            json!({"x": 1}),
            None,
            5,
        );
        assert!(unsigned.metadata.get("headers").is_none());
    }
}
