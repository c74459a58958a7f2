//! HORNET: Retry Jobs
//!
//! Outbound delivery jobs scheduled on a backoff ladder, dead-lettered
//! when attempts are exhausted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Retry job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryStatus {
    Pending,
    Retrying,
    Succeeded,
    Failed,
    DeadLettered,
}

/// One failed attempt, kept in the job's error history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttemptError {
    pub attempt: u32,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// An outbound delivery job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryJob {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Handler selector (e.g. "webhook")
    pub job_type: String,
    /// Delivery target (URL for webhooks)
    pub target: String,
    /// Delivery payload
    pub payload: serde_json::Value,
    /// Attempts made so far; monotonic
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: RetryStatus,
    pub created_at: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
    /// Earliest time the next attempt may run
    pub next_attempt: Option<DateTime<Utc>>,
    /// One entry per failed attempt, bounded by max_attempts
    pub error_history: Vec<RetryAttemptError>,
    /// Handler metadata (headers, signature material)
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl RetryJob {
    pub fn new(
        tenant_id: Uuid,
        job_type: impl Into<String>,
        target: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            job_type: job_type.into(),
            target: target.into(),
            payload,
            attempts: 0,
            max_attempts,
            status: RetryStatus::Pending,
            created_at: now,
            last_attempt: None,
            next_attempt: Some(now),
            error_history: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Whether the job is due for processing.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == RetryStatus::Pending
            && self.next_attempt.map(|t| t <= now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_is_due_immediately() {
        let job = RetryJob::new(
            Uuid::new_v4(),
            "webhook",
            "https://example.com/hook",
            serde_json::json!({"k": "v"}),
            5,
        );
        assert_eq!(job.status, RetryStatus::Pending);
        assert!(job.is_due(Utc::now()));
        assert!(job.error_history.is_empty());
    }
}
