//! HORNET: Event Bus
//!
//! Durable, append-only event streams with named consumer groups,
//! per-incident message substreams, distributed locks, per-incident token
//! counters, and a realtime pub/sub channel.
//!
//! Two backends implement the same trait:
//! - [`MemoryBus`]: tokio primitives; tests and single-node runs
//! - [`RedisBus`]: Redis Streams / SET NX / INCRBY / PUBLISH
//!
//! Delivery on a consumer group is at-least-once: a message stays pending
//! until acked and is redelivered after an idle interval. Consumers must be
//! idempotent in the state they create downstream.

pub mod memory;
pub mod ratelimit;
pub mod redis_bus;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryBus;
pub use ratelimit::{RateDecision, RateLimiter};
pub use redis_bus::RedisBus;

/// Ingress event stream.
pub const EVENTS_STREAM: &str = "hornet:events";
/// Consumer group reserved for the dispatcher. Never shared.
pub const DISPATCHER_GROUP: &str = "hornet_dispatcher";
/// Consumer group for general event-stream workers.
pub const WORKERS_GROUP: &str = "hornet_workers";
/// Realtime pub/sub channel for dashboards.
pub const REALTIME_CHANNEL: &str = "hornet:realtime";

/// Pending messages older than this are redelivered on the next consume.
pub const REDELIVERY_IDLE: Duration = Duration::from_secs(30);

/// Bus errors. All are transient from the caller's perspective.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection failed: {0}")]
    Connection(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("bus operation failed: {0}")]
    Operation(String),
}

/// A message delivered from a stream to a consumer group.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Stream-assigned id, used for acknowledgement
    pub stream_id: String,
    /// JSON payload as published
    pub payload: serde_json::Value,
}

/// A frame on the realtime channel. Carries its tenant so subscribers can
/// route per tenant; delivery is best-effort and unordered relative to
/// storage writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeFrame {
    /// Frame type (incident_created, state_change, finding, ...)
    #[serde(rename = "type")]
    pub event_type: String,
    /// Tenant the frame belongs to
    pub tenant_id: Uuid,
    /// Frame payload
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl RealtimeFrame {
    pub fn new(event_type: impl Into<String>, tenant_id: Uuid, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            tenant_id,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Receiver half of a realtime subscription.
pub type RealtimeReceiver = tokio::sync::mpsc::Receiver<RealtimeFrame>;

/// The event bus abstraction.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Create a consumer group on the events stream if it does not exist.
    async fn ensure_group(&self, group: &str) -> Result<(), BusError>;

    /// Append an event to the events stream. Returns the stream message id.
    async fn publish_event(&self, event: &serde_json::Value) -> Result<String, BusError>;

    /// Read up to `count` new (or stale-pending) messages for a consumer in
    /// a group, blocking up to `block` when the stream is empty.
    async fn consume(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<BusMessage>, BusError>;

    /// Acknowledge a message for a group.
    async fn ack(&self, group: &str, message_id: &str) -> Result<(), BusError>;

    /// Append a message to an incident's substream (bounded history).
    async fn publish_incident_message(
        &self,
        incident_id: Uuid,
        message: &serde_json::Value,
    ) -> Result<(), BusError>;

    /// Read an incident substream from the beginning.
    async fn incident_messages(
        &self,
        incident_id: Uuid,
        count: usize,
    ) -> Result<Vec<serde_json::Value>, BusError>;

    /// Try to take a distributed lock. Returns false when held by another
    /// holder and not yet expired.
    async fn try_acquire(
        &self,
        resource: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, BusError>;

    /// Release a lock, only if `holder` still owns it.
    async fn release(&self, resource: &str, holder: &str) -> Result<(), BusError>;

    /// Atomically add to an incident's token counter; returns the new value.
    async fn incr_tokens(&self, incident_id: Uuid, tokens: i64) -> Result<i64, BusError>;

    /// Read an incident's token counter. May be stale.
    async fn get_tokens(&self, incident_id: Uuid) -> Result<i64, BusError>;

    /// Publish a realtime frame. Best-effort.
    async fn publish_realtime(&self, frame: &RealtimeFrame) -> Result<(), BusError>;

    /// Subscribe to the realtime channel.
    async fn subscribe_realtime(&self) -> Result<RealtimeReceiver, BusError>;

    /// Number of entries in the events stream.
    async fn queue_depth(&self) -> Result<u64, BusError>;

    /// Number of messages pending acknowledgement for a group.
    async fn pending_count(&self, group: &str) -> Result<u64, BusError>;

    /// Backend reachability.
    async fn health_check(&self) -> bool;
}
