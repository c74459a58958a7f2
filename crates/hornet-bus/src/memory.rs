//! HORNET: In-Memory Bus
//!
//! Single-process backend with the same delivery semantics as the Redis
//! backend: ordered streams, per-group cursors, pending-until-ack with
//! idle redelivery, expiring locks, atomic counters, broadcast realtime.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, Notify};
use uuid::Uuid;

use crate::{
    BusError, BusMessage, EventBus, RealtimeFrame, RealtimeReceiver, EVENTS_STREAM,
    REDELIVERY_IDLE,
};

const INCIDENT_STREAM_MAXLEN: usize = 1000;

struct StoredEntry {
    id: String,
    payload: serde_json::Value,
}

struct PendingEntry {
    payload: serde_json::Value,
    delivered_at: Instant,
}

#[derive(Default)]
struct GroupState {
    next_index: usize,
    pending: HashMap<String, PendingEntry>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<StoredEntry>,
    seq: u64,
    groups: HashMap<String, GroupState>,
}

/// In-memory event bus.
pub struct MemoryBus {
    streams: Mutex<HashMap<String, StreamState>>,
    incident_streams: Mutex<HashMap<Uuid, Vec<serde_json::Value>>>,
    locks: parking_lot::Mutex<HashMap<String, (String, Instant)>>,
    counters: parking_lot::Mutex<HashMap<Uuid, i64>>,
    realtime: broadcast::Sender<RealtimeFrame>,
    notify: Notify,
    redelivery_idle: Duration,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        let (realtime, _) = broadcast::channel(256);
        Self {
            streams: Mutex::new(HashMap::new()),
            incident_streams: Mutex::new(HashMap::new()),
            locks: parking_lot::Mutex::new(HashMap::new()),
            counters: parking_lot::Mutex::new(HashMap::new()),
            realtime,
            notify: Notify::new(),
            redelivery_idle: REDELIVERY_IDLE,
        }
    }

    /// Shorten the redelivery idle interval (test tuning).
    pub fn with_redelivery_idle(mut self, idle: Duration) -> Self {
        self.redelivery_idle = idle;
        self
    }

    fn next_id(state: &mut StreamState) -> String {
        state.seq += 1;
        format!("{}-{}", chrono::Utc::now().timestamp_millis(), state.seq)
    }

    /// One non-blocking delivery pass for a group.
    fn drain(&self, state: &mut StreamState, group: &str, count: usize) -> Vec<BusMessage> {
        let group_state = state.groups.entry(group.to_string()).or_default();
        let mut out = Vec::new();

        // Redeliver stale pending messages first.
        let now = Instant::now();
        for (id, pending) in group_state.pending.iter_mut() {
            if out.len() >= count {
                break;
            }
            if now.duration_since(pending.delivered_at) >= self.redelivery_idle {
                pending.delivered_at = now;
                out.push(BusMessage {
                    stream_id: id.clone(),
                    payload: pending.payload.clone(),
                });
            }
        }

        // Then new entries past the group cursor.
        while out.len() < count && group_state.next_index < state.entries.len() {
            let entry = &state.entries[group_state.next_index];
            group_state.next_index += 1;
            group_state.pending.insert(
                entry.id.clone(),
                PendingEntry {
                    payload: entry.payload.clone(),
                    delivered_at: now,
                },
            );
            out.push(BusMessage {
                stream_id: entry.id.clone(),
                payload: entry.payload.clone(),
            });
        }

        out
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn ensure_group(&self, group: &str) -> Result<(), BusError> {
        let mut streams = self.streams.lock().await;
        let state = streams.entry(EVENTS_STREAM.to_string()).or_default();
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn publish_event(&self, event: &serde_json::Value) -> Result<String, BusError> {
        let mut streams = self.streams.lock().await;
        let state = streams.entry(EVENTS_STREAM.to_string()).or_default();
        let id = Self::next_id(state);
        state.entries.push(StoredEntry {
            id: id.clone(),
            payload: event.clone(),
        });
        drop(streams);
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn consume(
        &self,
        group: &str,
        _consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<BusMessage>, BusError> {
        let deadline = Instant::now() + block;
        loop {
            {
                let mut streams = self.streams.lock().await;
                let state = streams.entry(EVENTS_STREAM.to_string()).or_default();
                let out = self.drain(state, group, count);
                if !out.is_empty() {
                    return Ok(out);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, self.notify.notified()).await;
        }
    }

    async fn ack(&self, group: &str, message_id: &str) -> Result<(), BusError> {
        let mut streams = self.streams.lock().await;
        if let Some(state) = streams.get_mut(EVENTS_STREAM) {
            if let Some(group_state) = state.groups.get_mut(group) {
                group_state.pending.remove(message_id);
            }
        }
        Ok(())
    }

    async fn publish_incident_message(
        &self,
        incident_id: Uuid,
        message: &serde_json::Value,
    ) -> Result<(), BusError> {
        let mut streams = self.incident_streams.lock().await;
        let entries = streams.entry(incident_id).or_default();
        entries.push(message.clone());
        if entries.len() > INCIDENT_STREAM_MAXLEN {
            let excess = entries.len() - INCIDENT_STREAM_MAXLEN;
            entries.drain(..excess);
        }
        Ok(())
    }

    async fn incident_messages(
        &self,
        incident_id: Uuid,
        count: usize,
    ) -> Result<Vec<serde_json::Value>, BusError> {
        let streams = self.incident_streams.lock().await;
        Ok(streams
            .get(&incident_id)
            .map(|v| v.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn try_acquire(
        &self,
        resource: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, BusError> {
        let mut locks = self.locks.lock();
        let now = Instant::now();
        if let Some((owner, expires)) = locks.get(resource) {
            if *expires > now && owner != holder {
                return Ok(false);
            }
        }
        locks.insert(resource.to_string(), (holder.to_string(), now + ttl));
        Ok(true)
    }

    async fn release(&self, resource: &str, holder: &str) -> Result<(), BusError> {
        let mut locks = self.locks.lock();
        if let Some((owner, _)) = locks.get(resource) {
            if owner == holder {
                locks.remove(resource);
            }
        }
        Ok(())
    }

    async fn incr_tokens(&self, incident_id: Uuid, tokens: i64) -> Result<i64, BusError> {
        let mut counters = self.counters.lock();
        let value = counters.entry(incident_id).or_insert(0);
        *value += tokens;
        Ok(*value)
    }

    async fn get_tokens(&self, incident_id: Uuid) -> Result<i64, BusError> {
        Ok(*self.counters.lock().get(&incident_id).unwrap_or(&0))
    }

    async fn publish_realtime(&self, frame: &RealtimeFrame) -> Result<(), BusError> {
        // No subscribers is not an error.
        let _ = self.realtime.send(frame.clone());
        Ok(())
    }

    async fn subscribe_realtime(&self) -> Result<RealtimeReceiver, BusError> {
        let mut rx = self.realtime.subscribe();
        let (tx, out) = tokio::sync::mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(out)
    }

    async fn queue_depth(&self) -> Result<u64, BusError> {
        let streams = self.streams.lock().await;
        Ok(streams
            .get(EVENTS_STREAM)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn pending_count(&self, group: &str) -> Result<u64, BusError> {
        let streams = self.streams.lock().await;
        Ok(streams
            .get(EVENTS_STREAM)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len() as u64)
            .unwrap_or(0))
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_consume_ack() {
        let bus = MemoryBus::new();
        bus.ensure_group("g1").await.unwrap();

        let id = bus.publish_event(&json!({"n": 1})).await.unwrap();
        let messages = bus
            .consume("g1", "c1", 10, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].stream_id, id);
        assert_eq!(bus.pending_count("g1").await.unwrap(), 1);

        bus.ack("g1", &id).await.unwrap();
        assert_eq!(bus.pending_count("g1").await.unwrap(), 0);
        assert_eq!(bus.queue_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_groups_receive_independently() {
        let bus = MemoryBus::new();
        bus.ensure_group("dispatcher").await.unwrap();
        bus.ensure_group("workers").await.unwrap();

        bus.publish_event(&json!({"n": 1})).await.unwrap();

        let a = bus
            .consume("dispatcher", "c1", 10, Duration::from_millis(10))
            .await
            .unwrap();
        let b = bus
            .consume("workers", "c1", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[tokio::test]
    async fn test_consumers_in_group_divide_messages() {
        let bus = MemoryBus::new();
        bus.ensure_group("g").await.unwrap();
        for n in 0..4 {
            bus.publish_event(&json!({"n": n})).await.unwrap();
        }

        let first = bus
            .consume("g", "c1", 2, Duration::from_millis(10))
            .await
            .unwrap();
        let second = bus
            .consume("g", "c2", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_ne!(first[0].stream_id, second[0].stream_id);
    }

    #[tokio::test]
    async fn test_unacked_message_is_redelivered() {
        let bus = MemoryBus::new().with_redelivery_idle(Duration::from_millis(20));
        bus.ensure_group("g").await.unwrap();
        bus.publish_event(&json!({"n": 1})).await.unwrap();

        let first = bus
            .consume("g", "c1", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let again = bus
            .consume("g", "c1", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].stream_id, first[0].stream_id);
    }

    #[tokio::test]
    async fn test_lock_holder_semantics() {
        let bus = MemoryBus::new();
        assert!(bus
            .try_acquire("incident:1", "a", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(!bus
            .try_acquire("incident:1", "b", Duration::from_secs(5))
            .await
            .unwrap());
        // Re-entrant for the same holder.
        assert!(bus
            .try_acquire("incident:1", "a", Duration::from_secs(5))
            .await
            .unwrap());

        // Release by the wrong holder is a no-op.
        bus.release("incident:1", "b").await.unwrap();
        assert!(!bus
            .try_acquire("incident:1", "b", Duration::from_secs(5))
            .await
            .unwrap());

        bus.release("incident:1", "a").await.unwrap();
        assert!(bus
            .try_acquire("incident:1", "b", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_lock_expires() {
        let bus = MemoryBus::new();
        assert!(bus
            .try_acquire("r", "a", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(bus
            .try_acquire("r", "b", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_token_counter_is_monotonic() {
        let bus = MemoryBus::new();
        let incident = Uuid::new_v4();
        assert_eq!(bus.incr_tokens(incident, 100).await.unwrap(), 100);
        assert_eq!(bus.incr_tokens(incident, 50).await.unwrap(), 150);
        assert_eq!(bus.get_tokens(incident).await.unwrap(), 150);
        assert_eq!(bus.get_tokens(Uuid::new_v4()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_realtime_roundtrip() {
        let bus = MemoryBus::new();
        let mut rx = bus.subscribe_realtime().await.unwrap();

        let tenant = Uuid::new_v4();
        bus.publish_realtime(&RealtimeFrame::new("incident_created", tenant, json!({"x": 1})))
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.event_type, "incident_created");
        assert_eq!(frame.tenant_id, tenant);
    }

    #[tokio::test]
    async fn test_incident_substream_is_bounded() {
        let bus = MemoryBus::new();
        let incident = Uuid::new_v4();
        for n in 0..(INCIDENT_STREAM_MAXLEN + 10) {
            bus.publish_incident_message(incident, &json!({"n": n}))
                .await
                .unwrap();
        }
        let messages = bus.incident_messages(incident, usize::MAX).await.unwrap();
        assert_eq!(messages.len(), INCIDENT_STREAM_MAXLEN);
        assert_eq!(messages[0]["n"], 10);
    }
}
