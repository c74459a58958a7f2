//! HORNET: Redis Bus
//!
//! Production backend on Redis: Streams with consumer groups for events,
//! bounded per-incident substreams, SET NX EX locks, INCRBY token counters,
//! and PUBLISH/SUBSCRIBE for the realtime channel.
//!
//! Blocking reads run on a dedicated connection so a waiting consumer never
//! stalls the shared command connection.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::Value;
use uuid::Uuid;

use crate::{
    BusError, BusMessage, EventBus, RealtimeFrame, RealtimeReceiver, EVENTS_STREAM,
    REALTIME_CHANNEL,
};

const INCIDENT_STREAM_PREFIX: &str = "hornet:incident:";
const TOKENS_KEY_PREFIX: &str = "hornet:incident_tokens:";
const LOCK_KEY_PREFIX: &str = "hornet:lock:";
const INCIDENT_STREAM_MAXLEN: usize = 1000;

// Compare-and-delete: a lock may only be removed by its current holder, in
// one atomic step, or an expired holder could delete a lock someone else
// re-acquired between a GET and a DEL.
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        BusError::Operation(err.to_string())
    }
}

/// Redis-backed event bus.
pub struct RedisBus {
    client: redis::Client,
    conn: ConnectionManager,
    consumer_conn: tokio::sync::Mutex<ConnectionManager>,
}

impl RedisBus {
    /// Connect to Redis and open the command and consumer connections.
    pub async fn connect(redis_url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BusError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        let consumer_conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        tracing::info!(redis_url, "event bus connected");
        Ok(Self {
            client,
            conn,
            consumer_conn: tokio::sync::Mutex::new(consumer_conn),
        })
    }

    fn parse_entries(entries: &Value, out: &mut Vec<BusMessage>) {
        let Value::Bulk(items) = entries else {
            return;
        };
        for item in items {
            let Value::Bulk(pair) = item else { continue };
            if pair.len() < 2 {
                continue;
            }
            let Ok(id) = redis::from_redis_value::<String>(&pair[0]) else {
                continue;
            };
            let Value::Bulk(fields) = &pair[1] else {
                continue;
            };
            // Fields come as [name, value, ...]; the payload lives in "data".
            let mut payload = None;
            for chunk in fields.chunks(2) {
                if chunk.len() < 2 {
                    continue;
                }
                let name = redis::from_redis_value::<String>(&chunk[0]).unwrap_or_default();
                if name == "data" {
                    if let Ok(raw) = redis::from_redis_value::<String>(&chunk[1]) {
                        payload = serde_json::from_str(&raw).ok();
                    }
                }
            }
            if let Some(payload) = payload {
                out.push(BusMessage {
                    stream_id: id,
                    payload,
                });
            }
        }
    }

    fn parse_read_reply(reply: Value) -> Vec<BusMessage> {
        let mut out = Vec::new();
        if let Value::Bulk(streams) = reply {
            for stream in streams {
                if let Value::Bulk(pair) = stream {
                    if pair.len() == 2 {
                        Self::parse_entries(&pair[1], &mut out);
                    }
                }
            }
        }
        out
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn ensure_group(&self, group: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let result: Result<String, redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(EVENTS_STREAM)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn publish_event(&self, event: &serde_json::Value) -> Result<String, BusError> {
        let raw = serde_json::to_string(event)
            .map_err(|e| BusError::Serialization(e.to_string()))?;
        let mut conn = self.conn.clone();
        let id: String = redis::cmd("XADD")
            .arg(EVENTS_STREAM)
            .arg("*")
            .arg("data")
            .arg(raw)
            .query_async(&mut conn)
            .await?;
        tracing::debug!(stream = EVENTS_STREAM, message_id = %id, "event published");
        Ok(id)
    }

    async fn consume(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<BusMessage>, BusError> {
        let mut conn = self.consumer_conn.lock().await;
        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(EVENTS_STREAM)
            .arg(">")
            .query_async(&mut *conn)
            .await?;
        Ok(Self::parse_read_reply(reply))
    }

    async fn ack(&self, group: &str, message_id: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(EVENTS_STREAM)
            .arg(group)
            .arg(message_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn publish_incident_message(
        &self,
        incident_id: Uuid,
        message: &serde_json::Value,
    ) -> Result<(), BusError> {
        let raw = serde_json::to_string(message)
            .map_err(|e| BusError::Serialization(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(format!("{INCIDENT_STREAM_PREFIX}{incident_id}"))
            .arg("MAXLEN")
            .arg("~")
            .arg(INCIDENT_STREAM_MAXLEN)
            .arg("*")
            .arg("data")
            .arg(raw)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn incident_messages(
        &self,
        incident_id: Uuid,
        count: usize,
    ) -> Result<Vec<serde_json::Value>, BusError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XRANGE")
            .arg(format!("{INCIDENT_STREAM_PREFIX}{incident_id}"))
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        let mut out = Vec::new();
        Self::parse_entries(&reply, &mut out);
        Ok(out.into_iter().map(|m| m.payload).collect())
    }

    async fn try_acquire(
        &self,
        resource: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, BusError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(format!("{LOCK_KEY_PREFIX}{resource}"))
            .arg(holder)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, resource: &str, holder: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("EVAL")
            .arg(RELEASE_LOCK_SCRIPT)
            .arg(1)
            .arg(format!("{LOCK_KEY_PREFIX}{resource}"))
            .arg(holder)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn incr_tokens(&self, incident_id: Uuid, tokens: i64) -> Result<i64, BusError> {
        let mut conn = self.conn.clone();
        let value: i64 = redis::cmd("INCRBY")
            .arg(format!("{TOKENS_KEY_PREFIX}{incident_id}"))
            .arg(tokens)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn get_tokens(&self, incident_id: Uuid) -> Result<i64, BusError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = redis::cmd("GET")
            .arg(format!("{TOKENS_KEY_PREFIX}{incident_id}"))
            .query_async(&mut conn)
            .await?;
        Ok(value.unwrap_or(0))
    }

    async fn publish_realtime(&self, frame: &RealtimeFrame) -> Result<(), BusError> {
        let raw = serde_json::to_string(frame)
            .map_err(|e| BusError::Serialization(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(REALTIME_CHANNEL)
            .arg(raw)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe_realtime(&self) -> Result<RealtimeReceiver, BusError> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(REALTIME_CHANNEL)
            .await
            .map_err(|e| BusError::Operation(e.to_string()))?;

        let (tx, out) = tokio::sync::mpsc::channel(256);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let Ok(raw) = msg.get_payload::<String>() else {
                    continue;
                };
                match serde_json::from_str::<RealtimeFrame>(&raw) {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "malformed realtime frame dropped"),
                }
            }
        });
        Ok(out)
    }

    async fn queue_depth(&self) -> Result<u64, BusError> {
        let mut conn = self.conn.clone();
        let len: u64 = redis::cmd("XLEN")
            .arg(EVENTS_STREAM)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn pending_count(&self, group: &str) -> Result<u64, BusError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XPENDING")
            .arg(EVENTS_STREAM)
            .arg(group)
            .query_async(&mut conn)
            .await?;
        if let Value::Bulk(summary) = reply {
            if let Some(first) = summary.first() {
                return Ok(redis::from_redis_value::<u64>(first).unwrap_or(0));
            }
        }
        Ok(0)
    }

    async fn health_check(&self) -> bool {
        let mut conn = self.conn.clone();
        let reply: Result<String, redis::RedisError> =
            redis::cmd("PING").query_async(&mut conn).await;
        matches!(reply.as_deref(), Ok("PONG"))
    }
}
