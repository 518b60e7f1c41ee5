//! Redis Streams-backed lifecycle bus (durable, at-least-once delivery).
//!
//! - **Stream Key**: `warden:lifecycle` (one stream for all jobs)
//! - **Consumer Groups**: one per consuming service (e.g. `orchestrator`)
//! - **Consumers**: named members of a group (e.g. `worker-1`)
//! - **Dead-Letter Queue**: `warden:lifecycle:dlq`, for entries redelivered
//!   more than `max_retries` times
//!
//! Entries carry `job_id`, `kind` and `delivery_token` as plain fields next
//! to the JSON `payload`, so they can be inspected with `XRANGE` directly.
//! The Redis entry id becomes the delivery's message id, and a redelivered
//! entry keeps its delivery token, so consumers see it as a physical
//! duplicate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, instrument, warn};

use warden_core::LifecycleEvent;
use warden_events::{Delivery, EventBus, Subscription};

const DEFAULT_STREAM_KEY: &str = "warden:lifecycle";
const DEFAULT_DLQ_KEY: &str = "warden:lifecycle:dlq";
const DEFAULT_GROUP: &str = "orchestrator";

/// Default max redeliveries before sending to DLQ
const DEFAULT_MAX_RETRIES: u32 = 5;

/// Pending entries idle longer than this are claimed for redelivery.
const DEFAULT_PENDING_TIMEOUT_MS: u64 = 60_000;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RedisStreamsEventBus {
    client: Arc<redis::Client>,
    stream_key: String,
    dlq_key: String,
    max_retries: u32,
    pending_timeout_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

/// Entry read from the stream, with its redelivery count.
#[derive(Debug, Clone)]
struct StreamMessage {
    message_id: String,
    event: LifecycleEvent,
    published_at: DateTime<Utc>,
    delivery_count: u32,
}

impl RedisStreamsEventBus {
    /// `redis_url` e.g. "redis://localhost:6379"; keys default to
    /// `warden:lifecycle` and `warden:lifecycle:dlq`.
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_key: Option<String>,
        dlq_key: Option<String>,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            stream_key: stream_key.unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string()),
            dlq_key: dlq_key.unwrap_or_else(|| DEFAULT_DLQ_KEY.to_string()),
            max_retries: DEFAULT_MAX_RETRIES,
            pending_timeout_ms: DEFAULT_PENDING_TIMEOUT_MS,
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn connection(&self) -> Result<redis::Connection, RedisStreamsError> {
        self.client
            .get_connection()
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))
    }

    /// Ensure a consumer group exists (idempotent).
    pub fn ensure_consumer_group(&self, group_name: &str) -> Result<(), RedisStreamsError> {
        let mut conn = self.connection()?;

        // MKSTREAM creates the stream; BUSYGROUP (group exists) is ignored.
        let _: Result<String, _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(group_name)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        Ok(())
    }

    #[instrument(
        skip(self, delivery),
        fields(
            stream_key = %self.stream_key,
            job_id = %delivery.payload().job_id,
            kind = %delivery.payload().kind
        ),
        err
    )]
    fn publish_sync(&self, delivery: &Delivery<LifecycleEvent>) -> Result<(), RedisStreamsError> {
        let event = delivery.payload();
        let payload = serde_json::to_string(event)
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;

        let mut conn = self.connection()?;
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("job_id")
            .arg(event.job_id.to_string())
            .arg("kind")
            .arg(event.kind.as_str())
            .arg("delivery_token")
            .arg(event.delivery_token.as_str())
            .arg("published_at")
            .arg(delivery.published_at().to_rfc3339())
            .arg("payload")
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {}", e)))?;

        Ok(())
    }

    fn acknowledge_sync(
        &self,
        group_name: &str,
        message_ids: &[String],
    ) -> Result<(), RedisStreamsError> {
        if message_ids.is_empty() {
            return Ok(());
        }

        let mut conn = self.connection()?;
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(group_name)
            .arg(message_ids)
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XACK failed: {}", e)))?;

        Ok(())
    }

    fn send_to_dlq_sync(&self, msg: &StreamMessage) -> Result<(), RedisStreamsError> {
        let payload = serde_json::to_string(&msg.event)
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;

        let mut conn = self.connection()?;
        let _: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("original_message_id")
            .arg(&msg.message_id)
            .arg("job_id")
            .arg(msg.event.job_id.to_string())
            .arg("delivery_count")
            .arg(msg.delivery_count.to_string())
            .arg("failed_at")
            .arg(Utc::now().to_rfc3339())
            .arg("payload")
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("DLQ XADD failed: {}", e)))?;

        warn!(
            message_id = %msg.message_id,
            job_id = %msg.event.job_id,
            delivery_count = msg.delivery_count,
            "lifecycle entry sent to dead-letter queue"
        );

        Ok(())
    }

    /// Stalled pending entries first, then new ones.
    fn read_group_sync(
        &self,
        group_name: &str,
        consumer_name: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>, RedisStreamsError> {
        let mut conn = self.connection()?;

        let pending = self.read_pending_sync(&mut conn, group_name, consumer_name, count)?;
        if !pending.is_empty() {
            return Ok(pending);
        }

        self.read_new_sync(&mut conn, group_name, consumer_name, count, block_ms)
    }

    fn read_pending_sync(
        &self,
        conn: &mut redis::Connection,
        group_name: &str,
        consumer_name: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, RedisStreamsError> {
        // XPENDING extended form: (id, consumer, idle_ms, delivery_count)
        let pending_info: redis::RedisResult<Vec<(String, String, u64, u64)>> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(group_name)
            .arg("IDLE")
            .arg(self.pending_timeout_ms.to_string())
            .arg("-")
            .arg("+")
            .arg(count.to_string())
            .query(conn);

        let counts: HashMap<String, u32> = match pending_info {
            Ok(entries) => entries
                .into_iter()
                .map(|(id, _, _, delivered)| (id, u32::try_from(delivered).unwrap_or(u32::MAX)))
                .collect(),
            Err(_) => return Ok(vec![]),
        };

        if counts.is_empty() {
            return Ok(vec![]);
        }

        let ids: Vec<String> = counts.keys().cloned().collect();
        let claimed: redis::RedisResult<Vec<redis::Value>> = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(group_name)
            .arg(consumer_name)
            .arg(self.pending_timeout_ms.to_string())
            .arg(&ids[..])
            .query(conn);

        let claimed_entries = match claimed {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "XCLAIM failed");
                return Ok(vec![]);
            }
        };

        let mut messages = Vec::new();
        for entry in claimed_entries {
            match parse_stream_entry(entry) {
                Ok(mut msg) => {
                    msg.delivery_count = counts.get(&msg.message_id).copied().unwrap_or(1);
                    messages.push(msg);
                }
                Err(e) => warn!(error = %e, "skipping unreadable pending entry"),
            }
        }

        Ok(messages)
    }

    fn read_new_sync(
        &self,
        conn: &mut redis::Connection,
        group_name: &str,
        consumer_name: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>, RedisStreamsError> {
        let result: redis::RedisResult<Option<HashMap<String, Vec<redis::Value>>>> =
            redis::cmd("XREADGROUP")
                .arg("GROUP")
                .arg(group_name)
                .arg(consumer_name)
                .arg("COUNT")
                .arg(count.to_string())
                .arg("BLOCK")
                .arg(block_ms.to_string())
                .arg("STREAMS")
                .arg(&self.stream_key)
                .arg(">")
                .query(conn);

        let stream_data = match result {
            Ok(Some(data)) => data,
            // Nil reply: the block timed out with nothing new.
            Ok(None) => return Ok(vec![]),
            Err(e) => {
                return Err(RedisStreamsError::Command(format!("XREADGROUP failed: {}", e)));
            }
        };

        let entries = stream_data
            .get(&self.stream_key)
            .cloned()
            .unwrap_or_default();

        let mut messages = Vec::new();
        for entry in entries {
            match parse_stream_entry(entry) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!(error = %e, "skipping unreadable stream entry"),
            }
        }

        Ok(messages)
    }

    /// Subscribe as `consumer_name` within `group_name`.
    ///
    /// A background thread polls Redis and forwards deliveries. Entries are
    /// acknowledged once handed to the subscriber; lost handoffs are
    /// reclaimed by another consumer after the pending timeout.
    pub fn subscribe_with_group(
        &self,
        group_name: &str,
        consumer_name: &str,
    ) -> Subscription<Delivery<LifecycleEvent>> {
        if let Err(e) = self.ensure_consumer_group(group_name) {
            error!(group = group_name, error = %e, "failed to create consumer group");
        }

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let bus = self.clone();
        let group = group_name.to_string();
        let consumer = consumer_name.to_string();

        std::thread::spawn(move || {
            loop {
                let messages = match bus.read_group_sync(&group, &consumer, 10, 100) {
                    Ok(messages) => messages,
                    Err(e) => {
                        error!(error = %e, "failed to read from lifecycle stream");
                        std::thread::sleep(POLL_INTERVAL);
                        continue;
                    }
                };

                let mut handled = Vec::with_capacity(messages.len());
                for msg in messages {
                    if msg.delivery_count > bus.max_retries {
                        if let Err(e) = bus.send_to_dlq_sync(&msg) {
                            error!(error = %e, "failed to send entry to DLQ");
                            continue;
                        }
                    } else {
                        let delivery = Delivery::new(msg.message_id.clone(), msg.published_at, msg.event)
                            .with_attempt(msg.delivery_count.max(1));
                        if tx.send(delivery).is_err() {
                            return; // Receiver dropped
                        }
                    }
                    handled.push(msg.message_id);
                }

                if let Err(e) = bus.acknowledge_sync(&group, &handled) {
                    error!(error = %e, "failed to acknowledge lifecycle entries");
                }

                std::thread::sleep(POLL_INTERVAL);
            }
        });

        Subscription::new(rx)
    }
}

/// Entry format: `[message_id, [field1, value1, field2, value2, ...]]`.
fn parse_stream_entry(entry: redis::Value) -> Result<StreamMessage, RedisStreamsError> {
    let entry_vec: Vec<redis::Value> = match entry {
        redis::Value::Bulk(v) => v,
        _ => return Err(RedisStreamsError::Deserialization("Invalid entry format".to_string())),
    };

    if entry_vec.len() < 2 {
        return Err(RedisStreamsError::Deserialization("Entry too short".to_string()));
    }

    let message_id = match &entry_vec[0] {
        redis::Value::Data(data) => String::from_utf8_lossy(data).to_string(),
        _ => {
            return Err(RedisStreamsError::Deserialization(
                "Invalid message ID format".to_string(),
            ));
        }
    };

    let fields_vec = match &entry_vec[1] {
        redis::Value::Bulk(v) => v,
        _ => return Err(RedisStreamsError::Deserialization("Invalid fields format".to_string())),
    };

    let mut fields = HashMap::new();
    for chunk in fields_vec.chunks(2) {
        if let [redis::Value::Data(key), redis::Value::Data(value)] = chunk {
            fields.insert(
                String::from_utf8_lossy(key).to_string(),
                String::from_utf8_lossy(value).to_string(),
            );
        }
    }

    let payload = fields
        .get("payload")
        .ok_or_else(|| RedisStreamsError::Deserialization("Missing payload field".to_string()))?;
    let event: LifecycleEvent = serde_json::from_str(payload)
        .map_err(|e| RedisStreamsError::Deserialization(format!("Invalid payload: {}", e)))?;

    let published_at = fields
        .get("published_at")
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(StreamMessage {
        message_id,
        event,
        published_at,
        delivery_count: 1,
    })
}

impl EventBus<Delivery<LifecycleEvent>> for RedisStreamsEventBus {
    type Error = RedisStreamsError;

    fn publish(&self, message: Delivery<LifecycleEvent>) -> Result<(), Self::Error> {
        self.publish_sync(&message)
    }

    fn subscribe(&self) -> Subscription<Delivery<LifecycleEvent>> {
        self.subscribe_with_group(
            DEFAULT_GROUP,
            &format!("consumer-{}", uuid::Uuid::now_v7()),
        )
    }
}
