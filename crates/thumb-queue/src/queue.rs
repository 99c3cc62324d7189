//! Job bus over Redis Streams consumer groups.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use thumb_models::{FailureClass, JobEnvelope};

use crate::error::{QueueError, QueueResult};

/// Field holding the JSON payload in every stream entry.
pub const PAYLOAD_FIELD: &str = "job";

/// TTL for per-message retry counters.
const RETRY_COUNTER_TTL_SECS: i64 = 86_400;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub redis_url: String,
    /// Stream jobs are consumed from
    pub stream_name: String,
    pub consumer_group: String,
    /// Dead letter stream
    pub dlq_stream_name: String,
    /// Redeliveries allowed before a retryable failure is dead-lettered
    pub max_retries: u32,
    pub lifecycle_stream: String,
    pub done_stream: String,
    /// Approximate cap on event stream length
    pub events_max_len: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_name: "thumbnailer:jobs".to_string(),
            consumer_group: "thumbnailer:workers".to_string(),
            dlq_stream_name: "thumbnailer:dlq".to_string(),
            max_retries: 3,
            lifecycle_stream: "thumbnailer:lifecycle".to_string(),
            done_stream: "thumbnailer:done".to_string(),
            events_max_len: 100_000,
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str, default: String| std::env::var(name).unwrap_or(default);
        Self {
            redis_url: var("REDIS_URL", defaults.redis_url),
            stream_name: var("QUEUE_STREAM", defaults.stream_name),
            consumer_group: var("QUEUE_CONSUMER_GROUP", defaults.consumer_group),
            dlq_stream_name: var("QUEUE_DLQ_STREAM", defaults.dlq_stream_name),
            max_retries: std::env::var("QUEUE_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
            lifecycle_stream: var("EVENTS_LIFECYCLE_STREAM", defaults.lifecycle_stream),
            done_stream: var("EVENTS_DONE_STREAM", defaults.done_stream),
            events_max_len: std::env::var("EVENTS_MAX_LEN")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.events_max_len),
        }
    }
}

/// One message read from the job stream.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: String,
    /// Raw payload as published
    pub raw: String,
    /// Decoded envelope, or the decode error
    pub envelope: Result<JobEnvelope, String>,
}

impl Delivery {
    fn from_entry(entry: &redis::streams::StreamId) -> Self {
        let raw = match entry.map.get(PAYLOAD_FIELD) {
            Some(redis::Value::BulkString(bytes)) => String::from_utf8_lossy(bytes).to_string(),
            Some(redis::Value::SimpleString(s)) => s.clone(),
            _ => String::new(),
        };
        let envelope = if raw.is_empty() {
            Err(format!("message has no '{}' field", PAYLOAD_FIELD))
        } else {
            serde_json::from_str::<JobEnvelope>(&raw).map_err(|e| e.to_string())
        };
        Self {
            message_id: entry.id.clone(),
            raw,
            envelope,
        }
    }
}

/// Publishes job envelopes onto the bus.
#[async_trait]
pub trait JobPublisher: Send + Sync {
    /// Returns the bus message id.
    async fn publish_job(&self, envelope: &JobEnvelope) -> QueueResult<String>;
}

/// Consumer-group job queue.
pub struct JobQueue {
    client: redis::Client,
    conn: OnceCell<MultiplexedConnection>,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            config,
        })
    }

    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub(crate) async fn connection(&self) -> QueueResult<MultiplexedConnection> {
        let conn = self
            .conn
            .get_or_try_init(|| self.client.get_multiplexed_async_connection())
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        Ok(conn.clone())
    }

    /// Create the consumer group if it does not exist.
    pub async fn init(&self) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group: {}", self.config.consumer_group),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", self.config.consumer_group);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    /// Read up to `count` new messages for this consumer, blocking up to `block_ms`.
    pub async fn consume(&self, consumer_name: &str, block_ms: u64, count: usize) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.connection().await?;

        let reply: Option<redis::streams::StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let deliveries: Vec<Delivery> = reply
            .map(|r| r.keys)
            .unwrap_or_default()
            .iter()
            .flat_map(|key| key.ids.iter().map(Delivery::from_entry))
            .collect();

        if !deliveries.is_empty() {
            debug!("Consumed {} messages from {}", deliveries.len(), self.config.stream_name);
        }
        Ok(deliveries)
    }

    /// Take over messages idle longer than `min_idle_ms` (crashed consumers).
    pub async fn claim_pending(&self, consumer_name: &str, min_idle_ms: u64, count: usize) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.connection().await?;

        let pending: redis::streams::StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        let idle_ids: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms as u64 >= min_idle_ms)
            .map(|p| p.id)
            .collect();

        if idle_ids.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: redis::streams::StreamClaimReply = redis::cmd("XCLAIM")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg(min_idle_ms)
            .arg(&idle_ids)
            .query_async(&mut conn)
            .await?;

        let deliveries: Vec<Delivery> = claimed.ids.iter().map(Delivery::from_entry).collect();
        for delivery in &deliveries {
            info!("Claimed pending message {}", delivery.message_id);
        }
        Ok(deliveries)
    }

    /// Acknowledge and delete a message.
    pub async fn ack(&self, message_id: &str) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        redis::cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        redis::cmd("XDEL")
            .arg(&self.config.stream_name)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        let _: () = conn.del(retry_key(message_id)).await?;

        debug!("Acknowledged message: {}", message_id);
        Ok(())
    }

    /// Copy a message to the dead letter stream, then acknowledge it.
    pub async fn dead_letter(&self, delivery: &Delivery, class: FailureClass, error: &str) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        redis::cmd("XADD")
            .arg(&self.config.dlq_stream_name)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(&delivery.raw)
            .arg("error")
            .arg(error)
            .arg("failure_type")
            .arg(class.as_str())
            .arg("original_id")
            .arg(&delivery.message_id)
            .query_async::<()>(&mut conn)
            .await?;

        self.ack(&delivery.message_id).await?;

        warn!(
            message_id = %delivery.message_id,
            failure_type = %class,
            "Moved message to DLQ: {}",
            error
        );
        Ok(())
    }

    pub async fn increment_retry(&self, message_id: &str) -> QueueResult<u32> {
        let mut conn = self.connection().await?;
        let key = retry_key(message_id);
        let count: u32 = conn.incr(&key, 1).await?;
        conn.expire::<_, ()>(&key, RETRY_COUNTER_TTL_SECS).await?;
        Ok(count)
    }

    pub async fn len(&self) -> QueueResult<u64> {
        let mut conn = self.connection().await?;
        Ok(conn.xlen(&self.config.stream_name).await?)
    }

    pub async fn dlq_len(&self) -> QueueResult<u64> {
        let mut conn = self.connection().await?;
        Ok(conn.xlen(&self.config.dlq_stream_name).await?)
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }
}

fn retry_key(message_id: &str) -> String {
    format!("thumbnailer:retry:{}", message_id)
}

#[async_trait]
impl JobPublisher for JobQueue {
    async fn publish_job(&self, envelope: &JobEnvelope) -> QueueResult<String> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(envelope)?;

        let message_id: String = redis::cmd("XADD")
            .arg(&self.config.stream_name)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(&payload)
            .query_async(&mut conn)
            .await?;

        debug!(job_id = %envelope.job_id, "Published job as {}", message_id);
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use thumb_models::ContentId;

    fn entry(fields: Vec<(&str, redis::Value)>) -> redis::streams::StreamId {
        let mut map = HashMap::new();
        for (k, v) in fields {
            map.insert(k.to_string(), v);
        }
        redis::streams::StreamId {
            id: "1-0".to_string(),
            map,
        }
    }

    #[test]
    fn test_delivery_decodes_envelope() {
        let envelope = JobEnvelope::for_content(&ContentId::new(), Some("small"));
        let raw = serde_json::to_string(&envelope).unwrap();
        let delivery = Delivery::from_entry(&entry(vec![(
            PAYLOAD_FIELD,
            redis::Value::BulkString(raw.into_bytes()),
        )]));
        assert_eq!(delivery.message_id, "1-0");
        assert_eq!(delivery.envelope.unwrap(), envelope);
    }

    #[test]
    fn test_delivery_keeps_decode_error() {
        let delivery = Delivery::from_entry(&entry(vec![(
            PAYLOAD_FIELD,
            redis::Value::BulkString(b"{not json".to_vec()),
        )]));
        assert!(delivery.envelope.is_err());
        assert_eq!(delivery.raw, "{not json");

        let delivery = Delivery::from_entry(&entry(vec![]));
        assert!(delivery.envelope.unwrap_err().contains("no 'job' field"));
    }

    #[test]
    fn test_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.stream_name, "thumbnailer:jobs");
        assert_eq!(config.consumer_group, "thumbnailer:workers");
        assert_eq!(config.max_retries, 3);
    }
}
