//! Lifecycle and completion event publishing.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use thumb_models::{CompletionEvent, LifecycleEvent};

use crate::error::{QueueError, QueueResult};
use crate::queue::{JobQueue, QueueConfig};

/// Field holding the JSON event in event stream entries.
pub const EVENT_FIELD: &str = "event";

/// Sink for job progress and completion events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_lifecycle(&self, event: &LifecycleEvent) -> QueueResult<()>;

    async fn publish_completion(&self, event: &CompletionEvent) -> QueueResult<()>;
}

/// Appends events to capped Redis streams.
pub struct RedisEventPublisher {
    queue: JobQueue,
}

impl RedisEventPublisher {
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        Ok(Self {
            queue: JobQueue::new(config)?,
        })
    }

    async fn append<T: Serialize + Sync>(&self, stream: &str, kind: &str, event: &T) -> QueueResult<()> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.queue.connection().await?;

        let id: Option<String> = redis::cmd("XADD")
            .arg(stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.queue.config().events_max_len)
            .arg("*")
            .arg("type")
            .arg(kind)
            .arg(EVENT_FIELD)
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(stream = %stream, "Failed to publish {} event: {}", kind, e);
                QueueError::Redis(e)
            })?;

        match id {
            Some(id) => {
                debug!(stream = %stream, "Published {} event {}", kind, id);
                Ok(())
            }
            None => Err(QueueError::publish_failed(format!("XADD to {} returned no id", stream))),
        }
    }
}

#[async_trait]
impl EventPublisher for RedisEventPublisher {
    async fn publish_lifecycle(&self, event: &LifecycleEvent) -> QueueResult<()> {
        let stream = self.queue.config().lifecycle_stream.clone();
        self.append(&stream, event.stage.as_str(), event).await
    }

    async fn publish_completion(&self, event: &CompletionEvent) -> QueueResult<()> {
        let stream = self.queue.config().done_stream.clone();
        self.append(&stream, "done", event).await
    }
}
