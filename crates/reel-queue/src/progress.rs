//! Progress events via Redis Pub/Sub.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use redis::AsyncCommands;
use tracing::debug;

use reel_models::{ProgressEvent, TaskId};

use crate::error::QueueResult;

/// Sink for task progress events.
#[async_trait]
pub trait ProgressPublisher: Send + Sync {
    async fn publish(&self, event: &ProgressEvent) -> QueueResult<()>;
}

/// Publisher that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

#[async_trait]
impl ProgressPublisher for NoopPublisher {
    async fn publish(&self, _event: &ProgressEvent) -> QueueResult<()> {
        Ok(())
    }
}

/// Channel for publishing/subscribing to progress events.
pub struct ProgressChannel {
    client: redis::Client,
    prefix: String,
}

impl ProgressChannel {
    /// Create a new progress channel.
    pub fn new(redis_url: &str, prefix: impl Into<String>) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            prefix: prefix.into(),
        })
    }

    /// Get the channel name for a task.
    pub fn channel_name(&self, task_id: &TaskId) -> String {
        format!("{}:progress:{}", self.prefix, task_id)
    }

    /// Subscribe to progress events for a task.
    /// Returns a pinned stream that can be polled with `.next()`.
    pub async fn subscribe(
        &self,
        task_id: &TaskId,
    ) -> QueueResult<Pin<Box<dyn Stream<Item = ProgressEvent> + Send>>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        let channel = self.channel_name(task_id);

        pubsub.subscribe(&channel).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            serde_json::from_str(&payload).ok()
        });

        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl ProgressPublisher for ProgressChannel {
    async fn publish(&self, event: &ProgressEvent) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let channel = self.channel_name(&event.task_id);
        let payload = serde_json::to_string(event)?;

        debug!("Publishing progress event to {}", channel);
        conn.publish::<_, _, ()>(channel, payload).await?;

        Ok(())
    }
}
