//! # Messaging Module
//!
//! Queue transport of the orchestrator. [`QueueClient`] is the transport
//! seam with a pgmq implementation ([`PgmqClient`]) and an in-memory one
//! ([`InMemoryQueue`]); [`MessagePublisher`] maps stages to their queues and
//! wraps payloads in [`Envelope`]s.

pub mod errors;
pub mod in_memory;
pub mod message;
#[cfg(feature = "postgres")]
pub mod pgmq_client;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::config::QueueConfig;
use crate::models::Stage;

pub use errors::{MessagingError, MessagingResult};
pub use in_memory::InMemoryQueue;
pub use message::{Envelope, MessageHeader, OrchestratorMessage, StageRequest};
#[cfg(feature = "postgres")]
pub use pgmq_client::PgmqClient;

/// A message read from a queue and not yet deleted
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub msg_id: i64,
    /// How many times the message has been read, this read included
    pub read_ct: i32,
    pub message: Value,
}

/// Queue operations the orchestrator relies on
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Create the queue if it does not exist yet
    async fn create_queue(&self, queue_name: &str) -> MessagingResult<()>;

    async fn send(&self, queue_name: &str, message: &Value) -> MessagingResult<i64>;

    /// Read up to `limit` visible messages and hide them for
    /// `visibility_timeout_seconds`
    async fn read(
        &self,
        queue_name: &str,
        visibility_timeout_seconds: i32,
        limit: i32,
    ) -> MessagingResult<Vec<QueuedMessage>>;

    async fn delete(&self, queue_name: &str, msg_id: i64) -> MessagingResult<()>;
}

/// Publishes envelopes to the orchestrator queue and the stage queues
#[derive(Clone)]
pub struct MessagePublisher {
    client: Arc<dyn QueueClient>,
    queues: QueueConfig,
}

impl std::fmt::Debug for MessagePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePublisher")
            .field("queues", &self.queues)
            .finish()
    }
}

impl MessagePublisher {
    pub fn new(client: Arc<dyn QueueClient>, queues: QueueConfig) -> Self {
        Self { client, queues }
    }

    pub fn queues(&self) -> &QueueConfig {
        &self.queues
    }

    /// Publish a work request to the queue of `stage`
    #[instrument(skip(self, header), fields(run_id = header.run_id, trace_id = %header.trace_id))]
    pub async fn publish(
        &self,
        stage: Stage,
        request: StageRequest,
        header: &MessageHeader,
    ) -> MessagingResult<i64> {
        let queue_name = self.queues.stage_queue(stage);
        let message = Envelope::new(header.clone(), request).to_json()?;
        let msg_id = self.client.send(&queue_name, &message).await?;
        debug!(queue = %queue_name, msg_id, job_id = request.job_id, "Stage request published");
        Ok(msg_id)
    }

    /// Publish a message to the orchestrator's own queue
    #[instrument(skip(self, header), fields(run_id = header.run_id, message_type = message.message_type()))]
    pub async fn publish_to_orchestrator(
        &self,
        message: OrchestratorMessage,
        header: &MessageHeader,
    ) -> MessagingResult<i64> {
        let envelope = Envelope::new(header.clone(), message).to_json()?;
        self.client
            .send(&self.queues.orchestrator_queue, &envelope)
            .await
    }

    /// Create the orchestrator queue and every stage queue
    pub async fn ensure_queues(&self) -> MessagingResult<()> {
        for queue_name in self.queues.all_queues() {
            self.client.create_queue(&queue_name).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_routes_to_stage_queue() {
        let queue = Arc::new(InMemoryQueue::new());
        let publisher = MessagePublisher::new(queue.clone(), QueueConfig::default());
        let header = MessageHeader::new("trace", 5);

        publisher
            .publish(
                Stage::Scanner,
                StageRequest {
                    stage: Stage::Scanner,
                    job_id: 12,
                },
                &header,
            )
            .await
            .unwrap();

        let messages = queue.messages("scanner_queue");
        assert_eq!(messages.len(), 1);
        let envelope = Envelope::<StageRequest>::from_json(messages[0].clone()).unwrap();
        assert_eq!(envelope.payload.job_id, 12);
        assert_eq!(envelope.header, header);
    }

    #[tokio::test]
    async fn test_ensure_queues_creates_all_queues() {
        let queue = Arc::new(InMemoryQueue::new());
        let publisher = MessagePublisher::new(queue.clone(), QueueConfig::default());

        publisher.ensure_queues().await.unwrap();

        for name in QueueConfig::default().all_queues() {
            assert!(queue.has_queue(&name), "missing queue {name}");
        }
    }
}
