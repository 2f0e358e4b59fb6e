//! # pgmq Client
//!
//! [`QueueClient`] on the pgmq Postgres extension through the `pgmq` crate,
//! sharing the application's connection pool.

use async_trait::async_trait;
use pgmq::{types::Message, PGMQueue};
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, info, instrument};

use super::errors::{MessagingError, MessagingResult};
use super::{QueueClient, QueuedMessage};

#[derive(Debug, Clone)]
pub struct PgmqClient {
    pgmq: PGMQueue,
}

impl PgmqClient {
    pub async fn new_with_pool(pool: PgPool) -> Self {
        let pgmq = PGMQueue::new_with_pool(pool).await;
        Self { pgmq }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pgmq.connection
    }
}

impl From<Message<Value>> for QueuedMessage {
    fn from(message: Message<Value>) -> Self {
        Self {
            msg_id: message.msg_id,
            read_ct: message.read_ct,
            message: message.message,
        }
    }
}

#[async_trait]
impl QueueClient for PgmqClient {
    #[instrument(skip(self))]
    async fn create_queue(&self, queue_name: &str) -> MessagingResult<()> {
        self.pgmq
            .create(queue_name)
            .await
            .map_err(|e| MessagingError::pgmq(queue_name, "create", e))?;
        info!(queue = %queue_name, "Queue ready");
        Ok(())
    }

    async fn send(&self, queue_name: &str, message: &Value) -> MessagingResult<i64> {
        let msg_id = self
            .pgmq
            .send(queue_name, message)
            .await
            .map_err(|e| MessagingError::pgmq(queue_name, "send", e))?;
        debug!(queue = %queue_name, msg_id, "Message sent");
        Ok(msg_id)
    }

    async fn read(
        &self,
        queue_name: &str,
        visibility_timeout_seconds: i32,
        limit: i32,
    ) -> MessagingResult<Vec<QueuedMessage>> {
        let messages = self
            .pgmq
            .read_batch::<Value>(queue_name, Some(visibility_timeout_seconds), limit)
            .await
            .map_err(|e| MessagingError::pgmq(queue_name, "read", e))?
            .unwrap_or_default();

        Ok(messages.into_iter().map(QueuedMessage::from).collect())
    }

    async fn delete(&self, queue_name: &str, msg_id: i64) -> MessagingResult<()> {
        self.pgmq
            .delete(queue_name, msg_id)
            .await
            .map_err(|e| MessagingError::pgmq(queue_name, "delete", e))?;
        debug!(queue = %queue_name, msg_id, "Message deleted");
        Ok(())
    }
}
