//! # In-Memory Queue
//!
//! [`QueueClient`] kept in process memory, with the visibility timeout
//! semantics of pgmq. Send failures can be injected to simulate an
//! unavailable transport.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, warn};

use super::errors::{MessagingError, MessagingResult};
use super::{QueueClient, QueuedMessage};

#[derive(Debug, Clone)]
struct StoredMessage {
    msg_id: i64,
    read_ct: i32,
    visible_at: DateTime<Utc>,
    message: Value,
}

#[derive(Debug, Default)]
pub struct InMemoryQueue {
    queues: DashMap<String, Vec<StoredMessage>>,
    last_msg_id: AtomicI64,
    send_failures: Mutex<usize>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` sends fail
    pub fn fail_next_sends(&self, count: usize) {
        *self.send_failures.lock() += count;
    }

    pub fn has_queue(&self, queue_name: &str) -> bool {
        self.queues.contains_key(queue_name)
    }

    /// Every message still in the queue, visible or not, oldest first
    pub fn messages(&self, queue_name: &str) -> Vec<Value> {
        self.queues
            .get(queue_name)
            .map(|messages| messages.iter().map(|m| m.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self, queue_name: &str) -> usize {
        self.queues
            .get(queue_name)
            .map(|messages| messages.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, queue_name: &str) -> bool {
        self.len(queue_name) == 0
    }

    /// Remove and return every message of the queue
    pub fn drain(&self, queue_name: &str) -> Vec<Value> {
        self.queues
            .get_mut(queue_name)
            .map(|mut messages| {
                let drained: Vec<Value> = messages.drain(..).map(|m| m.message).collect();
                drained
            })
            .unwrap_or_default()
    }

    fn take_send_failure(&self) -> bool {
        let mut remaining = self.send_failures.lock();
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn create_queue(&self, queue_name: &str) -> MessagingResult<()> {
        self.queues.entry(queue_name.to_string()).or_default();
        Ok(())
    }

    async fn send(&self, queue_name: &str, message: &Value) -> MessagingResult<i64> {
        if self.take_send_failure() {
            warn!(queue = %queue_name, "Injected send failure");
            return Err(MessagingError::queue_operation(
                queue_name,
                "send",
                "transport unavailable",
            ));
        }

        let msg_id = self.last_msg_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.queues
            .entry(queue_name.to_string())
            .or_default()
            .push(StoredMessage {
                msg_id,
                read_ct: 0,
                visible_at: Utc::now(),
                message: message.clone(),
            });
        debug!(queue = %queue_name, msg_id, "Message queued");
        Ok(msg_id)
    }

    async fn read(
        &self,
        queue_name: &str,
        visibility_timeout_seconds: i32,
        limit: i32,
    ) -> MessagingResult<Vec<QueuedMessage>> {
        let Some(mut messages) = self.queues.get_mut(queue_name) else {
            return Err(MessagingError::queue_not_found(queue_name));
        };

        let now = Utc::now();
        let hidden_until = now + Duration::seconds(i64::from(visibility_timeout_seconds));
        let limit = usize::try_from(limit).unwrap_or(0);

        Ok(messages
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .take(limit)
            .map(|m| {
                m.read_ct += 1;
                m.visible_at = hidden_until;
                QueuedMessage {
                    msg_id: m.msg_id,
                    read_ct: m.read_ct,
                    message: m.message.clone(),
                }
            })
            .collect())
    }

    async fn delete(&self, queue_name: &str, msg_id: i64) -> MessagingResult<()> {
        let mut messages = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;
        messages.retain(|m| m.msg_id != msg_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_read_hides_messages_until_visibility_timeout() {
        let queue = InMemoryQueue::new();
        queue.create_queue("q").await.unwrap();
        queue.send("q", &json!({"n": 1})).await.unwrap();

        let first = queue.read("q", 30, 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].read_ct, 1);
        assert!(queue.read("q", 30, 10).await.unwrap().is_empty());

        queue.delete("q", first[0].msg_id).await.unwrap();
        assert!(queue.is_empty("q"));
    }

    #[tokio::test]
    async fn test_zero_visibility_timeout_redelivers() {
        let queue = InMemoryQueue::new();
        queue.send("q", &json!(1)).await.unwrap();

        queue.read("q", 0, 1).await.unwrap();
        let again = queue.read("q", 0, 1).await.unwrap();
        assert_eq!(again[0].read_ct, 2);
    }

    #[tokio::test]
    async fn test_injected_send_failures() {
        let queue = InMemoryQueue::new();
        queue.fail_next_sends(1);

        assert!(queue.send("q", &json!(1)).await.is_err());
        assert!(queue.send("q", &json!(2)).await.is_ok());
        assert_eq!(queue.messages("q"), vec![json!(2)]);
    }

    #[tokio::test]
    async fn test_read_from_missing_queue() {
        let queue = InMemoryQueue::new();
        let err = queue.read("missing", 30, 1).await.unwrap_err();
        assert_eq!(err, MessagingError::queue_not_found("missing"));
    }
}
