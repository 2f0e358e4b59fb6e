//! # Message Processor
//!
//! Consume loop of the orchestrator queue. Each polling cycle reads a batch of
//! envelopes, hands them to the [`Orchestrator`] one by one and acknowledges
//! them according to the outcome:
//!
//! | Outcome                         | Acknowledged |
//! |---------------------------------|--------------|
//! | handled                         | yes          |
//! | undecodable envelope            | yes          |
//! | run or job not found            | yes          |
//! | any other error                 | no           |
//!
//! Unacknowledged messages become visible again once their visibility timeout
//! expires and are redelivered by the queue.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::orchestrator::Orchestrator;
use crate::config::OrchestrationConfig;
use crate::error::Result;
use crate::messaging::{Envelope, OrchestratorMessage, QueueClient, QueuedMessage};
use crate::store::Store;

/// Pause after a failed batch read
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Counts of one processed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub read: usize,
    pub handled: usize,
    /// Acknowledged without being handled: undecodable or referring to missing data
    pub dropped: usize,
    /// Left on the queue for redelivery
    pub unacknowledged: usize,
}

enum Disposition {
    Handled,
    Dropped,
    Retry,
}

pub struct MessageProcessor<S: Store> {
    orchestrator: Arc<Orchestrator<S>>,
    client: Arc<dyn QueueClient>,
    queue_name: String,
    config: OrchestrationConfig,
}

impl<S: Store> std::fmt::Debug for MessageProcessor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageProcessor")
            .field("queue_name", &self.queue_name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: Store> MessageProcessor<S> {
    /// Processor of the orchestrator queue named in the publisher's configuration
    pub fn new(orchestrator: Arc<Orchestrator<S>>, client: Arc<dyn QueueClient>) -> Self {
        let queue_name = orchestrator.publisher().queues().orchestrator_queue.clone();
        let config = orchestrator.config().clone();
        Self {
            orchestrator,
            client,
            queue_name,
            config,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Poll until `shutdown` turns true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            queue = %self.queue_name,
            batch_size = self.config.batch_size,
            polling_interval_ms = self.config.polling_interval_ms,
            "Starting message processor"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.process_batch().await {
                Ok(report) if report.read > 0 => {
                    debug!(?report, "Batch processed");
                    // Keep draining while the queue has work
                    Duration::ZERO
                }
                Ok(_) => self.config.polling_interval(),
                Err(err) => {
                    error!(error = %err, queue = %self.queue_name, "Reading batch failed");
                    ERROR_BACKOFF
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(queue = %self.queue_name, "Message processor stopped");
    }

    /// Read and process one batch
    pub async fn process_batch(&self) -> Result<BatchReport> {
        let messages = self
            .client
            .read(
                &self.queue_name,
                self.config.visibility_timeout_seconds,
                self.config.batch_size,
            )
            .await?;

        let mut report = BatchReport {
            read: messages.len(),
            ..BatchReport::default()
        };

        for queued in messages {
            let msg_id = queued.msg_id;
            match self.process_message(queued).await {
                Disposition::Handled => {
                    self.acknowledge(msg_id).await;
                    report.handled += 1;
                }
                Disposition::Dropped => {
                    self.acknowledge(msg_id).await;
                    report.dropped += 1;
                }
                Disposition::Retry => report.unacknowledged += 1,
            }
        }

        Ok(report)
    }

    async fn process_message(&self, queued: QueuedMessage) -> Disposition {
        let envelope = match Envelope::<OrchestratorMessage>::from_json(queued.message) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(msg_id = queued.msg_id, error = %err, "Dropping undecodable message");
                return Disposition::Dropped;
            }
        };

        match self.orchestrator.handle(&envelope).await {
            Ok(outcome) => {
                debug!(
                    msg_id = queued.msg_id,
                    run_id = outcome.run_id,
                    run_status = %outcome.run_status,
                    created = outcome.created.len(),
                    "Message handled"
                );
                Disposition::Handled
            }
            Err(err) if err.is_not_found() => Disposition::Dropped,
            Err(err) => {
                error!(
                    msg_id = queued.msg_id,
                    read_ct = queued.read_ct,
                    error = %err,
                    "Message left for redelivery"
                );
                Disposition::Retry
            }
        }
    }

    async fn acknowledge(&self, msg_id: i64) {
        if let Err(err) = self.client.delete(&self.queue_name, msg_id).await {
            // The message comes back after its visibility timeout; handling is idempotent
            warn!(msg_id, error = %err, "Could not acknowledge message");
        }
    }
}
