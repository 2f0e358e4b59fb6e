//! Retry of whole units of work aborted by serialization conflicts

use std::future::Future;
use tracing::warn;

use crate::config::OrchestrationConfig;
use crate::error::{OrchestratorError, Result};
use crate::metrics;

/// Run `attempt` until it succeeds, fails with a non-retryable error, or the
/// configured number of attempts is used up.
///
/// Every call of `attempt` must open and finish its own transaction, so a
/// retry always starts from freshly loaded state.
pub async fn with_retries<T, F, Fut>(
    config: &OrchestrationConfig,
    operation: &str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.transaction_attempts.max(1);
    let mut attempt_number = 1;

    loop {
        match attempt().await {
            Err(err) if err.is_retryable() => {
                metrics::transaction_conflicts_total().add(1, &[]);
                if attempt_number >= max_attempts {
                    return Err(OrchestratorError::ConflictRetriesExhausted {
                        attempts: max_attempts,
                        reason: err.to_string(),
                    });
                }

                let backoff = config.retry_backoff(attempt_number);
                warn!(
                    operation,
                    attempt = attempt_number,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Transaction conflict, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt_number += 1;
            }
            other => return other,
        }
    }
}
