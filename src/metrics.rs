//! # Orchestration Metrics
//!
//! OpenTelemetry instruments for the orchestrator. Instruments are created
//! from the global meter provider, so nothing is exported until the host
//! process installs one.
//!
//! ```rust
//! use orchestrator_core::metrics::*;
//! use opentelemetry::KeyValue;
//!
//! jobs_created_total().add(1, &[KeyValue::new("stage", "analyzer")]);
//! ```

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

use crate::models::Stage;

/// Lazy-initialized meter for orchestration metrics
static ORCHESTRATOR_METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    ORCHESTRATOR_METER.get_or_init(|| opentelemetry::global::meter_provider().meter("orchestrator"))
}

/// Attribute set naming a stage
pub fn stage_attributes(stage: Stage) -> [KeyValue; 1] {
    [KeyValue::new("stage", stage.as_str())]
}

// Counters

/// Inbound messages handled
///
/// Labels:
/// - message_type: run_created, stage_result, stage_error, worker_infrastructure_error
/// - outcome: ok, not_found, error
pub fn messages_handled_total() -> Counter<u64> {
    meter()
        .u64_counter("orchestrator.messages.handled.total")
        .with_description("Total number of inbound messages handled")
        .build()
}

/// Job rows created
///
/// Labels:
/// - stage
pub fn jobs_created_total() -> Counter<u64> {
    meter()
        .u64_counter("orchestrator.jobs.created.total")
        .with_description("Total number of jobs created")
        .build()
}

/// Jobs whose work request was published and which were marked SCHEDULED
///
/// Labels:
/// - stage
pub fn jobs_scheduled_total() -> Counter<u64> {
    meter()
        .u64_counter("orchestrator.jobs.scheduled.total")
        .with_description("Total number of jobs scheduled")
        .build()
}

/// Work requests that could not be published after commit
///
/// Labels:
/// - stage
pub fn publish_failures_total() -> Counter<u64> {
    meter()
        .u64_counter("orchestrator.publish.failures.total")
        .with_description("Total number of failed work request publishes")
        .build()
}

/// Serializable transactions aborted by a conflict and retried
pub fn transaction_conflicts_total() -> Counter<u64> {
    meter()
        .u64_counter("orchestrator.transactions.conflicts.total")
        .with_description("Total number of transaction conflicts")
        .build()
}

/// Runs reaching a terminal status
///
/// Labels:
/// - status: FAILED, FINISHED, FINISHED_WITH_ISSUES
pub fn runs_completed_total() -> Counter<u64> {
    meter()
        .u64_counter("orchestrator.runs.completed.total")
        .with_description("Total number of runs reaching a terminal status")
        .build()
}

/// Jobs recovered by the lost job sweeper
///
/// Labels:
/// - stage
/// - action: republished, failed
pub fn lost_jobs_recovered_total() -> Counter<u64> {
    meter()
        .u64_counter("orchestrator.lost_jobs.recovered.total")
        .with_description("Total number of lost jobs republished or failed")
        .build()
}

// Histograms

/// Time to handle one inbound message, retries included, in milliseconds
///
/// Labels:
/// - message_type
pub fn message_handling_duration() -> Histogram<f64> {
    meter()
        .f64_histogram("orchestrator.message.handling.duration")
        .with_description("Message handling duration in milliseconds")
        .with_unit("ms")
        .build()
}
