//! # Message Structures
//!
//! Wire formats of the orchestrator queues. Every message is an
//! [`Envelope`]: a [`MessageHeader`] carrying the run correlation data and a
//! typed payload.
//!
//! ```json
//! {
//!   "header": {"trace_id": "…", "run_id": 42, "labels": {"region": "eu"}},
//!   "payload": {"type": "stage_result", "data": {"stage": "analyzer", "job_id": 7, "has_issues": false}}
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use super::errors::{MessagingError, MessagingResult};
use crate::models::{Run, Stage};

/// Correlation data copied from the run onto every message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub trace_id: String,
    pub run_id: i64,
    /// Transport routing hints copied from the run
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl MessageHeader {
    pub fn new(trace_id: impl Into<String>, run_id: i64) -> Self {
        Self {
            trace_id: trace_id.into(),
            run_id,
            labels: HashMap::new(),
        }
    }

    /// Header for messages about `run`; a fresh trace id is generated when
    /// the run has none
    pub fn for_run(run: &Run) -> Self {
        Self {
            trace_id: run
                .trace_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            run_id: run.id,
            labels: run.labels.clone(),
        }
    }

    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels = labels;
        self
    }
}

/// A header and a typed payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub header: MessageHeader,
    pub payload: T,
}

impl<T: Serialize> Envelope<T> {
    pub fn new(header: MessageHeader, payload: T) -> Self {
        Self { header, payload }
    }

    pub fn to_json(&self) -> MessagingResult<Value> {
        serde_json::to_value(self).map_err(|e| MessagingError::MessageSerialization {
            message: e.to_string(),
        })
    }
}

impl<T: for<'de> Deserialize<'de>> Envelope<T> {
    pub fn from_json(value: Value) -> MessagingResult<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Messages consumed by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OrchestratorMessage {
    /// A new run was stored and waits for its first jobs
    RunCreated { run_id: i64 },
    /// A worker finished a job, possibly with issues
    StageResult {
        stage: Stage,
        job_id: i64,
        has_issues: bool,
    },
    /// A worker reports that the job itself failed
    StageError {
        stage: Stage,
        job_id: i64,
        message: String,
    },
    /// A worker process could not run the job of `stage` for `run_id`
    WorkerInfrastructureError { stage: Stage, run_id: i64 },
}

impl OrchestratorMessage {
    /// Get a string representation of the message type for logging
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::RunCreated { .. } => "run_created",
            Self::StageResult { .. } => "stage_result",
            Self::StageError { .. } => "stage_error",
            Self::WorkerInfrastructureError { .. } => "worker_infrastructure_error",
        }
    }

    /// The stage the message reports on, if any
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::RunCreated { .. } => None,
            Self::StageResult { stage, .. }
            | Self::StageError { stage, .. }
            | Self::WorkerInfrastructureError { stage, .. } => Some(*stage),
        }
    }
}

/// Work request published to the queue of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRequest {
    pub stage: Stage,
    pub job_id: i64,
}
