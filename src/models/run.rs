//! # Run Model
//!
//! One execution of the pipeline against one repository revision.
//!
//! ## Database Schema
//!
//! Maps to the `runs` table:
//! ```sql
//! CREATE TABLE runs (
//!   id BIGSERIAL PRIMARY KEY,
//!   repository_id BIGINT NOT NULL,
//!   revision TEXT NOT NULL,
//!   status TEXT NOT NULL,
//!   job_configs JSONB NOT NULL,
//!   trace_id TEXT,
//!   labels JSONB NOT NULL,
//!   created_at TIMESTAMPTZ NOT NULL,
//!   finished_at TIMESTAMPTZ
//! );
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::job_configurations::JobConfigurations;
use crate::state_machine::RunStatus;

/// A persisted pipeline run.
///
/// Once `status` is terminal it never changes again and `finished_at` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub repository_id: i64,
    pub revision: String,
    pub status: RunStatus,
    pub job_configs: JobConfigurations,
    /// Correlation id propagated to every message of the run
    pub trace_id: Option<String>,
    /// Transport routing hints copied into message headers
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Attributes of a run about to be created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRun {
    pub repository_id: i64,
    pub revision: String,
    pub job_configs: JobConfigurations,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl NewRun {
    pub fn new(
        repository_id: i64,
        revision: impl Into<String>,
        job_configs: JobConfigurations,
    ) -> Self {
        Self {
            repository_id,
            revision: revision.into(),
            job_configs,
            trace_id: None,
            labels: HashMap::new(),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Status patch for a run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunUpdate {
    pub status: RunStatus,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunUpdate {
    /// Patch moving a run to a non-terminal status
    pub fn status(status: RunStatus) -> Self {
        Self {
            status,
            finished_at: None,
        }
    }

    /// Patch moving a run to a terminal status at `finished_at`
    pub fn finished(status: RunStatus, finished_at: DateTime<Utc>) -> Self {
        Self {
            status,
            finished_at: Some(finished_at),
        }
    }

    /// A patch is consistent when `finished_at` is set exactly for terminal statuses
    pub fn is_consistent(&self) -> bool {
        self.status.is_terminal() == self.finished_at.is_some()
    }
}

impl Run {
    /// Check whether the run reached a terminal status
    pub fn is_completed(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a patch in memory, refusing to leave a terminal status
    pub fn apply(&mut self, update: RunUpdate) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = update.status;
        self.finished_at = update.finished_at;
        true
    }
}
