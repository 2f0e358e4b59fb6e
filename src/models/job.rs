//! # Job Model
//!
//! The persisted unit of work for one stage within one run. Every stage has
//! its own table with the same shape, so a single struct serves all of them.
//!
//! ## Database Schema
//!
//! Maps to the `<stage>_jobs` tables:
//! ```sql
//! CREATE TABLE analyzer_jobs (
//!   id BIGSERIAL PRIMARY KEY,
//!   run_id BIGINT NOT NULL REFERENCES runs (id),
//!   configuration JSONB NOT NULL,
//!   status TEXT NOT NULL,
//!   created_at TIMESTAMPTZ NOT NULL,
//!   started_at TIMESTAMPTZ,
//!   finished_at TIMESTAMPTZ,
//!   error_message TEXT,
//!   UNIQUE (run_id)
//! );
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::stage::Stage;
use crate::state_machine::JobStatus;

/// A job of one stage.
///
/// `finished_at` is set if and only if `status` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub run_id: i64,
    pub stage: Stage,
    pub configuration: Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Job {
    pub fn is_completed(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a partial update in memory; unset fields are kept
    pub fn apply(&mut self, update: &JobUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(started_at) = update.started_at {
            self.started_at = Some(started_at);
        }
        if let Some(finished_at) = update.finished_at {
            self.finished_at = Some(finished_at);
        }
        if let Some(error_message) = &update.error_message {
            self.error_message = Some(error_message.clone());
        }
    }

    /// Check the timestamp invariant of the job
    pub fn is_consistent(&self) -> bool {
        self.status.is_terminal() == self.finished_at.is_some()
    }
}

/// Partial update of a job; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn error_message(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Check the update against the job it would be applied to
    pub fn preserves_invariants(&self, job: &Job) -> bool {
        let mut updated = job.clone();
        updated.apply(self);
        updated.is_consistent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job(status: JobStatus) -> Job {
        Job {
            id: 11,
            run_id: 1,
            stage: Stage::Analyzer,
            configuration: Value::Null,
            status,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error_message: None,
        }
    }

    #[test]
    fn test_apply_keeps_unset_fields() {
        let mut job = sample_job(JobStatus::Running);
        job.error_message = Some("previous".to_string());
        job.apply(&JobUpdate::status(JobStatus::Scheduled));
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.error_message.as_deref(), Some("previous"));
    }

    #[test]
    fn test_terminal_status_requires_finished_at() {
        let job = sample_job(JobStatus::Running);
        assert!(!JobUpdate::status(JobStatus::Finished).preserves_invariants(&job));

        let update = JobUpdate {
            status: Some(JobStatus::Finished),
            finished_at: Some(Utc::now()),
            ..JobUpdate::default()
        };
        assert!(update.preserves_invariants(&job));
    }

    #[test]
    fn test_error_message_update_is_always_consistent() {
        let job = sample_job(JobStatus::Created);
        assert!(JobUpdate::error_message("boom").preserves_invariants(&job));
    }
}
