//! Worker-side job lifecycle helpers.
//!
//! Workers that share the store mark their job RUNNING when they pick up a
//! request and record the terminal status themselves before reporting to the
//! orchestrator. Both operations are conditional, so redelivered requests and
//! late duplicates leave the job untouched.
//!
//! ```rust
//! use std::sync::Arc;
//! use orchestrator_core::config::OrchestrationConfig;
//! use orchestrator_core::models::{JobConfigurations, NewRun, Stage};
//! use orchestrator_core::orchestration::JobLifecycle;
//! use orchestrator_core::store::memory::InMemoryStore;
//! use orchestrator_core::store::{RunRepository, Store, StoreTransaction};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let store = InMemoryStore::new();
//! let configs = JobConfigurations::enabling(&[Stage::Scanner]);
//!
//! let mut tx = store.begin().await?;
//! let run = store.run_repository().create(&mut tx, NewRun::new(1, "main", configs)).await?;
//! let jobs = store.job_repositories();
//! let job = jobs.get(Stage::Scanner).create(&mut tx, run.id, json!({})).await?;
//! tx.commit().await?;
//!
//! let lifecycle = JobLifecycle::new(Arc::new(store.clone()), jobs, OrchestrationConfig::default());
//! assert!(lifecycle.start(Stage::Scanner, job.id).await?.is_some());
//! assert!(lifecycle.start(Stage::Scanner, job.id).await?.is_none());
//! # Ok::<(), orchestrator_core::OrchestratorError>(())
//! # }).unwrap();
//! ```

use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use super::retry::with_retries;
use crate::config::OrchestrationConfig;
use crate::error::{OrchestratorError, Result};
use crate::logging::log_job_operation;
use crate::models::{Job, Stage};
use crate::state_machine::JobStatus;
use crate::store::{finish_transaction, JobRepositories, Store};

/// Start/complete helpers over the job repositories of a store
pub struct JobLifecycle<S: Store> {
    store: Arc<S>,
    jobs: JobRepositories<S::Tx>,
    config: OrchestrationConfig,
}

impl<S: Store> Clone for JobLifecycle<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            jobs: self.jobs.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: Store> std::fmt::Debug for JobLifecycle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLifecycle")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: Store> JobLifecycle<S> {
    pub fn new(store: Arc<S>, jobs: JobRepositories<S::Tx>, config: OrchestrationConfig) -> Self {
        Self {
            store,
            jobs,
            config,
        }
    }

    /// Mark the job RUNNING.
    ///
    /// Returns `None` when the job was already started or completed.
    pub async fn start(&self, stage: Stage, job_id: i64) -> Result<Option<Job>> {
        let started = with_retries(&self.config, "start_job", move || async move {
            let mut tx = self.store.begin().await?;
            let result = self
                .jobs
                .get(stage)
                .try_start(&mut tx, job_id, Utc::now())
                .await
                .map_err(OrchestratorError::from);
            finish_transaction(tx, result).await
        })
        .await?;

        match &started {
            Some(job) => log_job_operation("start", stage, job.run_id, job_id, "RUNNING", None),
            None => debug!(stage = %stage, job_id, "Job already started"),
        }
        Ok(started)
    }

    /// Record the terminal `status` of the job.
    ///
    /// Returns `None` when the job was already completed.
    pub async fn complete(&self, stage: Stage, job_id: i64, status: JobStatus) -> Result<Option<Job>> {
        let completed = with_retries(&self.config, "complete_job", move || async move {
            let mut tx = self.store.begin().await?;
            let result = self
                .jobs
                .get(stage)
                .try_complete(&mut tx, job_id, Utc::now(), status)
                .await
                .map_err(OrchestratorError::from);
            finish_transaction(tx, result).await
        })
        .await?;

        match &completed {
            Some(job) => {
                log_job_operation("complete", stage, job.run_id, job_id, &status.to_string(), None)
            }
            None => debug!(stage = %stage, job_id, "Job already completed"),
        }
        Ok(completed)
    }
}
