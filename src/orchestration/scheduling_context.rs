//! # Scheduling Context
//!
//! Per-message view of one run: the run record, the jobs created for it so
//! far and the repositories to change them, all bound to the transaction of
//! the message being handled. A context is loaded fresh for every attempt and
//! never shared between messages.

use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::dependency_graph::{self, GraphSnapshot};
use crate::error::{OrchestratorError, Result};
use crate::logging::{log_job_operation, log_run_operation};
use crate::messaging::MessageHeader;
use crate::metrics;
use crate::models::{Job, JobUpdate, Run, RunUpdate, Stage};
use crate::state_machine::{JobEvent, JobStatus, RunStatus};
use crate::store::{JobRepositories, RunRepository};

/// Work left for after the commit: publish a request for every new job
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulingPlan {
    pub header: MessageHeader,
    /// Jobs created in the transaction, still CREATED
    pub jobs: Vec<Job>,
    /// Run status as committed
    pub run_status: RunStatus,
}

impl SchedulingPlan {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

pub struct SchedulingContext<'a, Tx: Send> {
    run: Run,
    jobs: BTreeMap<Stage, Job>,
    run_repository: &'a dyn RunRepository<Tx>,
    job_repositories: &'a JobRepositories<Tx>,
}

impl<'a, Tx: Send> SchedulingContext<'a, Tx> {
    /// Load the run and its jobs
    pub async fn load(
        tx: &mut Tx,
        run_repository: &'a dyn RunRepository<Tx>,
        job_repositories: &'a JobRepositories<Tx>,
        run_id: i64,
    ) -> Result<Self> {
        let run = run_repository
            .get(tx, run_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound { run_id })?;
        let jobs = job_repositories.load_for_run(tx, run_id).await?;

        debug!(
            run_id,
            run_status = %run.status,
            jobs = jobs.len(),
            "Scheduling context loaded"
        );

        Ok(Self {
            run,
            jobs,
            run_repository,
            job_repositories,
        })
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn job(&self, stage: Stage) -> Option<&Job> {
        self.jobs.get(&stage)
    }

    pub fn jobs(&self) -> &BTreeMap<Stage, Job> {
        &self.jobs
    }

    pub fn header(&self) -> MessageHeader {
        MessageHeader::for_run(&self.run)
    }

    pub fn job_statuses(&self) -> BTreeMap<Stage, JobStatus> {
        self.jobs
            .iter()
            .map(|(stage, job)| (*stage, job.status))
            .collect()
    }

    /// The run is FAILED or one of its jobs is
    pub fn run_failed(&self) -> bool {
        self.run.status.is_failed() || self.jobs.values().any(|job| job.status.is_failed())
    }

    pub fn startable_stages(&self) -> Vec<Stage> {
        let statuses = self.job_statuses();
        let snapshot = GraphSnapshot::new(&self.run.job_configs, &statuses, self.run_failed());
        dependency_graph::startable_stages(&snapshot)
    }

    pub fn is_run_complete(&self) -> bool {
        let statuses = self.job_statuses();
        let snapshot = GraphSnapshot::new(&self.run.job_configs, &statuses, self.run_failed());
        dependency_graph::is_run_complete(&snapshot)
    }

    /// Terminal status the run gets once it is complete
    pub fn final_status(&self) -> RunStatus {
        if self.run_failed() {
            RunStatus::Failed
        } else if self
            .jobs
            .values()
            .any(|job| job.status == JobStatus::FinishedWithIssues)
        {
            RunStatus::FinishedWithIssues
        } else {
            RunStatus::Finished
        }
    }

    /// Record a worker result on the job of `stage`.
    ///
    /// Returns `false` when the job was already terminal.
    pub async fn complete_job(&mut self, tx: &mut Tx, stage: Stage, has_issues: bool) -> Result<bool> {
        let Some(job) = self.jobs.get(&stage) else {
            return Err(OrchestratorError::RunJobNotFound {
                stage,
                run_id: self.run.id,
            });
        };
        let Some(status) = JobEvent::complete(has_issues).target_status(job.status) else {
            return Ok(false);
        };

        let repository = self.job_repositories.get(stage);
        match repository.try_complete(tx, job.id, Utc::now(), status).await? {
            Some(updated) => {
                log_job_operation("complete", stage, self.run.id, updated.id, &status.to_string(), None);
                self.jobs.insert(stage, updated);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Mark the job of `stage` FAILED with `message`, then fail the run.
    ///
    /// Returns `false` when the job was already terminal. A job its worker
    /// already marked FAILED still gets `message` if it has none, and the run
    /// is failed either way.
    pub async fn fail_job(&mut self, tx: &mut Tx, stage: Stage, message: &str) -> Result<bool> {
        let Some(job) = self.jobs.get(&stage) else {
            return Err(OrchestratorError::RunJobNotFound {
                stage,
                run_id: self.run.id,
            });
        };
        let event = JobEvent::fail_with_error(message);
        if event.target_status(job.status).is_none() {
            if job.status == JobStatus::Failed && job.error_message.is_none() {
                let job_id = job.id;
                let updated = self
                    .job_repositories
                    .get(stage)
                    .update(tx, job_id, JobUpdate::error_message(message))
                    .await?;
                self.jobs.insert(stage, updated);
            }
            if self.run_failed() {
                self.fail_run(tx).await?;
            }
            return Ok(false);
        }

        let repository = self.job_repositories.get(stage);
        let job_id = job.id;
        if repository
            .try_complete(tx, job_id, Utc::now(), JobStatus::Failed)
            .await?
            .is_none()
        {
            return Ok(false);
        }
        let updated = repository
            .update(tx, job_id, JobUpdate::error_message(message))
            .await?;
        log_job_operation("fail", stage, self.run.id, job_id, "FAILED", event.error_message());
        self.jobs.insert(stage, updated);

        self.fail_run(tx).await?;
        Ok(true)
    }

    async fn fail_run(&mut self, tx: &mut Tx) -> Result<()> {
        if self.run.is_completed() {
            return Ok(());
        }
        self.run = self
            .run_repository
            .update(tx, self.run.id, RunUpdate::finished(RunStatus::Failed, Utc::now()))
            .await?;
        metrics::runs_completed_total().add(
            1,
            &[opentelemetry::KeyValue::new("status", RunStatus::Failed.to_string())],
        );
        log_run_operation("fail", self.run.id, "FAILED", None);
        Ok(())
    }

    /// Create a job for every startable stage and settle the run status.
    ///
    /// The run becomes ACTIVE with its first jobs, and gets its final status
    /// once nothing is pending any more.
    pub async fn advance(mut self, tx: &mut Tx) -> Result<SchedulingPlan> {
        if self.run_failed() {
            self.fail_run(tx).await?;
        }

        let mut created = Vec::new();
        for stage in self.startable_stages() {
            let configuration = self
                .run
                .job_configs
                .for_stage(stage)
                .cloned()
                .unwrap_or(Value::Null);
            let job = self
                .job_repositories
                .get(stage)
                .create(tx, self.run.id, configuration)
                .await?;
            metrics::jobs_created_total().add(1, &metrics::stage_attributes(stage));
            log_job_operation("create", stage, self.run.id, job.id, "CREATED", None);
            self.jobs.insert(stage, job.clone());
            created.push(job);
        }

        if !created.is_empty() && self.run.status == RunStatus::Created {
            self.run = self
                .run_repository
                .update(tx, self.run.id, RunUpdate::status(RunStatus::Active))
                .await?;
            log_run_operation("activate", self.run.id, "ACTIVE", None);
        }

        if !self.run.is_completed() && self.is_run_complete() {
            let status = self.final_status();
            self.run = self
                .run_repository
                .update(tx, self.run.id, RunUpdate::finished(status, Utc::now()))
                .await?;
            metrics::runs_completed_total().add(
                1,
                &[opentelemetry::KeyValue::new("status", status.to_string())],
            );
            info!(run_id = self.run.id, status = %status, "Run finished");
        }

        Ok(SchedulingPlan {
            header: self.header(),
            jobs: created,
            run_status: self.run.status,
        })
    }

    /// Plan that publishes nothing
    pub fn into_empty_plan(self) -> SchedulingPlan {
        SchedulingPlan {
            header: self.header(),
            jobs: Vec::new(),
            run_status: self.run.status,
        }
    }
}
