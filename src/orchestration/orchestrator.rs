//! # Orchestrator
//!
//! Reacts to inbound [`OrchestratorMessage`]s for a run and decides which
//! stages start next.
//!
//! ## Handling a message
//!
//! 1. Open a serializable transaction and load a [`SchedulingContext`].
//! 2. Apply the transition the message implies.
//! 3. Create a job for every stage that became startable and settle the run
//!    status.
//! 4. Commit. A conflict restarts the whole attempt from step 1.
//! 5. After the commit, publish a work request per new job and mark it
//!    SCHEDULED.
//!
//! Publishing happens strictly after the commit. A job whose request could
//! not be published stays CREATED and is picked up by the
//! [`LostJobSweeper`](super::lost_job_sweeper::LostJobSweeper).

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::retry::with_retries;
use super::scheduling_context::{SchedulingContext, SchedulingPlan};
use crate::config::OrchestrationConfig;
use crate::error::{OrchestratorError, Result};
use crate::logging::log_run_operation;
use crate::messaging::{Envelope, MessageHeader, MessagePublisher, OrchestratorMessage, StageRequest};
use crate::metrics;
use crate::models::{Job, JobUpdate, NewRun, Run, Stage};
use crate::state_machine::{JobEvent, RunStatus};
use crate::store::{finish_transaction, JobRepositories, RunRepository, Store};

/// Error message recorded on jobs failed by a worker infrastructure error
pub const WORKER_INFRASTRUCTURE_ERROR_MESSAGE: &str =
    "The worker could not run the job because of an infrastructure error";

/// What handling one message changed
#[derive(Debug, Clone, PartialEq)]
pub struct HandleOutcome {
    pub run_id: i64,
    pub run_status: RunStatus,
    /// Jobs created while handling the message
    pub created: Vec<(Stage, i64)>,
    /// Created jobs whose request was published and which are now SCHEDULED
    pub scheduled: Vec<(Stage, i64)>,
    /// Created jobs left CREATED because their request could not be published
    pub publish_failures: Vec<(Stage, i64)>,
}

/// Run coordinator over a store backend `S`
pub struct Orchestrator<S: Store> {
    store: S,
    runs: Arc<dyn RunRepository<S::Tx>>,
    jobs: JobRepositories<S::Tx>,
    publisher: MessagePublisher,
    config: OrchestrationConfig,
}

impl<S: Store> std::fmt::Debug for Orchestrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("publisher", &self.publisher)
            .field("config", &self.config)
            .finish()
    }
}

impl<S: Store> Orchestrator<S> {
    pub fn new(
        store: S,
        runs: Arc<dyn RunRepository<S::Tx>>,
        jobs: JobRepositories<S::Tx>,
        publisher: MessagePublisher,
        config: OrchestrationConfig,
    ) -> Self {
        Self {
            store,
            runs,
            jobs,
            publisher,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn job_repositories(&self) -> &JobRepositories<S::Tx> {
        &self.jobs
    }

    pub fn publisher(&self) -> &MessagePublisher {
        &self.publisher
    }

    pub fn config(&self) -> &OrchestrationConfig {
        &self.config
    }

    /// Store a new run and announce it on the orchestrator queue.
    ///
    /// A trace id is generated when `new_run` carries none.
    #[instrument(skip(self, new_run), fields(repository_id = new_run.repository_id))]
    pub async fn create_run(&self, new_run: NewRun) -> Result<Run> {
        let new_run = if new_run.trace_id.is_some() {
            new_run
        } else {
            new_run.with_trace_id(Uuid::new_v4().to_string())
        };

        let new_run = &new_run;
        let run = with_retries(&self.config, "create_run", move || async move {
            let mut tx = self.store.begin().await?;
            let result = self
                .runs
                .create(&mut tx, new_run.clone())
                .await
                .map_err(OrchestratorError::from);
            finish_transaction(tx, result).await
        })
        .await?;

        log_run_operation("create", run.id, &run.status.to_string(), None);
        self.publisher
            .publish_to_orchestrator(
                OrchestratorMessage::RunCreated { run_id: run.id },
                &MessageHeader::for_run(&run),
            )
            .await?;

        Ok(run)
    }

    /// Handle one inbound message: the single entry point of the orchestrator
    #[instrument(
        skip(self, envelope),
        fields(
            trace_id = %envelope.header.trace_id,
            run_id = envelope.header.run_id,
            message_type = envelope.payload.message_type(),
        )
    )]
    pub async fn handle(&self, envelope: &Envelope<OrchestratorMessage>) -> Result<HandleOutcome> {
        let started = Instant::now();
        let message = &envelope.payload;
        let message_type = message.message_type();

        let result = with_retries(&self.config, message_type, || self.handle_once(message)).await;

        let outcome_label = match &result {
            Ok(_) => "ok",
            Err(err) if err.is_not_found() => "not_found",
            Err(_) => "error",
        };
        metrics::messages_handled_total().add(
            1,
            &[
                KeyValue::new("message_type", message_type),
                KeyValue::new("outcome", outcome_label),
            ],
        );

        let plan = match result {
            Ok(plan) => plan,
            Err(err) if err.is_not_found() => {
                warn!(error = %err, "Message refers to missing data, dropping it");
                return Err(err);
            }
            Err(err) => {
                error!(error = %err, "Message handling failed");
                return Err(err);
            }
        };

        let outcome = self.execute_plan(plan).await;
        metrics::message_handling_duration().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("message_type", message_type)],
        );
        Ok(outcome)
    }

    /// One attempt: a transaction from begin to commit
    async fn handle_once(&self, message: &OrchestratorMessage) -> Result<SchedulingPlan> {
        let mut tx = self.store.begin().await?;
        let result = match message {
            OrchestratorMessage::RunCreated { run_id } => self.on_run_created(&mut tx, *run_id).await,
            OrchestratorMessage::StageResult {
                stage,
                job_id,
                has_issues,
            } => {
                self.on_stage_result(&mut tx, *stage, *job_id, *has_issues)
                    .await
            }
            OrchestratorMessage::StageError {
                stage,
                job_id,
                message,
            } => self.on_stage_error(&mut tx, *stage, *job_id, message).await,
            OrchestratorMessage::WorkerInfrastructureError { stage, run_id } => {
                self.on_worker_infrastructure_error(&mut tx, *stage, *run_id)
                    .await
            }
        };
        finish_transaction(tx, result).await
    }

    async fn load_context<'a>(
        &'a self,
        tx: &mut S::Tx,
        run_id: i64,
    ) -> Result<SchedulingContext<'a, S::Tx>> {
        SchedulingContext::load(tx, self.runs.as_ref(), &self.jobs, run_id).await
    }

    async fn load_job(&self, tx: &mut S::Tx, stage: Stage, job_id: i64) -> Result<Job> {
        self.jobs
            .get(stage)
            .get(tx, job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound { stage, job_id })
    }

    async fn on_run_created(&self, tx: &mut S::Tx, run_id: i64) -> Result<SchedulingPlan> {
        let context = self.load_context(tx, run_id).await?;
        if context.run().is_completed() {
            debug!(run_id, status = %context.run().status, "Run already completed");
            return Ok(context.into_empty_plan());
        }
        context.advance(tx).await
    }

    async fn on_stage_result(
        &self,
        tx: &mut S::Tx,
        stage: Stage,
        job_id: i64,
        has_issues: bool,
    ) -> Result<SchedulingPlan> {
        let job = self.load_job(tx, stage, job_id).await?;
        let mut context = self.load_context(tx, job.run_id).await?;

        if !context.complete_job(tx, stage, has_issues).await? {
            info!(
                stage = %stage,
                job_id,
                status = %job.status,
                "Duplicate result for completed job"
            );
        }
        context.advance(tx).await
    }

    async fn on_stage_error(
        &self,
        tx: &mut S::Tx,
        stage: Stage,
        job_id: i64,
        message: &str,
    ) -> Result<SchedulingPlan> {
        let job = self.load_job(tx, stage, job_id).await?;
        let mut context = self.load_context(tx, job.run_id).await?;
        self.fail_stage(tx, &mut context, stage, message).await?;
        context.advance(tx).await
    }

    async fn on_worker_infrastructure_error(
        &self,
        tx: &mut S::Tx,
        stage: Stage,
        run_id: i64,
    ) -> Result<SchedulingPlan> {
        let mut context = self.load_context(tx, run_id).await?;
        if context.job(stage).is_none() {
            return Err(OrchestratorError::RunJobNotFound { stage, run_id });
        }
        self.fail_stage(tx, &mut context, stage, WORKER_INFRASTRUCTURE_ERROR_MESSAGE)
            .await?;
        context.advance(tx).await
    }

    async fn fail_stage(
        &self,
        tx: &mut S::Tx,
        context: &mut SchedulingContext<'_, S::Tx>,
        stage: Stage,
        message: &str,
    ) -> Result<()> {
        if !context.fail_job(tx, stage, message).await? {
            info!(stage = %stage, run_id = context.run().id, "Duplicate error for completed job");
        }
        Ok(())
    }

    /// Publish a request for every created job and mark it SCHEDULED
    async fn execute_plan(&self, plan: SchedulingPlan) -> HandleOutcome {
        let mut outcome = HandleOutcome {
            run_id: plan.header.run_id,
            run_status: plan.run_status,
            created: plan.jobs.iter().map(|job| (job.stage, job.id)).collect(),
            scheduled: Vec::new(),
            publish_failures: Vec::new(),
        };

        for job in &plan.jobs {
            match self.dispatch(job, &plan.header).await {
                Ok(()) => outcome.scheduled.push((job.stage, job.id)),
                Err(err) => {
                    metrics::publish_failures_total().add(1, &metrics::stage_attributes(job.stage));
                    warn!(
                        stage = %job.stage,
                        job_id = job.id,
                        error = %err,
                        "Could not dispatch job, leaving it for the lost job sweeper"
                    );
                    outcome.publish_failures.push((job.stage, job.id));
                }
            }
        }

        outcome
    }

    /// Publish the work request of `job`, then mark it SCHEDULED
    async fn dispatch(&self, job: &Job, header: &MessageHeader) -> Result<()> {
        let request = StageRequest {
            stage: job.stage,
            job_id: job.id,
        };
        self.publisher.publish(job.stage, request, header).await?;

        let scheduled = with_retries(&self.config, "mark_scheduled", || {
            self.mark_scheduled(job.stage, job.id)
        })
        .await?;
        if scheduled {
            metrics::jobs_scheduled_total().add(1, &metrics::stage_attributes(job.stage));
        }
        Ok(())
    }

    /// Move a CREATED job to SCHEDULED; a job already further along is left alone
    async fn mark_scheduled(&self, stage: Stage, job_id: i64) -> Result<bool> {
        let mut tx = self.store.begin().await?;
        let result: Result<bool> = async {
            let repository = self.jobs.get(stage);
            let job = repository
                .get(&mut tx, job_id)
                .await?
                .ok_or(OrchestratorError::JobNotFound { stage, job_id })?;
            match JobEvent::Schedule.target_status(job.status) {
                Some(status) => {
                    repository
                        .update(&mut tx, job_id, JobUpdate::status(status))
                        .await?;
                    Ok(true)
                }
                None => Ok(false),
            }
        }
        .await;
        finish_transaction(tx, result).await
    }

    /// Jobs of all stages that are not terminal, optionally only those
    /// created before `before`
    pub async fn list_active_jobs(&self, before: Option<DateTime<Utc>>) -> Result<Vec<Job>> {
        with_retries(&self.config, "list_active_jobs", move || async move {
            let mut tx = self.store.begin().await?;
            let result = self
                .jobs
                .list_active(&mut tx, before)
                .await
                .map_err(OrchestratorError::from);
            finish_transaction(tx, result).await
        })
        .await
    }

    /// Publish the request of a job that is still CREATED again.
    ///
    /// Returns `false` when the job moved on in the meantime.
    #[instrument(skip(self, job), fields(stage = %job.stage, job_id = job.id))]
    pub async fn republish(&self, job: &Job) -> Result<bool> {
        let current = with_retries(&self.config, "republish", move || async move {
            let mut tx = self.store.begin().await?;
            let result: Result<(Job, MessageHeader)> = async {
                let current = self.load_job(&mut tx, job.stage, job.id).await?;
                let run = self
                    .runs
                    .get(&mut tx, current.run_id)
                    .await?
                    .ok_or(OrchestratorError::RunNotFound {
                        run_id: current.run_id,
                    })?;
                Ok((current, MessageHeader::for_run(&run)))
            }
            .await;
            finish_transaction(tx, result).await
        })
        .await?;

        let (current, header) = current;
        if JobEvent::Schedule.target_status(current.status).is_none() {
            debug!(status = %current.status, "Job no longer waits for its request");
            return Ok(false);
        }
        self.dispatch(&current, &header).await?;
        Ok(true)
    }

    /// Fail a job that never reached a worker through the regular stage error path
    pub async fn fail_lost_job(&self, job: &Job, reason: &str) -> Result<HandleOutcome> {
        let envelope = Envelope::new(
            MessageHeader::new(Uuid::new_v4().to_string(), job.run_id),
            OrchestratorMessage::StageError {
                stage: job.stage,
                job_id: job.id,
                message: reason.to_string(),
            },
        );
        self.handle(&envelope).await
    }
}
