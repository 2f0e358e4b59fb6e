//! # Lost Job Sweeper
//!
//! Background service that recovers jobs committed as CREATED whose work
//! request was never published, for example because the process died
//! between the commit and the publish.
//!
//! ## Sweep
//!
//! 1. List active jobs created before `now - grace_period`.
//! 2. Keep those still CREATED.
//! 3. Jobs older than `fail_after` are failed through the regular stage error
//!    path, which also fails the run and lets tolerant stages proceed.
//! 4. Every other lost job gets its request published again.
//!
//! SCHEDULED and RUNNING jobs are left to an external watchdog built on
//! [`Orchestrator::list_active_jobs`].

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::orchestrator::Orchestrator;
use crate::config::SweeperConfig;
use crate::error::Result;
use crate::metrics;
use crate::models::{Job, Stage};
use crate::state_machine::JobStatus;
use crate::store::Store;

/// Error message recorded on jobs failed by the sweeper
pub const LOST_JOB_MESSAGE: &str = "The job was never picked up by a worker";

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub republished: Vec<(Stage, i64)>,
    pub failed: Vec<(Stage, i64)>,
    /// Lost jobs that could not be recovered in this sweep
    pub errors: Vec<(Stage, i64)>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.republished.is_empty() && self.failed.is_empty() && self.errors.is_empty()
    }
}

pub struct LostJobSweeper<S: Store> {
    orchestrator: Arc<Orchestrator<S>>,
    config: SweeperConfig,
}

impl<S: Store> std::fmt::Debug for LostJobSweeper<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LostJobSweeper")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: Store> LostJobSweeper<S> {
    pub fn new(orchestrator: Arc<Orchestrator<S>>, config: SweeperConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// Sweep on every interval tick until `shutdown` turns true.
    ///
    /// A failed sweep is logged and the loop carries on.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.interval());
        info!(
            interval_seconds = self.config.interval_seconds,
            grace_period_seconds = self.config.grace_period_seconds,
            fail_after_seconds = self.config.fail_after_seconds,
            "Starting lost job sweeper"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Lost job sweeper stopped");
                        return;
                    }
                    continue;
                }
            }

            match self.sweep_once().await {
                Ok(report) if report.is_empty() => debug!("No lost jobs found"),
                Ok(report) => info!(
                    republished = report.republished.len(),
                    failed = report.failed.len(),
                    errors = report.errors.len(),
                    "Lost job sweep completed"
                ),
                Err(err) => error!(error = %err, "Lost job sweep failed"),
            }
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as if the current time were `now`
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let lost_before = now - self.config.grace_period();
        let fail_before = now - self.config.fail_after();

        let lost: Vec<Job> = self
            .orchestrator
            .list_active_jobs(Some(lost_before))
            .await?
            .into_iter()
            .filter(|job| job.status == JobStatus::Created)
            .collect();

        let mut report = SweepReport::default();
        for job in lost {
            let key = (job.stage, job.id);
            if job.created_at < fail_before {
                match self.orchestrator.fail_lost_job(&job, LOST_JOB_MESSAGE).await {
                    Ok(_) => {
                        record_recovery(job.stage, "failed");
                        report.failed.push(key);
                    }
                    Err(err) => {
                        warn!(stage = %job.stage, job_id = job.id, error = %err, "Could not fail lost job");
                        report.errors.push(key);
                    }
                }
            } else {
                match self.orchestrator.republish(&job).await {
                    Ok(true) => {
                        record_recovery(job.stage, "republished");
                        report.republished.push(key);
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(stage = %job.stage, job_id = job.id, error = %err, "Could not republish lost job");
                        report.errors.push(key);
                    }
                }
            }
        }

        Ok(report)
    }
}

fn record_recovery(stage: Stage, action: &'static str) {
    metrics::lost_jobs_recovered_total().add(
        1,
        &[
            KeyValue::new("stage", stage.as_str()),
            KeyValue::new("action", action),
        ],
    );
}
