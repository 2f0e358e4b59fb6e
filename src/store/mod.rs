//! # Store
//!
//! Persistence contracts for runs and jobs, abstract over the storage engine.
//!
//! ## Architecture
//!
//! - [`Store`] opens transactions at serializable isolation. Every mutation the
//!   orchestrator performs happens inside one of them.
//! - [`RunRepository`] and [`JobRepository`] are parameterised over the
//!   backend's transaction type, so a handler can combine reads and writes of
//!   several repositories atomically.
//! - One [`JobRepository`] exists per [`Stage`]; [`JobRepositories`] is the
//!   explicit stage → repository map handed to the orchestrator.
//!
//! Backends: [`memory`] (always available) and `postgres` (feature
//! `postgres`).

pub mod errors;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

use crate::models::{Job, JobUpdate, NewRun, Run, RunUpdate, Stage};
use crate::state_machine::JobStatus;

pub use errors::{StoreError, StoreResult};

/// Entry point of a storage backend
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Tx: StoreTransaction;

    /// Begin a transaction at serializable isolation
    async fn begin(&self) -> StoreResult<Self::Tx>;
}

/// An open transaction; dropping it without commit discards its changes
#[async_trait]
pub trait StoreTransaction: Send + Sized + 'static {
    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}

/// Repository of run records
#[async_trait]
pub trait RunRepository<Tx: Send>: Send + Sync {
    async fn create(&self, tx: &mut Tx, new_run: NewRun) -> StoreResult<Run>;

    async fn get(&self, tx: &mut Tx, id: i64) -> StoreResult<Option<Run>>;

    /// Apply a status patch. Patches to a terminal run are rejected with
    /// [`StoreError::InvalidUpdate`].
    async fn update(&self, tx: &mut Tx, id: i64, update: RunUpdate) -> StoreResult<Run>;
}

/// Repository of the jobs of one stage
#[async_trait]
pub trait JobRepository<Tx: Send>: Send + Sync {
    /// The stage whose jobs this repository stores
    fn stage(&self) -> Stage;

    async fn create(&self, tx: &mut Tx, run_id: i64, configuration: Value) -> StoreResult<Job>;

    async fn get(&self, tx: &mut Tx, id: i64) -> StoreResult<Option<Job>>;

    async fn get_for_run(&self, tx: &mut Tx, run_id: i64) -> StoreResult<Option<Job>>;

    /// Apply a partial update. Updates breaking the rule that `finished_at`
    /// is set exactly for terminal statuses are rejected.
    async fn update(&self, tx: &mut Tx, id: i64, update: JobUpdate) -> StoreResult<Job>;

    /// Move the job to RUNNING if it has not been started yet.
    ///
    /// Returns `None` when the job was already started or completed.
    async fn try_start(
        &self,
        tx: &mut Tx,
        id: i64,
        started_at: DateTime<Utc>,
    ) -> StoreResult<Option<Job>>;

    /// Move the job to the terminal `status` unless it is already terminal.
    ///
    /// Returns `None` when the job was already completed.
    async fn try_complete(
        &self,
        tx: &mut Tx,
        id: i64,
        finished_at: DateTime<Utc>,
        status: JobStatus,
    ) -> StoreResult<Option<Job>>;

    /// Jobs not yet terminal, optionally only those created before `before`
    async fn list_active(
        &self,
        tx: &mut Tx,
        before: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Job>>;
}

/// Explicit stage → job repository map
pub struct JobRepositories<Tx> {
    repositories: [Arc<dyn JobRepository<Tx>>; 6],
}

impl<Tx> Clone for JobRepositories<Tx> {
    fn clone(&self) -> Self {
        Self {
            repositories: self.repositories.clone(),
        }
    }
}

impl<Tx> std::fmt::Debug for JobRepositories<Tx> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRepositories")
            .field("stages", &Stage::ALL)
            .finish()
    }
}

impl<Tx: Send> JobRepositories<Tx> {
    /// Build the map; every stage must be covered exactly once
    pub fn new(
        repositories: impl IntoIterator<Item = Arc<dyn JobRepository<Tx>>>,
    ) -> StoreResult<Self> {
        let mut by_stage: BTreeMap<Stage, Arc<dyn JobRepository<Tx>>> = BTreeMap::new();
        for repository in repositories {
            let stage = repository.stage();
            if by_stage.insert(stage, repository).is_some() {
                warn!(stage = %stage, "Job repository registered twice, keeping the last one");
            }
        }

        let ordered = Stage::ALL
            .into_iter()
            .map(|stage| {
                by_stage
                    .remove(&stage)
                    .ok_or(StoreError::MissingRepository { stage })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        let repositories = <[Arc<dyn JobRepository<Tx>>; 6]>::try_from(ordered)
            .map_err(|_| StoreError::database("register", "unexpected number of stages"))?;

        Ok(Self { repositories })
    }

    /// Build the map from a per-stage constructor
    pub fn from_fn(mut repository_for: impl FnMut(Stage) -> Arc<dyn JobRepository<Tx>>) -> Self {
        Self {
            repositories: Stage::ALL.map(|stage| repository_for(stage)),
        }
    }

    pub fn get(&self, stage: Stage) -> &dyn JobRepository<Tx> {
        self.repositories[stage_index(stage)].as_ref()
    }

    /// Load the job of every stage that already has one for `run_id`
    pub async fn load_for_run(
        &self,
        tx: &mut Tx,
        run_id: i64,
    ) -> StoreResult<BTreeMap<Stage, Job>> {
        let mut jobs = BTreeMap::new();
        for stage in Stage::ALL {
            if let Some(job) = self.get(stage).get_for_run(tx, run_id).await? {
                jobs.insert(stage, job);
            }
        }
        Ok(jobs)
    }

    /// Active jobs of all stages, optionally only those created before `before`
    pub async fn list_active(
        &self,
        tx: &mut Tx,
        before: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Job>> {
        let mut jobs = Vec::new();
        for stage in Stage::ALL {
            jobs.extend(self.get(stage).list_active(tx, before).await?);
        }
        Ok(jobs)
    }
}

/// Position of `stage` in [`Stage::ALL`]
fn stage_index(stage: Stage) -> usize {
    match stage {
        Stage::Analyzer => 0,
        Stage::Advisor => 1,
        Stage::Scanner => 2,
        Stage::Evaluator => 3,
        Stage::Reporter => 4,
        Stage::Notifier => 5,
    }
}

/// Commit on success, roll back on failure, and hand the result through
pub async fn finish_transaction<Tx, T, E>(tx: Tx, result: Result<T, E>) -> Result<T, E>
where
    Tx: StoreTransaction,
    E: From<StoreError>,
{
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed after handler error");
            }
            Err(err)
        }
    }
}
