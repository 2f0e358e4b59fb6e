//! # In-Memory Store
//!
//! A [`Store`] backed by process memory. Transactions take an exclusive lock
//! on the whole state and work on a private copy that replaces the shared
//! state on commit, so every schedule is serializable.
//!
//! Commit conflicts can be injected with [`InMemoryStore::inject_conflicts`]
//! to exercise the retry path of callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::{
    JobRepositories, JobRepository, RunRepository, Store, StoreError, StoreResult,
    StoreTransaction,
};
use crate::models::{Job, JobUpdate, NewRun, Run, RunUpdate, Stage};
use crate::state_machine::{JobStatus, RunStatus};

/// Contents of an [`InMemoryStore`]
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    runs: BTreeMap<i64, Run>,
    jobs: BTreeMap<Stage, BTreeMap<i64, Job>>,
    last_run_id: i64,
    last_job_id: i64,
}

impl MemoryState {
    pub fn run(&self, id: i64) -> Option<&Run> {
        self.runs.get(&id)
    }

    pub fn runs(&self) -> impl Iterator<Item = &Run> {
        self.runs.values()
    }

    pub fn jobs(&self, stage: Stage) -> impl Iterator<Item = &Job> {
        self.jobs.get(&stage).into_iter().flat_map(|jobs| jobs.values())
    }

    /// All jobs of a run, one per stage at most
    pub fn jobs_for_run(&self, run_id: i64) -> BTreeMap<Stage, Job> {
        Stage::ALL
            .into_iter()
            .filter_map(|stage| {
                self.jobs(stage)
                    .find(|job| job.run_id == run_id)
                    .map(|job| (stage, job.clone()))
            })
            .collect()
    }

    /// Number of job rows of `stage` belonging to `run_id`
    pub fn job_count(&self, stage: Stage, run_id: i64) -> usize {
        self.jobs(stage).filter(|job| job.run_id == run_id).count()
    }

    fn stage_jobs_mut(&mut self, stage: Stage) -> &mut BTreeMap<i64, Job> {
        self.jobs.entry(stage).or_default()
    }
}

/// Process-local store; clones share the same state
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
    injected_conflicts: Arc<AtomicUsize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with [`StoreError::Conflict`]
    pub fn inject_conflicts(&self, count: usize) {
        self.injected_conflicts.fetch_add(count, Ordering::SeqCst);
    }

    /// Injected conflicts not consumed yet
    pub fn pending_conflicts(&self) -> usize {
        self.injected_conflicts.load(Ordering::SeqCst)
    }

    /// Copy of the committed state
    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    pub fn run_repository(&self) -> Arc<dyn RunRepository<InMemoryTransaction>> {
        Arc::new(InMemoryRunRepository)
    }

    pub fn job_repositories(&self) -> JobRepositories<InMemoryTransaction> {
        JobRepositories::from_fn(|stage| {
            Arc::new(InMemoryJobRepository::new(stage)) as Arc<dyn JobRepository<InMemoryTransaction>>
        })
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> StoreResult<InMemoryTransaction> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(InMemoryTransaction {
            guard,
            working,
            injected_conflicts: Arc::clone(&self.injected_conflicts),
        })
    }
}

/// Transaction of an [`InMemoryStore`]
pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    injected_conflicts: Arc<AtomicUsize>,
}

impl InMemoryTransaction {
    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn commit(mut self) -> StoreResult<()> {
        if self.take_injected_conflict() {
            debug!("Injected commit conflict");
            return Err(StoreError::conflict("could not serialize access (injected)"));
        }
        *self.guard = self.working;
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        Ok(())
    }
}

/// Run repository over [`InMemoryTransaction`]
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryRunRepository;

#[async_trait]
impl RunRepository<InMemoryTransaction> for InMemoryRunRepository {
    async fn create(&self, tx: &mut InMemoryTransaction, new_run: NewRun) -> StoreResult<Run> {
        let state = &mut tx.working;
        state.last_run_id += 1;
        let run = Run {
            id: state.last_run_id,
            repository_id: new_run.repository_id,
            revision: new_run.revision,
            status: RunStatus::Created,
            job_configs: new_run.job_configs,
            trace_id: new_run.trace_id,
            labels: new_run.labels,
            created_at: Utc::now(),
            finished_at: None,
        };
        state.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get(&self, tx: &mut InMemoryTransaction, id: i64) -> StoreResult<Option<Run>> {
        Ok(tx.working.runs.get(&id).cloned())
    }

    async fn update(
        &self,
        tx: &mut InMemoryTransaction,
        id: i64,
        update: RunUpdate,
    ) -> StoreResult<Run> {
        if !update.is_consistent() {
            return Err(StoreError::invalid_update(
                "run",
                id,
                "finished_at must be set exactly for terminal statuses",
            ));
        }
        let run = tx
            .working
            .runs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("run", id))?;
        if !run.apply(update) {
            return Err(StoreError::invalid_update(
                "run",
                id,
                format!("run is already {}", run.status),
            ));
        }
        Ok(run.clone())
    }
}

/// Job repository of one stage over [`InMemoryTransaction`]
#[derive(Debug, Clone, Copy)]
pub struct InMemoryJobRepository {
    stage: Stage,
}

impl InMemoryJobRepository {
    pub fn new(stage: Stage) -> Self {
        Self { stage }
    }

    fn job_mut<'a>(&self, tx: &'a mut InMemoryTransaction, id: i64) -> StoreResult<&'a mut Job> {
        tx.working
            .stage_jobs_mut(self.stage)
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(self.stage.job_table(), id))
    }
}

#[async_trait]
impl JobRepository<InMemoryTransaction> for InMemoryJobRepository {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn create(
        &self,
        tx: &mut InMemoryTransaction,
        run_id: i64,
        configuration: Value,
    ) -> StoreResult<Job> {
        let state = &mut tx.working;
        if !state.runs.contains_key(&run_id) {
            return Err(StoreError::not_found("run", run_id));
        }
        if state.jobs(self.stage).any(|job| job.run_id == run_id) {
            return Err(StoreError::conflict(format!(
                "{} job already exists for run {run_id}",
                self.stage
            )));
        }

        state.last_job_id += 1;
        let job = Job {
            id: state.last_job_id,
            run_id,
            stage: self.stage,
            configuration,
            status: JobStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error_message: None,
        };
        state.stage_jobs_mut(self.stage).insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, tx: &mut InMemoryTransaction, id: i64) -> StoreResult<Option<Job>> {
        Ok(tx
            .working
            .jobs
            .get(&self.stage)
            .and_then(|jobs| jobs.get(&id))
            .cloned())
    }

    async fn get_for_run(
        &self,
        tx: &mut InMemoryTransaction,
        run_id: i64,
    ) -> StoreResult<Option<Job>> {
        Ok(tx
            .working
            .jobs(self.stage)
            .find(|job| job.run_id == run_id)
            .cloned())
    }

    async fn update(
        &self,
        tx: &mut InMemoryTransaction,
        id: i64,
        update: JobUpdate,
    ) -> StoreResult<Job> {
        let job = self.job_mut(tx, id)?;
        if !update.preserves_invariants(job) {
            return Err(StoreError::invalid_update(
                "job",
                id,
                "finished_at must be set exactly for terminal statuses",
            ));
        }
        job.apply(&update);
        Ok(job.clone())
    }

    async fn try_start(
        &self,
        tx: &mut InMemoryTransaction,
        id: i64,
        started_at: DateTime<Utc>,
    ) -> StoreResult<Option<Job>> {
        let job = self.job_mut(tx, id)?;
        if !job.status.is_not_started() {
            return Ok(None);
        }
        job.status = JobStatus::Running;
        job.started_at = Some(started_at);
        Ok(Some(job.clone()))
    }

    async fn try_complete(
        &self,
        tx: &mut InMemoryTransaction,
        id: i64,
        finished_at: DateTime<Utc>,
        status: JobStatus,
    ) -> StoreResult<Option<Job>> {
        if !status.is_terminal() {
            return Err(StoreError::invalid_update(
                "job",
                id,
                format!("{status} is not a terminal status"),
            ));
        }
        let job = self.job_mut(tx, id)?;
        if job.status.is_terminal() {
            return Ok(None);
        }
        job.status = status;
        job.finished_at = Some(finished_at);
        Ok(Some(job.clone()))
    }

    async fn list_active(
        &self,
        tx: &mut InMemoryTransaction,
        before: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Job>> {
        Ok(tx
            .working
            .jobs(self.stage)
            .filter(|job| !job.status.is_terminal())
            .filter(|job| before.map_or(true, |cutoff| job.created_at < cutoff))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobConfigurations;
    use chrono::Duration;
    use serde_json::json;

    async fn store_with_run() -> (InMemoryStore, i64) {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let run = InMemoryRunRepository
            .create(
                &mut tx,
                NewRun::new(7, "main", JobConfigurations::enabling(&[Stage::Analyzer])),
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();
        (store, run.id)
    }

    #[tokio::test]
    async fn test_uncommitted_changes_are_discarded() {
        let (store, run_id) = store_with_run().await;
        let repository = InMemoryJobRepository::new(Stage::Analyzer);

        let mut tx = store.begin().await.unwrap();
        repository.create(&mut tx, run_id, json!({})).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.snapshot().await.job_count(Stage::Analyzer, run_id), 0);
    }

    #[tokio::test]
    async fn test_one_job_per_stage_and_run() {
        let (store, run_id) = store_with_run().await;
        let repository = InMemoryJobRepository::new(Stage::Analyzer);

        let mut tx = store.begin().await.unwrap();
        repository.create(&mut tx, run_id, json!({})).await.unwrap();
        let err = repository.create(&mut tx, run_id, json!({})).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_injected_conflict_fails_commit_once() {
        let (store, run_id) = store_with_run().await;
        let repository = InMemoryJobRepository::new(Stage::Analyzer);
        store.inject_conflicts(1);

        let mut tx = store.begin().await.unwrap();
        repository.create(&mut tx, run_id, json!({})).await.unwrap();
        assert!(tx.commit().await.unwrap_err().is_conflict());
        assert_eq!(store.pending_conflicts(), 0);

        let mut tx = store.begin().await.unwrap();
        repository.create(&mut tx, run_id, json!({})).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.snapshot().await.job_count(Stage::Analyzer, run_id), 1);
    }

    #[tokio::test]
    async fn test_try_start_and_try_complete_are_idempotent() {
        let (store, run_id) = store_with_run().await;
        let repository = InMemoryJobRepository::new(Stage::Analyzer);
        let mut tx = store.begin().await.unwrap();
        let job = repository.create(&mut tx, run_id, json!({})).await.unwrap();

        let now = Utc::now();
        let started = repository.try_start(&mut tx, job.id, now).await.unwrap();
        assert_eq!(started.unwrap().status, JobStatus::Running);
        assert!(repository.try_start(&mut tx, job.id, now).await.unwrap().is_none());

        let completed = repository
            .try_complete(&mut tx, job.id, now, JobStatus::Failed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completed.finished_at, Some(now));

        let later = now + Duration::seconds(5);
        assert!(repository
            .try_complete(&mut tx, job.id, later, JobStatus::Finished)
            .await
            .unwrap()
            .is_none());
        let stored = repository.get(&mut tx, job.id).await.unwrap().unwrap();
        assert_eq!(stored, completed);
    }

    #[tokio::test]
    async fn test_try_complete_rejects_non_terminal_status() {
        let (store, run_id) = store_with_run().await;
        let repository = InMemoryJobRepository::new(Stage::Analyzer);
        let mut tx = store.begin().await.unwrap();
        let job = repository.create(&mut tx, run_id, json!({})).await.unwrap();

        let err = repository
            .try_complete(&mut tx, job.id, Utc::now(), JobStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidUpdate { .. }));
    }

    #[tokio::test]
    async fn test_update_rejects_broken_finished_at_invariant() {
        let (store, run_id) = store_with_run().await;
        let repository = InMemoryJobRepository::new(Stage::Analyzer);
        let mut tx = store.begin().await.unwrap();
        let job = repository.create(&mut tx, run_id, json!({})).await.unwrap();

        let err = repository
            .update(&mut tx, job.id, JobUpdate::status(JobStatus::Finished))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidUpdate { .. }));

        let scheduled = repository
            .update(&mut tx, job.id, JobUpdate::status(JobStatus::Scheduled))
            .await
            .unwrap();
        assert_eq!(scheduled.status, JobStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_list_active_filters_terminal_and_recent_jobs() {
        let (store, run_id) = store_with_run().await;
        let repository = InMemoryJobRepository::new(Stage::Analyzer);
        let mut tx = store.begin().await.unwrap();
        let job = repository.create(&mut tx, run_id, json!({})).await.unwrap();

        let before_creation = job.created_at - Duration::seconds(1);
        let after_creation = job.created_at + Duration::seconds(1);
        assert_eq!(repository.list_active(&mut tx, None).await.unwrap().len(), 1);
        assert!(repository
            .list_active(&mut tx, Some(before_creation))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            repository
                .list_active(&mut tx, Some(after_creation))
                .await
                .unwrap()
                .len(),
            1
        );

        repository
            .try_complete(&mut tx, job.id, Utc::now(), JobStatus::Finished)
            .await
            .unwrap();
        assert!(repository.list_active(&mut tx, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_run_is_not_updated() {
        let (store, run_id) = store_with_run().await;
        let mut tx = store.begin().await.unwrap();
        InMemoryRunRepository
            .update(&mut tx, run_id, RunUpdate::finished(RunStatus::Failed, Utc::now()))
            .await
            .unwrap();

        let err = InMemoryRunRepository
            .update(
                &mut tx,
                run_id,
                RunUpdate::finished(RunStatus::Finished, Utc::now()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidUpdate { .. }));
    }
}
