use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use tracing::instrument;

use super::PgTransaction;
use crate::models::{Job, JobUpdate, Stage};
use crate::state_machine::JobStatus;
use crate::store::{JobRepository, StoreError, StoreResult};

const JOB_COLUMNS: &str =
    "id, run_id, configuration, status, created_at, started_at, finished_at, error_message";

#[derive(Debug, FromRow)]
struct JobRow {
    id: i64,
    run_id: i64,
    configuration: Value,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl JobRow {
    fn into_job(self, stage: Stage) -> StoreResult<Job> {
        let status = self
            .status
            .parse::<JobStatus>()
            .map_err(|e| StoreError::decode(stage.job_table(), e))?;

        Ok(Job {
            id: self.id,
            run_id: self.run_id,
            stage,
            configuration: self.configuration,
            status,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error_message: self.error_message,
        })
    }
}

/// Job repository on the `<stage>_jobs` table of one stage
#[derive(Debug, Clone, Copy)]
pub struct PgJobRepository {
    stage: Stage,
}

impl PgJobRepository {
    pub fn new(stage: Stage) -> Self {
        Self { stage }
    }

    fn table(&self) -> &'static str {
        self.stage.job_table()
    }

    fn convert(&self, row: Option<JobRow>) -> StoreResult<Option<Job>> {
        row.map(|row| row.into_job(self.stage)).transpose()
    }
}

#[async_trait]
impl JobRepository<PgTransaction> for PgJobRepository {
    fn stage(&self) -> Stage {
        self.stage
    }

    #[instrument(skip(self, tx, configuration), fields(stage = %self.stage))]
    async fn create(
        &self,
        tx: &mut PgTransaction,
        run_id: i64,
        configuration: Value,
    ) -> StoreResult<Job> {
        let sql = format!(
            "INSERT INTO {} (run_id, configuration, status, created_at)
             VALUES ($1, $2, $3, $4)
             RETURNING {JOB_COLUMNS}",
            self.table()
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(run_id)
            .bind(configuration)
            .bind(JobStatus::Created.to_string())
            .bind(Utc::now())
            .fetch_one(tx.connection())
            .await?
            .into_job(self.stage)
    }

    async fn get(&self, tx: &mut PgTransaction, id: i64) -> StoreResult<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM {} WHERE id = $1", self.table());
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(tx.connection())
            .await?;
        self.convert(row)
    }

    async fn get_for_run(&self, tx: &mut PgTransaction, run_id: i64) -> StoreResult<Option<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {} WHERE run_id = $1",
            self.table()
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(run_id)
            .fetch_optional(tx.connection())
            .await?;
        self.convert(row)
    }

    #[instrument(skip(self, tx, update), fields(stage = %self.stage))]
    async fn update(&self, tx: &mut PgTransaction, id: i64, update: JobUpdate) -> StoreResult<Job> {
        let current = self
            .get(tx, id)
            .await?
            .ok_or_else(|| StoreError::not_found(self.table(), id))?;
        if !update.preserves_invariants(&current) {
            return Err(StoreError::invalid_update(
                "job",
                id,
                "finished_at must be set exactly for terminal statuses",
            ));
        }

        let sql = format!(
            "UPDATE {} SET
                 status = COALESCE($2, status),
                 started_at = COALESCE($3, started_at),
                 finished_at = COALESCE($4, finished_at),
                 error_message = COALESCE($5, error_message)
             WHERE id = $1
             RETURNING {JOB_COLUMNS}",
            self.table()
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .bind(update.status.map(|status| status.to_string()))
            .bind(update.started_at)
            .bind(update.finished_at)
            .bind(update.error_message)
            .fetch_one(tx.connection())
            .await?
            .into_job(self.stage)
    }

    #[instrument(skip(self, tx), fields(stage = %self.stage))]
    async fn try_start(
        &self,
        tx: &mut PgTransaction,
        id: i64,
        started_at: DateTime<Utc>,
    ) -> StoreResult<Option<Job>> {
        let sql = format!(
            "UPDATE {} SET status = 'RUNNING', started_at = $2
             WHERE id = $1 AND status IN ('CREATED', 'SCHEDULED')
             RETURNING {JOB_COLUMNS}",
            self.table()
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .bind(started_at)
            .fetch_optional(tx.connection())
            .await?;

        if row.is_none() && self.get(tx, id).await?.is_none() {
            return Err(StoreError::not_found(self.table(), id));
        }
        self.convert(row)
    }

    #[instrument(skip(self, tx), fields(stage = %self.stage))]
    async fn try_complete(
        &self,
        tx: &mut PgTransaction,
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

        let sql = format!(
            "UPDATE {} SET status = $2, finished_at = $3
             WHERE id = $1 AND status IN ('CREATED', 'SCHEDULED', 'RUNNING')
             RETURNING {JOB_COLUMNS}",
            self.table()
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .bind(status.to_string())
            .bind(finished_at)
            .fetch_optional(tx.connection())
            .await?;

        if row.is_none() && self.get(tx, id).await?.is_none() {
            return Err(StoreError::not_found(self.table(), id));
        }
        self.convert(row)
    }

    async fn list_active(
        &self,
        tx: &mut PgTransaction,
        before: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {}
             WHERE status IN ('CREATED', 'SCHEDULED', 'RUNNING')
               AND ($1::timestamptz IS NULL OR created_at < $1)
             ORDER BY created_at",
            self.table()
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(before)
            .fetch_all(tx.connection())
            .await?
            .into_iter()
            .map(|row| row.into_job(self.stage))
            .collect()
    }
}
