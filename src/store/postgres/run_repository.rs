use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use std::collections::HashMap;
use tracing::instrument;

use super::PgTransaction;
use crate::models::{JobConfigurations, NewRun, Run, RunUpdate};
use crate::state_machine::RunStatus;
use crate::store::{RunRepository, StoreError, StoreResult};

const RUN_COLUMNS: &str =
    "id, repository_id, revision, status, job_configs, trace_id, labels, created_at, finished_at";

#[derive(Debug, FromRow)]
struct RunRow {
    id: i64,
    repository_id: i64,
    revision: String,
    status: String,
    job_configs: Value,
    trace_id: Option<String>,
    labels: Value,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<RunRow> for Run {
    type Error = StoreError;

    fn try_from(row: RunRow) -> StoreResult<Self> {
        let status = row
            .status
            .parse::<RunStatus>()
            .map_err(|e| StoreError::decode("runs", e))?;
        let job_configs: JobConfigurations = serde_json::from_value(row.job_configs)?;
        let labels: HashMap<String, String> = serde_json::from_value(row.labels)?;

        Ok(Run {
            id: row.id,
            repository_id: row.repository_id,
            revision: row.revision,
            status,
            job_configs,
            trace_id: row.trace_id,
            labels,
            created_at: row.created_at,
            finished_at: row.finished_at,
        })
    }
}

/// Run repository on the `runs` table
#[derive(Debug, Clone, Copy, Default)]
pub struct PgRunRepository;

#[async_trait]
impl RunRepository<PgTransaction> for PgRunRepository {
    #[instrument(skip(self, tx, new_run), fields(repository_id = new_run.repository_id))]
    async fn create(&self, tx: &mut PgTransaction, new_run: NewRun) -> StoreResult<Run> {
        let sql = format!(
            "INSERT INTO runs (repository_id, revision, status, job_configs, trace_id, labels, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {RUN_COLUMNS}"
        );
        let row = sqlx::query_as::<_, RunRow>(&sql)
            .bind(new_run.repository_id)
            .bind(&new_run.revision)
            .bind(RunStatus::Created.to_string())
            .bind(serde_json::to_value(&new_run.job_configs)?)
            .bind(&new_run.trace_id)
            .bind(serde_json::to_value(&new_run.labels)?)
            .bind(Utc::now())
            .fetch_one(tx.connection())
            .await?;
        row.try_into()
    }

    async fn get(&self, tx: &mut PgTransaction, id: i64) -> StoreResult<Option<Run>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1");
        sqlx::query_as::<_, RunRow>(&sql)
            .bind(id)
            .fetch_optional(tx.connection())
            .await?
            .map(Run::try_from)
            .transpose()
    }

    #[instrument(skip(self, tx), fields(status = %update.status))]
    async fn update(&self, tx: &mut PgTransaction, id: i64, update: RunUpdate) -> StoreResult<Run> {
        if !update.is_consistent() {
            return Err(StoreError::invalid_update(
                "run",
                id,
                "finished_at must be set exactly for terminal statuses",
            ));
        }

        let sql = format!(
            "UPDATE runs SET status = $2, finished_at = $3
             WHERE id = $1 AND status NOT IN ('FAILED', 'FINISHED', 'FINISHED_WITH_ISSUES')
             RETURNING {RUN_COLUMNS}"
        );
        let updated = sqlx::query_as::<_, RunRow>(&sql)
            .bind(id)
            .bind(update.status.to_string())
            .bind(update.finished_at)
            .fetch_optional(tx.connection())
            .await?;

        match updated {
            Some(row) => row.try_into(),
            None => match self.get(tx, id).await? {
                Some(run) => Err(StoreError::invalid_update(
                    "run",
                    id,
                    format!("run is already {}", run.status),
                )),
                None => Err(StoreError::not_found("run", id)),
            },
        }
    }
}
