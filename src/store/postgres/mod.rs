//! # Postgres Store
//!
//! [`Store`] implementation on a `sqlx` Postgres pool. Runs live in `runs`,
//! the jobs of each stage in their own `<stage>_jobs` table.

mod job_repository;
mod run_repository;

pub use job_repository::PgJobRepository;
pub use run_repository::PgRunRepository;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{PgConnection, Postgres, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::{JobRepositories, JobRepository, RunRepository, Store, StoreError, StoreResult, StoreTransaction};

/// Embedded schema migrations
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Store backed by a Postgres connection pool
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool for `database_url`
    #[instrument(skip(database_url))]
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;
        info!(max_connections, "Connected to database");
        Ok(Self::new(pool))
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> StoreResult<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::database("migrate", e.to_string()))?;
        info!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn run_repository(&self) -> Arc<dyn RunRepository<PgTransaction>> {
        Arc::new(PgRunRepository)
    }

    pub fn job_repositories(&self) -> JobRepositories<PgTransaction> {
        JobRepositories::from_fn(|stage| {
            Arc::new(PgJobRepository::new(stage)) as Arc<dyn JobRepository<PgTransaction>>
        })
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTransaction;

    async fn begin(&self) -> StoreResult<PgTransaction> {
        let mut inner = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *inner)
            .await?;
        debug!("Serializable transaction started");
        Ok(PgTransaction { inner })
    }
}

/// Open serializable Postgres transaction
pub struct PgTransaction {
    inner: Transaction<'static, Postgres>,
}

impl PgTransaction {
    pub(crate) fn connection(&mut self) -> &mut PgConnection {
        &mut self.inner
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn commit(self) -> StoreResult<()> {
        self.inner.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        self.inner.rollback().await?;
        Ok(())
    }
}
