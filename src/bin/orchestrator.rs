//! Orchestrator Binary
//!
//! Runs the message processor of the orchestrator queue and the lost job
//! sweeper against PostgreSQL and pgmq until Ctrl-C.

use anyhow::Context;
use futures::future::join_all;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use orchestrator_core::config::ConfigManager;
use orchestrator_core::logging::init_structured_logging;
use orchestrator_core::messaging::{MessagePublisher, PgmqClient, QueueClient};
use orchestrator_core::orchestration::{LostJobSweeper, MessageProcessor, Orchestrator};
use orchestrator_core::store::postgres::PgStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let manager = ConfigManager::load().context("loading configuration")?;
    let config = manager.config();
    init_structured_logging(&config.logging);

    info!(environment = manager.environment(), "Starting orchestrator");

    let store = PgStore::connect(
        &config.database.url,
        config.database.max_connections,
        config.database.acquire_timeout(),
    )
    .await
    .context("connecting to database")?;
    store.migrate().await.context("running migrations")?;

    let client: Arc<dyn QueueClient> =
        Arc::new(PgmqClient::new_with_pool(store.pool().clone()).await);
    let publisher = MessagePublisher::new(Arc::clone(&client), config.queues.clone());
    publisher
        .ensure_queues()
        .await
        .context("creating queues")?;

    let runs = store.run_repository();
    let jobs = store.job_repositories();
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        runs,
        jobs,
        publisher,
        config.orchestration.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut services = Vec::new();

    let processor = MessageProcessor::new(Arc::clone(&orchestrator), client);
    let processor_shutdown = shutdown_rx.clone();
    services.push(tokio::spawn(async move {
        processor.run(processor_shutdown).await
    }));

    if config.sweeper.enabled {
        let sweeper = LostJobSweeper::new(Arc::clone(&orchestrator), config.sweeper.clone());
        let sweeper_shutdown = shutdown_rx.clone();
        services.push(tokio::spawn(async move {
            sweeper.run(sweeper_shutdown).await
        }));
    } else {
        info!("Lost job sweeper disabled");
    }

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Shutdown signal received");
    shutdown_tx.send(true).ok();

    for result in join_all(services).await {
        if let Err(e) = result {
            error!(error = %e, "Background service failed");
        }
    }

    info!("Orchestrator stopped");
    Ok(())
}
