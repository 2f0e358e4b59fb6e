//! Shared harness for orchestrator integration tests: an in-memory store and
//! queue wired to an [`Orchestrator`], plus shortcuts for driving runs.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use orchestrator_core::config::{OrchestrationConfig, OrchestratorConfig, SweeperConfig};
use orchestrator_core::error::Result;
use orchestrator_core::messaging::{
    Envelope, InMemoryQueue, MessageHeader, MessagePublisher, OrchestratorMessage, QueueClient,
    StageRequest,
};
use orchestrator_core::models::{Job, JobConfigurations, NewRun, Run, Stage};
use orchestrator_core::orchestration::{
    HandleOutcome, LostJobSweeper, MessageProcessor, Orchestrator,
};
use orchestrator_core::store::memory::InMemoryStore;

pub struct TestHarness {
    pub store: InMemoryStore,
    pub queue: Arc<InMemoryQueue>,
    pub orchestrator: Arc<Orchestrator<InMemoryStore>>,
    pub config: OrchestratorConfig,
}

/// Orchestration settings with millisecond backoffs
pub fn fast_orchestration_config() -> OrchestrationConfig {
    OrchestrationConfig {
        transaction_attempts: 3,
        retry_backoff_ms: 1,
        max_retry_backoff_ms: 2,
        polling_interval_ms: 10,
        ..OrchestrationConfig::default()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_orchestration_config(fast_orchestration_config())
    }

    pub fn with_orchestration_config(orchestration: OrchestrationConfig) -> Self {
        let config = OrchestratorConfig {
            orchestration,
            ..OrchestratorConfig::default()
        };
        let store = InMemoryStore::new();
        let queue = Arc::new(InMemoryQueue::new());
        let publisher = MessagePublisher::new(
            Arc::clone(&queue) as Arc<dyn QueueClient>,
            config.queues.clone(),
        );
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            store.run_repository(),
            store.job_repositories(),
            publisher,
            config.orchestration.clone(),
        ));

        Self {
            store,
            queue,
            orchestrator,
            config,
        }
    }

    pub fn processor(&self) -> MessageProcessor<InMemoryStore> {
        MessageProcessor::new(
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.queue) as Arc<dyn QueueClient>,
        )
    }

    pub fn sweeper(&self) -> LostJobSweeper<InMemoryStore> {
        LostJobSweeper::new(Arc::clone(&self.orchestrator), SweeperConfig::default())
    }

    pub fn orchestrator_queue(&self) -> &str {
        &self.config.queues.orchestrator_queue
    }

    /// Create a run enabling `stages` and process its `RunCreated` message
    pub async fn start_run(&self, stages: &[Stage]) -> i64 {
        let run = self
            .orchestrator
            .create_run(NewRun::new(7, "deadbeef", JobConfigurations::enabling(stages)))
            .await
            .expect("run created");
        let report = self.processor().process_batch().await.expect("batch processed");
        assert_eq!(report.handled, 1, "RunCreated handled");
        run.id
    }

    /// Hand `message` about `run_id` straight to the orchestrator
    pub async fn deliver(&self, run_id: i64, message: OrchestratorMessage) -> Result<HandleOutcome> {
        let envelope = Envelope::new(MessageHeader::new("test-trace", run_id), message);
        self.orchestrator.handle(&envelope).await
    }

    pub fn stage_result(&self, stage: Stage, job_id: i64, has_issues: bool) -> OrchestratorMessage {
        OrchestratorMessage::StageResult {
            stage,
            job_id,
            has_issues,
        }
    }

    /// Report that the job of `stage` finished
    pub async fn succeed(&self, run_id: i64, stage: Stage, has_issues: bool) -> HandleOutcome {
        let job = self.job(run_id, stage).await.expect("job exists");
        self.deliver(run_id, self.stage_result(stage, job.id, has_issues))
            .await
            .expect("stage result handled")
    }

    /// Report that the job of `stage` failed
    pub async fn fail(&self, run_id: i64, stage: Stage, message: &str) -> HandleOutcome {
        let job = self.job(run_id, stage).await.expect("job exists");
        self.deliver(
            run_id,
            OrchestratorMessage::StageError {
                stage,
                job_id: job.id,
                message: message.to_string(),
            },
        )
        .await
        .expect("stage error handled")
    }

    pub async fn run(&self, run_id: i64) -> Run {
        self.store
            .snapshot()
            .await
            .run(run_id)
            .cloned()
            .expect("run exists")
    }

    pub async fn jobs(&self, run_id: i64) -> BTreeMap<Stage, Job> {
        self.store.snapshot().await.jobs_for_run(run_id)
    }

    pub async fn job(&self, run_id: i64, stage: Stage) -> Option<Job> {
        self.jobs(run_id).await.remove(&stage)
    }

    pub async fn job_count(&self, run_id: i64, stage: Stage) -> usize {
        self.store.snapshot().await.job_count(stage, run_id)
    }

    /// Work requests waiting on the queue of `stage`
    pub fn requests(&self, stage: Stage) -> Vec<StageRequest> {
        self.queue
            .messages(&self.config.queues.stage_queue(stage))
            .into_iter()
            .map(|message| {
                Envelope::<StageRequest>::from_json(message)
                    .expect("stage request decodes")
                    .payload
            })
            .collect()
    }
}
