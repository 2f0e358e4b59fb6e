//! End-to-end scheduling scenarios over the in-memory store and queue.

mod common;

use std::sync::Arc;

use common::{fast_orchestration_config, TestHarness};
use orchestrator_core::messaging::OrchestratorMessage;
use orchestrator_core::models::Stage;
use orchestrator_core::orchestration::WORKER_INFRASTRUCTURE_ERROR_MESSAGE;
use orchestrator_core::state_machine::{JobStatus, RunStatus};
use orchestrator_core::{JobLifecycle, OrchestratorError};

#[tokio::test]
async fn test_analysis_then_report() {
    let harness = TestHarness::new();
    let run_id = harness
        .start_run(&[Stage::Analyzer, Stage::Reporter])
        .await;

    let analyzer = harness.job(run_id, Stage::Analyzer).await.unwrap();
    assert_eq!(analyzer.status, JobStatus::Scheduled);
    assert_eq!(harness.requests(Stage::Analyzer).len(), 1);
    assert_eq!(harness.run(run_id).await.status, RunStatus::Active);
    assert!(harness.job(run_id, Stage::Reporter).await.is_none());

    let outcome = harness.succeed(run_id, Stage::Analyzer, false).await;
    let reporter = harness.job(run_id, Stage::Reporter).await.unwrap();
    assert_eq!(outcome.created, vec![(Stage::Reporter, reporter.id)]);
    assert_eq!(outcome.scheduled, vec![(Stage::Reporter, reporter.id)]);
    assert_eq!(reporter.status, JobStatus::Scheduled);
    assert_eq!(harness.requests(Stage::Reporter)[0].job_id, reporter.id);

    let outcome = harness.succeed(run_id, Stage::Reporter, false).await;
    assert!(outcome.created.is_empty());
    assert_eq!(outcome.run_status, RunStatus::Finished);

    let run = harness.run(run_id).await;
    assert_eq!(run.status, RunStatus::Finished);
    assert!(run.finished_at.is_some());

    let jobs = harness.jobs(run_id).await;
    assert_eq!(
        jobs.keys().copied().collect::<Vec<_>>(),
        vec![Stage::Analyzer, Stage::Reporter]
    );
}

#[tokio::test]
async fn test_evaluator_waits_for_advisor_and_scanner() {
    let harness = TestHarness::new();
    let run_id = harness
        .start_run(&[
            Stage::Analyzer,
            Stage::Advisor,
            Stage::Scanner,
            Stage::Evaluator,
            Stage::Reporter,
        ])
        .await;

    let outcome = harness.succeed(run_id, Stage::Analyzer, false).await;
    let created: Vec<Stage> = outcome.created.iter().map(|(stage, _)| *stage).collect();
    assert_eq!(created, vec![Stage::Advisor, Stage::Scanner]);

    let outcome = harness.succeed(run_id, Stage::Advisor, false).await;
    assert!(outcome.created.is_empty());
    assert!(harness.job(run_id, Stage::Evaluator).await.is_none());
    assert!(harness.job(run_id, Stage::Reporter).await.is_none());

    let outcome = harness.succeed(run_id, Stage::Scanner, false).await;
    let created: Vec<Stage> = outcome.created.iter().map(|(stage, _)| *stage).collect();
    assert_eq!(created, vec![Stage::Evaluator]);

    let outcome = harness.succeed(run_id, Stage::Evaluator, false).await;
    let created: Vec<Stage> = outcome.created.iter().map(|(stage, _)| *stage).collect();
    assert_eq!(created, vec![Stage::Reporter]);

    let outcome = harness.succeed(run_id, Stage::Reporter, false).await;
    assert_eq!(outcome.run_status, RunStatus::Finished);
}

#[tokio::test]
async fn test_analysis_failure_still_reports_and_run_stays_failed() {
    let harness = TestHarness::new();
    let run_id = harness
        .start_run(&[
            Stage::Analyzer,
            Stage::Advisor,
            Stage::Scanner,
            Stage::Evaluator,
            Stage::Reporter,
        ])
        .await;

    let outcome = harness.fail(run_id, Stage::Analyzer, "analysis crashed").await;
    let created: Vec<Stage> = outcome.created.iter().map(|(stage, _)| *stage).collect();
    assert_eq!(created, vec![Stage::Reporter]);
    assert_eq!(outcome.run_status, RunStatus::Failed);

    let failed_run = harness.run(run_id).await;
    assert_eq!(failed_run.status, RunStatus::Failed);
    assert!(failed_run.finished_at.is_some());

    let analyzer = harness.job(run_id, Stage::Analyzer).await.unwrap();
    assert_eq!(analyzer.status, JobStatus::Failed);
    assert_eq!(analyzer.error_message.as_deref(), Some("analysis crashed"));

    let outcome = harness.succeed(run_id, Stage::Reporter, false).await;
    assert!(outcome.created.is_empty());
    assert_eq!(outcome.run_status, RunStatus::Failed);

    let run = harness.run(run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.finished_at, failed_run.finished_at);

    for stage in [Stage::Advisor, Stage::Scanner, Stage::Evaluator] {
        assert!(harness.job(run_id, stage).await.is_none(), "{stage} never created");
    }
}

#[tokio::test]
async fn test_duplicate_stage_error_is_a_no_op() {
    let harness = TestHarness::new();
    let run_id = harness
        .start_run(&[Stage::Analyzer, Stage::Reporter])
        .await;
    let analyzer_id = harness.job(run_id, Stage::Analyzer).await.unwrap().id;
    let error = OrchestratorMessage::StageError {
        stage: Stage::Analyzer,
        job_id: analyzer_id,
        message: "first delivery".to_string(),
    };

    harness.deliver(run_id, error.clone()).await.unwrap();
    let jobs_after_first = harness.jobs(run_id).await;
    let run_after_first = harness.run(run_id).await;

    let outcome = harness.deliver(run_id, error).await.unwrap();
    assert!(outcome.created.is_empty());
    assert!(outcome.scheduled.is_empty());
    assert_eq!(harness.jobs(run_id).await, jobs_after_first);
    assert_eq!(harness.run(run_id).await, run_after_first);
    assert_eq!(harness.job_count(run_id, Stage::Reporter).await, 1);
    assert_eq!(harness.requests(Stage::Reporter).len(), 1);
}

#[tokio::test]
async fn test_duplicate_stage_result_does_not_reschedule() {
    let harness = TestHarness::new();
    let run_id = harness
        .start_run(&[Stage::Analyzer, Stage::Scanner])
        .await;

    harness.succeed(run_id, Stage::Analyzer, false).await;
    let outcome = harness.succeed(run_id, Stage::Analyzer, true).await;

    assert!(outcome.created.is_empty());
    let analyzer = harness.job(run_id, Stage::Analyzer).await.unwrap();
    assert_eq!(analyzer.status, JobStatus::Finished);
    assert_eq!(harness.requests(Stage::Scanner).len(), 1);
}

#[tokio::test]
async fn test_issues_finish_run_with_issues() {
    let harness = TestHarness::new();
    let run_id = harness
        .start_run(&[Stage::Analyzer, Stage::Scanner])
        .await;

    harness.succeed(run_id, Stage::Analyzer, false).await;
    let outcome = harness.succeed(run_id, Stage::Scanner, true).await;

    assert_eq!(outcome.run_status, RunStatus::FinishedWithIssues);
    let scanner = harness.job(run_id, Stage::Scanner).await.unwrap();
    assert_eq!(scanner.status, JobStatus::FinishedWithIssues);
}

#[tokio::test]
async fn test_notifier_runs_after_reporter_of_failed_run() {
    let harness = TestHarness::new();
    let run_id = harness
        .start_run(&[Stage::Analyzer, Stage::Reporter, Stage::Notifier])
        .await;

    harness.fail(run_id, Stage::Analyzer, "boom").await;
    assert!(harness.job(run_id, Stage::Notifier).await.is_none());

    let outcome = harness.succeed(run_id, Stage::Reporter, false).await;
    let created: Vec<Stage> = outcome.created.iter().map(|(stage, _)| *stage).collect();
    assert_eq!(created, vec![Stage::Notifier]);

    let outcome = harness.succeed(run_id, Stage::Notifier, false).await;
    assert_eq!(outcome.run_status, RunStatus::Failed);
}

#[tokio::test]
async fn test_stage_without_edges_starts_immediately() {
    let harness = TestHarness::new();
    let run_id = harness.start_run(&[Stage::Reporter]).await;

    let reporter = harness.job(run_id, Stage::Reporter).await.unwrap();
    assert_eq!(reporter.status, JobStatus::Scheduled);
}

#[tokio::test]
async fn test_worker_infrastructure_error_fails_job_and_run() {
    let harness = TestHarness::new();
    let run_id = harness
        .start_run(&[Stage::Analyzer, Stage::Reporter])
        .await;

    let outcome = harness
        .deliver(
            run_id,
            OrchestratorMessage::WorkerInfrastructureError {
                stage: Stage::Analyzer,
                run_id,
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.run_status, RunStatus::Failed);
    let analyzer = harness.job(run_id, Stage::Analyzer).await.unwrap();
    assert_eq!(analyzer.status, JobStatus::Failed);
    assert_eq!(
        analyzer.error_message.as_deref(),
        Some(WORKER_INFRASTRUCTURE_ERROR_MESSAGE)
    );
    assert!(harness.job(run_id, Stage::Reporter).await.is_some());
}

#[tokio::test]
async fn test_stage_error_after_worker_marked_job_failed() {
    let harness = TestHarness::new();
    let run_id = harness
        .start_run(&[Stage::Analyzer, Stage::Reporter])
        .await;
    let analyzer_id = harness.job(run_id, Stage::Analyzer).await.unwrap().id;
    let lifecycle = JobLifecycle::new(
        Arc::new(harness.store.clone()),
        harness.store.job_repositories(),
        fast_orchestration_config(),
    );
    lifecycle.start(Stage::Analyzer, analyzer_id).await.unwrap();
    lifecycle
        .complete(Stage::Analyzer, analyzer_id, JobStatus::Failed)
        .await
        .unwrap();

    let outcome = harness.fail(run_id, Stage::Analyzer, "boom").await;

    assert_eq!(outcome.run_status, RunStatus::Failed);
    let run = harness.run(run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.finished_at.is_some());
    let analyzer = harness.job(run_id, Stage::Analyzer).await.unwrap();
    assert_eq!(analyzer.status, JobStatus::Failed);
    assert_eq!(analyzer.error_message.as_deref(), Some("boom"));
    assert!(harness.job(run_id, Stage::Reporter).await.is_some());
}

#[tokio::test]
async fn test_stage_result_after_worker_marked_job_failed() {
    let harness = TestHarness::new();
    let run_id = harness.start_run(&[Stage::Analyzer]).await;
    let analyzer_id = harness.job(run_id, Stage::Analyzer).await.unwrap().id;
    let lifecycle = JobLifecycle::new(
        Arc::new(harness.store.clone()),
        harness.store.job_repositories(),
        fast_orchestration_config(),
    );
    lifecycle
        .complete(Stage::Analyzer, analyzer_id, JobStatus::Failed)
        .await
        .unwrap();

    let outcome = harness.succeed(run_id, Stage::Analyzer, false).await;

    assert_eq!(outcome.run_status, RunStatus::Failed);
    assert_eq!(harness.run(run_id).await.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_worker_infrastructure_error_for_missing_job() {
    let harness = TestHarness::new();
    let run_id = harness
        .start_run(&[Stage::Analyzer, Stage::Reporter])
        .await;

    let err = harness
        .deliver(
            run_id,
            OrchestratorMessage::WorkerInfrastructureError {
                stage: Stage::Reporter,
                run_id,
            },
        )
        .await
        .unwrap_err();

    assert_eq!(
        err,
        OrchestratorError::RunJobNotFound {
            stage: Stage::Reporter,
            run_id
        }
    );
    assert!(err.is_not_found());
    assert_eq!(harness.run(run_id).await.status, RunStatus::Active);
}

#[tokio::test]
async fn test_unknown_run_and_job_are_not_found() {
    let harness = TestHarness::new();

    let err = harness
        .deliver(99, OrchestratorMessage::RunCreated { run_id: 99 })
        .await
        .unwrap_err();
    assert_eq!(err, OrchestratorError::RunNotFound { run_id: 99 });

    let err = harness
        .deliver(99, harness.stage_result(Stage::Scanner, 1234, false))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        OrchestratorError::JobNotFound {
            stage: Stage::Scanner,
            job_id: 1234
        }
    );
}

#[tokio::test]
async fn test_run_created_twice_creates_jobs_once() {
    let harness = TestHarness::new();
    let run_id = harness.start_run(&[Stage::Analyzer]).await;

    let outcome = harness
        .deliver(run_id, OrchestratorMessage::RunCreated { run_id })
        .await
        .unwrap();

    assert!(outcome.created.is_empty());
    assert_eq!(harness.job_count(run_id, Stage::Analyzer).await, 1);
    assert_eq!(harness.requests(Stage::Analyzer).len(), 1);
}

#[tokio::test]
async fn test_create_run_generates_trace_id_and_announces_run() {
    let harness = TestHarness::new();
    let run = harness
        .orchestrator
        .create_run(orchestrator_core::NewRun::new(
            1,
            "abc",
            orchestrator_core::JobConfigurations::enabling(&[Stage::Analyzer]),
        ))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Created);
    assert!(run.trace_id.is_some());

    let announced = harness.queue.messages(harness.orchestrator_queue());
    assert_eq!(announced.len(), 1);
    assert_eq!(announced[0]["payload"]["type"], "run_created");
    assert_eq!(announced[0]["payload"]["data"]["run_id"], run.id);
    assert_eq!(
        announced[0]["header"]["trace_id"].as_str(),
        run.trace_id.as_deref()
    );
}
