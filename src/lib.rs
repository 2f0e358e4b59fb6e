#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Orchestrator Core
//!
//! Run orchestration engine for a multi-stage repository analysis pipeline.
//!
//! ## Overview
//!
//! A run analyses one revision of a repository through up to six stages
//! (analyzer, advisor, scanner, evaluator, reporter, notifier). Workers execute
//! the stages; this crate decides which stages may start next, creates their
//! job records, publishes work requests to per-stage queues and keeps the run
//! status in step with its jobs.
//!
//! Every inbound message is handled inside one serializable transaction.
//! Concurrent duplicate deliveries therefore never create a job twice: the
//! loser of a conflict is retried from freshly loaded state. Work requests
//! are published only after the commit.
//!
//! ## Module Organization
//!
//! - [`models`] - runs, jobs, stages and job configurations
//! - [`state_machine`] - run and job statuses and job transition events
//! - [`store`] - persistence contracts with in-memory and PostgreSQL backends
//! - [`messaging`] - message envelopes, queue transport and publisher
//! - [`orchestration`] - dependency graph, message handling, consume loop and
//!   lost job recovery
//! - [`config`] - layered configuration
//! - [`error`] - structured error handling
//! - [`logging`] / [`metrics`] - tracing setup and OpenTelemetry instruments
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use orchestrator_core::config::OrchestratorConfig;
//! use orchestrator_core::messaging::{InMemoryQueue, MessagePublisher};
//! use orchestrator_core::models::{JobConfigurations, NewRun, Stage};
//! use orchestrator_core::orchestration::Orchestrator;
//! use orchestrator_core::store::memory::InMemoryStore;
//!
//! # async fn example() -> orchestrator_core::Result<()> {
//! let config = OrchestratorConfig::default();
//! let store = InMemoryStore::new();
//! let publisher = MessagePublisher::new(Arc::new(InMemoryQueue::new()), config.queues.clone());
//! let orchestrator = Orchestrator::new(
//!     store.clone(),
//!     store.run_repository(),
//!     store.job_repositories(),
//!     publisher,
//!     config.orchestration.clone(),
//! );
//!
//! let configs = JobConfigurations::enabling(&[Stage::Analyzer, Stage::Reporter]);
//! let run = orchestrator.create_run(NewRun::new(42, "main", configs)).await?;
//! println!("created run {}", run.id);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod metrics;
pub mod models;
pub mod orchestration;
pub mod state_machine;
pub mod store;

pub use config::{ConfigManager, OrchestratorConfig};
pub use error::{OrchestratorError, Result};
pub use messaging::{Envelope, MessageHeader, MessagePublisher, OrchestratorMessage, StageRequest};
pub use models::{Job, JobConfigurations, NewRun, Run, Stage};
pub use orchestration::{
    HandleOutcome, JobLifecycle, LostJobSweeper, MessageProcessor, Orchestrator,
};
pub use state_machine::{JobEvent, JobStatus, RunStatus};
pub use store::{JobRepositories, JobRepository, RunRepository, Store, StoreTransaction};
