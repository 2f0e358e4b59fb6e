//! # Orchestration
//!
//! Decides which pipeline stages of a run start next and keeps the run status
//! in step with its jobs.
//!
//! ## Components
//!
//! - [`dependency_graph`]: the fixed stage topology and the startable/pending
//!   predicates over it
//! - [`SchedulingContext`]: one run and its jobs, loaded per message inside a
//!   serializable transaction
//! - [`Orchestrator`]: single entry point for inbound messages, retries
//!   conflicting attempts and publishes work requests after the commit
//! - [`MessageProcessor`]: consume loop of the orchestrator queue
//! - [`LostJobSweeper`]: recovers jobs whose work request was never published
//! - [`JobLifecycle`]: start/complete helpers for workers sharing the store

pub mod dependency_graph;
pub mod lifecycle;
pub mod lost_job_sweeper;
pub mod message_processor;
pub mod orchestrator;
pub mod retry;
pub mod scheduling_context;

pub use dependency_graph::{StageDescriptor, STAGE_DESCRIPTORS};
pub use lifecycle::JobLifecycle;
pub use lost_job_sweeper::{LostJobSweeper, SweepReport, LOST_JOB_MESSAGE};
pub use message_processor::{BatchReport, MessageProcessor};
pub use orchestrator::{HandleOutcome, Orchestrator, WORKER_INFRASTRUCTURE_ERROR_MESSAGE};
pub use retry::with_retries;
pub use scheduling_context::{SchedulingContext, SchedulingPlan};
