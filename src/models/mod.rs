//! # Models
//!
//! Data types persisted by the store backends and exchanged with workers.

pub mod job;
pub mod job_configurations;
pub mod run;
pub mod stage;

// Re-export core models for easy access
pub use job::{Job, JobUpdate};
pub use job_configurations::JobConfigurations;
pub use run::{NewRun, Run, RunUpdate};
pub use stage::Stage;
