//! # Orchestrator Errors
//!
//! Top-level error of message handling, classified by how the message
//! processor reacts to it.

use thiserror::Error;

use crate::config::ConfigurationError;
use crate::messaging::MessagingError;
use crate::models::Stage;
use crate::store::StoreError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("Run {run_id} not found")]
    RunNotFound { run_id: i64 },

    #[error("{stage} job {job_id} not found")]
    JobNotFound { stage: Stage, job_id: i64 },

    #[error("Run {run_id} has no {stage} job")]
    RunJobNotFound { stage: Stage, run_id: i64 },

    #[error("Transaction conflict persisted after {attempts} attempts: {reason}")]
    ConflictRetriesExhausted { attempts: u32, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl OrchestratorError {
    /// The message refers to data that does not exist; it will never succeed
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::RunNotFound { .. }
                | Self::JobNotFound { .. }
                | Self::RunJobNotFound { .. }
                | Self::Store(StoreError::NotFound { .. })
        )
    }

    /// A fresh attempt with a new transaction may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_conflict())
    }
}

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;
