//! # Store Error Types
//!
//! Errors raised by the run and job repositories, independent of the backend.

use thiserror::Error;

use crate::models::Stage;

/// SQLSTATE raised when a serializable transaction cannot be committed
const SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE raised when Postgres breaks a deadlock
const DEADLOCK_DETECTED: &str = "40P01";
/// SQLSTATE raised by the one-job-per-run unique constraints
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// A concurrent transaction conflicted with this one; the caller retries
    #[error("Transaction conflict: {reason}")]
    Conflict { reason: String },

    #[error("Database error: {operation}: {message}")]
    Database { operation: String, message: String },

    #[error("Record not found: {entity} {id}")]
    NotFound { entity: String, id: i64 },

    #[error("Invalid update for {entity} {id}: {reason}")]
    InvalidUpdate {
        entity: String,
        id: i64,
        reason: String,
    },

    #[error("Corrupt record in {entity}: {reason}")]
    Decode { entity: String, reason: String },

    #[error("No job repository registered for stage {stage}")]
    MissingRepository { stage: Stage },
}

impl StoreError {
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    pub fn database(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>, id: i64) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id,
        }
    }

    pub fn invalid_update(entity: impl Into<String>, id: i64, reason: impl Into<String>) -> Self {
        Self::InvalidUpdate {
            entity: entity.into(),
            id,
            reason: reason.into(),
        }
    }

    pub fn decode(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the whole unit of work may succeed
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Conversion from sqlx::Error to StoreError
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) | Some(UNIQUE_VIOLATION) => {
                    StoreError::conflict(db_err.message().to_string())
                }
                _ => StoreError::database("query", db_err.to_string()),
            },
            sqlx::Error::RowNotFound => StoreError::database("query", "No rows found"),
            sqlx::Error::PoolTimedOut => StoreError::database("acquire", "Connection pool timed out"),
            sqlx::Error::PoolClosed => StoreError::database("acquire", "Database pool is closed"),
            _ => StoreError::database("connection", err.to_string()),
        }
    }
}

/// Conversion from serde_json::Error for JSON columns
impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::decode("json column", err.to_string())
    }
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;
