//! # Messaging Error Types
//!
//! Transport failures carry the queue and operation they happened on;
//! encoding failures are split so undecodable messages can be dropped.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessagingError {
    #[error("Queue operation failed: {queue_name}: {operation}: {message}")]
    QueueOperation {
        queue_name: String,
        operation: String,
        message: String,
    },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },

    #[error("Message deserialization error: {message}")]
    MessageDeserialization { message: String },
}

impl MessagingError {
    pub fn queue_operation(
        queue_name: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn queue_not_found(queue_name: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue_name: queue_name.into(),
        }
    }

    /// Wrap a pgmq failure with the queue and operation it happened on
    #[cfg(feature = "postgres")]
    pub fn pgmq(
        queue_name: impl Into<String>,
        operation: impl Into<String>,
        err: pgmq::errors::PgmqError,
    ) -> Self {
        Self::queue_operation(queue_name, operation, err.to_string())
    }

    /// A message that cannot be decoded will never be; redelivery is pointless
    pub fn is_poison_message(&self) -> bool {
        matches!(self, Self::MessageDeserialization { .. })
    }
}

/// Decoding is the only fallible direction on the consuming side
impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::MessageDeserialization {
            message: err.to_string(),
        }
    }
}

/// Result type alias for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;
