//! Error types for the bridge relayer

use crate::events::{ChainRole, EventType, OperationId};
use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Transient network error on chain {chain_id}: {message}")]
    TransientNetwork { chain_id: u64, message: String },

    #[error("Event decode error: {0}")]
    Decode(String),

    #[error("Unknown event type {0}")]
    UnknownEvent(String),

    #[error("Event {event_type} is not expected on the {role} chain")]
    UnexpectedOrigin { event_type: EventType, role: ChainRole },

    #[error("Precondition {missing} not met for operation {operation_id}")]
    PreconditionNotMet {
        operation_id: OperationId,
        missing: EventType,
    },

    #[error("Submission reverted on chain {chain_id}: {message}")]
    SubmissionReverted { chain_id: u64, message: String },

    #[error("Operation {0} is locked by another worker")]
    LockContention(OperationId),

    #[error("Operation {0} is archived")]
    OperationArchived(OperationId),

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::TransientNetwork { .. }
                | RelayerError::PreconditionNotMet { .. }
                | RelayerError::LockContention(_)
                | RelayerError::Broker(_)
        )
    }

    /// Check if error should trigger an operator alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::UnknownEvent(_)
                | RelayerError::UnexpectedOrigin { .. }
                | RelayerError::SubmissionReverted { .. }
                | RelayerError::Storage(_)
        )
    }

    /// Storage failures leave the process on unknown state; it must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayerError::Storage(_))
    }
}

impl From<sqlx::Error> for RelayerError {
    fn from(err: sqlx::Error) -> Self {
        RelayerError::Storage(err.to_string())
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
