//! Error types for the outbox engine.
//!
//! Most of these never reach the scheduler: the engine logs them and leaves
//! the affected row for the next cycle or the reaper. They exist so the
//! store and broker boundaries can say *what* went wrong and the engine can
//! tell benign races from real failures.

use std::time::Duration;
use thiserror::Error;

use crate::event::{EventId, OutboxStatus};

/// Boxed driver error carried across the store and broker boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure reported by an [`EventStore`](crate::EventStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying database failed.
    #[error("database error: {0}")]
    Database(#[source] BoxError),

    /// A versioned write found the row changed since it was read.
    #[error("event {id} was modified concurrently (expected version {expected_version})")]
    Conflict { id: EventId, expected_version: i32 },

    /// An in-process lock guarding the store was poisoned.
    #[error("store lock poisoned")]
    Poisoned,

    /// A stored value could not be mapped back into an event.
    #[error("failed to decode outbox row: {0}")]
    Decode(String),
}

impl StoreError {
    /// Wrap any driver error.
    pub fn database<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Database(Box::new(err))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Failure reported by a [`Broker`](crate::Broker), either synchronously
/// (the send was never accepted) or through the delivery future.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker refused the record.
    #[error("broker rejected record: {0}")]
    Rejected(String),

    /// No acknowledgment within the client's send timeout.
    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    /// The broker could not be reached.
    #[error("broker unavailable: {0}")]
    Unavailable(#[source] BoxError),
}

impl BrokerError {
    pub fn unavailable<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        BrokerError::Unavailable(Box::new(err))
    }
}

/// Invalid relay configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("batch_limit must be greater than zero")]
    ZeroBatchLimit,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("topic must not be empty")]
    EmptyTopic,

    #[error("lease_timeout_secs {0} is too large")]
    LeaseTimeoutOutOfRange(u64),
}

/// Umbrella error for engine entry points.
#[derive(Debug, Error)]
pub enum OutflowError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Only COMPLETED and FAILED may be written after a send.
    #[error("status {0} cannot be written by the status tracker")]
    InvalidTransition(OutboxStatus),

    /// The lease timeout does not fit in a timestamp offset.
    #[error("lease timeout {0:?} is out of range")]
    LeaseOutOfRange(Duration),
}

/// Result alias used across the engine.
pub type OutflowResult<T> = Result<T, OutflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_recognised() {
        let err = StoreError::Conflict {
            id: 7,
            expected_version: 2,
        };
        assert!(err.is_conflict());
        assert_eq!(
            err.to_string(),
            "event 7 was modified concurrently (expected version 2)"
        );
        assert!(!StoreError::Poisoned.is_conflict());
    }

    #[test]
    fn store_error_converts_into_outflow_error() {
        let err: OutflowError = StoreError::Decode("bad".into()).into();
        assert!(matches!(err, OutflowError::Store(StoreError::Decode(_))));
        assert_eq!(err.to_string(), "failed to decode outbox row: bad");
    }
}
