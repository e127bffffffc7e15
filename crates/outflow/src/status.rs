//! Post-send status transitions.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{OutflowError, OutflowResult};
use crate::event::{EventId, OutboxEvent, OutboxStatus};
use crate::store::EventStore;

/// How the final status write targets the row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Update by id and check the affected-row count.
    #[default]
    ById,
    /// Update by id and the concurrency token read at claim time.
    Versioned,
}

/// What a status write actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// No row matched; someone else already resolved it.
    Missed,
    /// The row changed since it was read; the other writer wins.
    Conflict,
}

/// Applies COMPLETED/FAILED after a send and swallows benign races.
#[derive(Clone)]
pub struct StatusTracker {
    store: Arc<dyn EventStore>,
    mode: WriteMode,
}

impl StatusTracker {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            mode: WriteMode::ById,
        }
    }

    pub fn with_mode(mut self, mode: WriteMode) -> Self {
        self.mode = mode;
        self
    }

    /// Write `status` by id, clearing the lease.
    ///
    /// Zero affected rows is logged and reported as [`TransitionOutcome::Missed`].
    pub async fn transition(
        &self,
        event_id: EventId,
        aggregate_id: &str,
        status: OutboxStatus,
    ) -> OutflowResult<TransitionOutcome> {
        ensure_resolution(status)?;

        let updated = self.store.update_status(event_id, status).await?;
        if updated == 0 {
            warn!(
                event_id,
                aggregate_id,
                %status,
                "No rows updated, event was resolved concurrently"
            );
            return Ok(TransitionOutcome::Missed);
        }

        debug!(event_id, aggregate_id, %status, "Event status updated");
        Ok(TransitionOutcome::Applied)
    }

    /// Write `status` guarded by the event's concurrency token.
    ///
    /// A conflict is logged and ignored; it is never retried.
    pub async fn transition_versioned(
        &self,
        event: &OutboxEvent,
        status: OutboxStatus,
    ) -> OutflowResult<TransitionOutcome> {
        ensure_resolution(status)?;

        match self
            .store
            .update_status_versioned(event.id, status, event.version)
            .await
        {
            Ok(0) => {
                warn!(
                    event_id = event.id,
                    aggregate_id = %event.aggregate_id,
                    %status,
                    "No rows updated, event was resolved concurrently"
                );
                Ok(TransitionOutcome::Missed)
            }
            Ok(_) => {
                debug!(event_id = event.id, aggregate_id = %event.aggregate_id, %status, "Event status updated");
                Ok(TransitionOutcome::Applied)
            }
            Err(err) if err.is_conflict() => {
                warn!(
                    event_id = event.id,
                    aggregate_id = %event.aggregate_id,
                    %status,
                    "Concurrency conflict on status write, ignoring"
                );
                Ok(TransitionOutcome::Conflict)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Resolve a claimed event using the configured [`WriteMode`].
    pub async fn resolve(
        &self,
        event: &OutboxEvent,
        status: OutboxStatus,
    ) -> OutflowResult<TransitionOutcome> {
        match self.mode {
            WriteMode::ById => self.transition(event.id, &event.aggregate_id, status).await,
            WriteMode::Versioned => self.transition_versioned(event, status).await,
        }
    }
}

fn ensure_resolution(status: OutboxStatus) -> OutflowResult<()> {
    if status.is_resolution() {
        Ok(())
    } else {
        Err(OutflowError::InvalidTransition(status))
    }
}
