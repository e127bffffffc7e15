//! Store boundary.
//!
//! Any persistence engine with row-level locks, a non-blocking "skip if
//! locked" read and conditional updates can implement these traits. The
//! claim is the only multi-statement operation, so it gets its own
//! transaction type; everything else is a single statement on the store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::event::{EventId, NewOutboxEvent, OutboxEvent, OutboxStatus};

/// One claim transaction.
///
/// Rows returned by [`find_claimable_ids`](Self::find_claimable_ids) stay
/// locked against other claim transactions until the transaction is
/// committed or dropped. Dropping without committing rolls back.
#[async_trait]
pub trait ClaimTransaction: Send {
    /// Lock up to `limit` claimable rows, skipping rows locked elsewhere.
    /// Ids come back in ascending order.
    async fn find_claimable_ids(&mut self, limit: usize) -> Result<Vec<EventId>, StoreError>;

    /// Move the given rows to PROCESSING with `claimed_at = now`, but only
    /// those still STARTED or FAILED. Returns the number of rows updated.
    async fn claim_by_ids(&mut self, ids: &[EventId], now: DateTime<Utc>)
        -> Result<u64, StoreError>;

    /// Read rows by id, ascending, as seen inside this transaction.
    async fn find_by_ids(&mut self, ids: &[EventId]) -> Result<Vec<OutboxEvent>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Durable table of outbox rows.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Open a claim transaction.
    async fn begin_claim(&self) -> Result<Box<dyn ClaimTransaction>, StoreError>;

    /// Move every PROCESSING row with `claimed_at < cutoff` back to FAILED
    /// and clear its lease. Returns the number of rows released.
    async fn release_expired_leases(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Write `status` by id and clear the lease. COMPLETED rows are never
    /// rewritten, so a row that is already COMPLETED reports zero rows.
    async fn update_status(&self, id: EventId, status: OutboxStatus) -> Result<u64, StoreError>;

    /// Like [`update_status`](Self::update_status), but only if the row
    /// still carries `expected_version`. A changed row yields
    /// [`StoreError::Conflict`]; a missing or COMPLETED row yields zero.
    async fn update_status_versioned(
        &self,
        id: EventId,
        status: OutboxStatus,
        expected_version: i32,
    ) -> Result<u64, StoreError>;

    /// Ingestion boundary: insert a STARTED row and return it.
    async fn insert_event(&self, event: NewOutboxEvent) -> Result<OutboxEvent, StoreError>;

    async fn find_event(&self, id: EventId) -> Result<Option<OutboxEvent>, StoreError>;

    async fn stats(&self) -> Result<OutboxStats, StoreError>;
}

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxStats {
    pub started: i64,
    pub processing: i64,
    pub failed: i64,
    pub completed: i64,
}

impl OutboxStats {
    /// Rows a claimant could pick up right now.
    pub fn claimable(&self) -> i64 {
        self.started + self.failed
    }

    pub fn total(&self) -> i64 {
        self.started + self.processing + self.failed + self.completed
    }
}
