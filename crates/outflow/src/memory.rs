//! In-memory [`EventStore`].
//!
//! Mirrors the row-locking behaviour of the Postgres store closely enough to
//! exercise the claim protocol under concurrency: claimable rows picked by an
//! open [`ClaimTransaction`] are skipped by every other claim transaction
//! until the first one commits or is dropped, and a dropped transaction rolls
//! its claim back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::StoreError;
use crate::event::{EventId, NewOutboxEvent, OutboxEvent, OutboxStatus};
use crate::store::{ClaimTransaction, EventStore, OutboxStats};

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<EventId, OutboxEvent>,
    /// Rows held by open claim transactions.
    locked: HashSet<EventId>,
    last_id: EventId,
}

impl MemoryState {
    fn resolve(row: &mut OutboxEvent, status: OutboxStatus) {
        row.status = status;
        row.claimed_at = None;
        row.version += 1;
    }
}

/// Shared in-memory outbox table. Clones share the same rows.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    /// All rows in id order.
    pub fn snapshot(&self) -> Result<Vec<OutboxEvent>, StoreError> {
        Ok(self.lock()?.rows.values().cloned().collect())
    }

    /// Ids currently held by open claim transactions.
    pub fn locked_ids(&self) -> Result<Vec<EventId>, StoreError> {
        let state = self.lock()?;
        let mut ids: Vec<_> = state.locked.iter().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Overwrite the lease timestamp of a PROCESSING row. Used to age leases
    /// without waiting on a real clock.
    pub fn backdate_lease(&self, id: EventId, claimed_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        match state.rows.get_mut(&id) {
            Some(row) if row.status == OutboxStatus::Processing => {
                row.claimed_at = Some(claimed_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn begin_claim(&self) -> Result<Box<dyn ClaimTransaction>, StoreError> {
        Ok(Box::new(MemoryClaimTransaction {
            state: Arc::clone(&self.state),
            held: Vec::new(),
            undo: Vec::new(),
            committed: false,
        }))
    }

    async fn release_expired_leases(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let MemoryState { rows, locked, .. } = &mut *state;

        let mut released = 0;
        for row in rows.values_mut() {
            if locked.contains(&row.id) || !row.lease_expired(cutoff) {
                continue;
            }
            MemoryState::resolve(row, OutboxStatus::Failed);
            released += 1;
        }
        Ok(released)
    }

    async fn update_status(&self, id: EventId, status: OutboxStatus) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        match state.rows.get_mut(&id) {
            Some(row) if !row.status.is_terminal() => {
                MemoryState::resolve(row, status);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn update_status_versioned(
        &self,
        id: EventId,
        status: OutboxStatus,
        expected_version: i32,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        match state.rows.get_mut(&id) {
            None => Ok(0),
            Some(row) if row.status.is_terminal() => Ok(0),
            Some(row) if row.version != expected_version => Err(StoreError::Conflict {
                id,
                expected_version,
            }),
            Some(row) => {
                MemoryState::resolve(row, status);
                Ok(1)
            }
        }
    }

    async fn insert_event(&self, event: NewOutboxEvent) -> Result<OutboxEvent, StoreError> {
        let mut state = self.lock()?;
        state.last_id += 1;

        let row = OutboxEvent {
            id: state.last_id,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type,
            payload: event.payload,
            status: OutboxStatus::Started,
            version: 0,
            created_at: Utc::now(),
            claimed_at: None,
        };
        state.rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn find_event(&self, id: EventId) -> Result<Option<OutboxEvent>, StoreError> {
        Ok(self.lock()?.rows.get(&id).cloned())
    }

    async fn stats(&self) -> Result<OutboxStats, StoreError> {
        let state = self.lock()?;
        let mut stats = OutboxStats::default();
        for row in state.rows.values() {
            match row.status {
                OutboxStatus::Started => stats.started += 1,
                OutboxStatus::Processing => stats.processing += 1,
                OutboxStatus::Failed => stats.failed += 1,
                OutboxStatus::Completed => stats.completed += 1,
            }
        }
        Ok(stats)
    }
}

struct MemoryClaimTransaction {
    state: Arc<Mutex<MemoryState>>,
    held: Vec<EventId>,
    /// Pre-claim copies of updated rows, restored on rollback.
    undo: Vec<OutboxEvent>,
    committed: bool,
}

impl MemoryClaimTransaction {
    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl ClaimTransaction for MemoryClaimTransaction {
    async fn find_claimable_ids(&mut self, limit: usize) -> Result<Vec<EventId>, StoreError> {
        let mut state = self.lock()?;
        let MemoryState { rows, locked, .. } = &mut *state;

        let ids: Vec<EventId> = rows
            .values()
            .filter(|row| row.is_claimable() && !locked.contains(&row.id))
            .map(|row| row.id)
            .take(limit)
            .collect();
        locked.extend(ids.iter().copied());
        drop(state);

        self.held.extend(ids.iter().copied());
        Ok(ids)
    }

    async fn claim_by_ids(
        &mut self,
        ids: &[EventId],
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let mut undo = Vec::new();

        for id in ids {
            let Some(row) = state.rows.get_mut(id) else {
                continue;
            };
            if !row.is_claimable() {
                continue;
            }
            undo.push(row.clone());
            row.status = OutboxStatus::Processing;
            row.claimed_at = Some(now);
            row.version += 1;
        }
        drop(state);

        let claimed = undo.len() as u64;
        self.undo.extend(undo);
        Ok(claimed)
    }

    async fn find_by_ids(&mut self, ids: &[EventId]) -> Result<Vec<OutboxEvent>, StoreError> {
        let state = self.lock()?;
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids
            .iter()
            .filter_map(|id| state.rows.get(id).cloned())
            .collect())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.committed = true;
        Ok(())
    }
}

impl Drop for MemoryClaimTransaction {
    fn drop(&mut self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if !self.committed {
            for row in self.undo.drain(..).rev() {
                state.rows.insert(row.id, row);
            }
        }
        for id in &self.held {
            state.locked.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn seeded(n: usize) -> MemoryEventStore {
        let store = MemoryEventStore::new();
        for i in 0..n {
            store
                .insert_event(NewOutboxEvent::new(format!("agg-{i}"), "TYPE", "{}"))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn insert_assigns_increasing_ids_in_started() {
        let store = seeded(2).await;
        let rows = store.snapshot().unwrap();

        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(rows.iter().all(|r| r.status == OutboxStatus::Started));
        assert!(rows.iter().all(|r| r.claimed_at.is_none() && r.version == 0));
    }

    #[tokio::test]
    async fn open_transaction_hides_its_rows_from_other_claimants() {
        let store = seeded(3).await;

        let mut first = store.begin_claim().await.unwrap();
        let mut second = store.begin_claim().await.unwrap();

        assert_eq!(first.find_claimable_ids(2).await.unwrap(), vec![1, 2]);
        assert_eq!(second.find_claimable_ids(5).await.unwrap(), vec![3]);
        assert_eq!(store.locked_ids().unwrap(), vec![1, 2, 3]);

        first.commit().await.unwrap();
        second.commit().await.unwrap();
        assert!(store.locked_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_skips_rows_that_are_no_longer_claimable() {
        let store = seeded(2).await;
        store.update_status(2, OutboxStatus::Completed).await.unwrap();

        let mut tx = store.begin_claim().await.unwrap();
        let now = Utc::now();
        assert_eq!(tx.claim_by_ids(&[1, 2], now).await.unwrap(), 1);
        tx.commit().await.unwrap();

        let row = store.find_event(1).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Processing);
        assert_eq!(row.claimed_at, Some(now));
        assert_eq!(row.version, 1);
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back_and_unlocks() {
        let store = seeded(1).await;

        {
            let mut tx = store.begin_claim().await.unwrap();
            let ids = tx.find_claimable_ids(1).await.unwrap();
            assert_eq!(tx.claim_by_ids(&ids, Utc::now()).await.unwrap(), 1);
        }

        let row = store.find_event(1).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Started);
        assert_eq!(row.claimed_at, None);
        assert!(store.locked_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn completed_rows_are_never_rewritten() {
        let store = seeded(1).await;

        assert_eq!(store.update_status(1, OutboxStatus::Completed).await.unwrap(), 1);
        assert_eq!(store.update_status(1, OutboxStatus::Failed).await.unwrap(), 0);
        assert_eq!(
            store
                .update_status_versioned(1, OutboxStatus::Failed, 1)
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            store.find_event(1).await.unwrap().unwrap().status,
            OutboxStatus::Completed
        );
    }

    #[tokio::test]
    async fn versioned_update_reports_conflict_on_stale_token() {
        let store = seeded(1).await;
        store.update_status(1, OutboxStatus::Failed).await.unwrap();

        let err = store
            .update_status_versioned(1, OutboxStatus::Completed, 0)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        assert_eq!(
            store
                .update_status_versioned(1, OutboxStatus::Completed, 1)
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.update_status_versioned(99, OutboxStatus::Failed, 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn release_only_touches_expired_processing_rows() {
        let store = seeded(3).await;
        let t = Utc::now();

        let mut tx = store.begin_claim().await.unwrap();
        let ids = tx.find_claimable_ids(2).await.unwrap();
        tx.claim_by_ids(&ids, t).await.unwrap();
        tx.commit().await.unwrap();
        store.backdate_lease(2, t - Duration::minutes(10)).unwrap();

        let released = store
            .release_expired_leases(t - Duration::minutes(3))
            .await
            .unwrap();
        assert_eq!(released, 1);

        let rows = store.snapshot().unwrap();
        assert_eq!(rows[0].status, OutboxStatus::Processing);
        assert_eq!(rows[1].status, OutboxStatus::Failed);
        assert_eq!(rows[1].claimed_at, None);
        assert_eq!(rows[2].status, OutboxStatus::Started);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.claimable(), 2);
        assert_eq!(stats.total(), 3);
    }
}
