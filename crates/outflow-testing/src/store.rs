//! Fault-injecting store wrapper.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use outflow_core::{
    ClaimTransaction, EventId, EventStore, NewOutboxEvent, OutboxEvent, OutboxStats,
    OutboxStatus, StoreError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Store operations a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    BeginClaim,
    ReleaseExpired,
    UpdateStatus,
    UpdateStatusVersioned,
    Insert,
    Stats,
}

/// What an injected fault returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// A database error.
    Database,
    /// A concurrency conflict on the targeted row.
    Conflict,
}

#[derive(Debug, Clone, Copy)]
struct Armed {
    fault: Fault,
    /// `None` fails every call.
    remaining: Option<usize>,
}

/// A writer that resolves claim candidates behind the claimant's back.
#[derive(Debug, Clone, Copy)]
struct ClaimRace {
    /// How many of the selected candidates to resolve, lowest ids first.
    steal: usize,
    status: OutboxStatus,
}

/// Wraps another [`EventStore`] and fails selected operations on demand.
///
/// Calls that are not armed pass straight through, and every call is
/// counted so tests can check how often an operation ran.
#[derive(Clone)]
pub struct FaultyStore {
    inner: Arc<dyn EventStore>,
    armed: Arc<DashMap<StoreOp, Armed>>,
    calls: Arc<DashMap<StoreOp, AtomicUsize>>,
    race: Arc<Mutex<Option<ClaimRace>>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn EventStore>) -> Self {
        Self {
            inner,
            armed: Arc::new(DashMap::new()),
            calls: Arc::new(DashMap::new()),
            race: Arc::new(Mutex::new(None)),
        }
    }

    /// Let another writer move the first `steal` candidates of the next
    /// claim to `status` after they are selected but before they are
    /// updated.
    pub fn race_next_claim(&self, steal: usize, status: OutboxStatus) -> &Self {
        *self.race.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
            Some(ClaimRace { steal, status });
        self
    }

    /// Fail the next `times` calls of `op`.
    pub fn fail_next(&self, op: StoreOp, fault: Fault, times: usize) -> &Self {
        self.armed.insert(
            op,
            Armed {
                fault,
                remaining: Some(times),
            },
        );
        self
    }

    /// Fail every call of `op` until [`heal`](Self::heal) is called.
    pub fn fail_always(&self, op: StoreOp, fault: Fault) -> &Self {
        self.armed.insert(
            op,
            Armed {
                fault,
                remaining: None,
            },
        );
        self
    }

    pub fn heal(&self, op: StoreOp) {
        self.armed.remove(&op);
    }

    /// How many times `op` was called, faulted or not.
    pub fn calls(&self, op: StoreOp) -> usize {
        self.calls
            .get(&op)
            .map(|count| count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn check(&self, op: StoreOp, id: EventId, expected_version: i32) -> Result<(), StoreError> {
        self.calls
            .entry(op)
            .or_default()
            .fetch_add(1, Ordering::SeqCst);

        let Some(mut armed) = self.armed.get_mut(&op) else {
            return Ok(());
        };
        match armed.remaining.as_mut() {
            Some(0) => return Ok(()),
            Some(remaining) => *remaining -= 1,
            None => {}
        }

        Err(match armed.fault {
            Fault::Database => StoreError::Database(Box::from(format!("injected fault on {op:?}"))),
            Fault::Conflict => StoreError::Conflict {
                id,
                expected_version,
            },
        })
    }
}

#[async_trait]
impl EventStore for FaultyStore {
    async fn begin_claim(&self) -> Result<Box<dyn ClaimTransaction>, StoreError> {
        self.check(StoreOp::BeginClaim, 0, 0)?;
        let tx = self.inner.begin_claim().await?;

        let race = self
            .race
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match race {
            Some(race) => Ok(Box::new(RacedClaim {
                tx,
                store: Arc::clone(&self.inner),
                race: Some(race),
            })),
            None => Ok(tx),
        }
    }

    async fn release_expired_leases(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check(StoreOp::ReleaseExpired, 0, 0)?;
        self.inner.release_expired_leases(cutoff).await
    }

    async fn update_status(&self, id: EventId, status: OutboxStatus) -> Result<u64, StoreError> {
        self.check(StoreOp::UpdateStatus, id, 0)?;
        self.inner.update_status(id, status).await
    }

    async fn update_status_versioned(
        &self,
        id: EventId,
        status: OutboxStatus,
        expected_version: i32,
    ) -> Result<u64, StoreError> {
        self.check(StoreOp::UpdateStatusVersioned, id, expected_version)?;
        self.inner
            .update_status_versioned(id, status, expected_version)
            .await
    }

    async fn insert_event(&self, event: NewOutboxEvent) -> Result<OutboxEvent, StoreError> {
        self.check(StoreOp::Insert, 0, 0)?;
        self.inner.insert_event(event).await
    }

    async fn find_event(&self, id: EventId) -> Result<Option<OutboxEvent>, StoreError> {
        self.inner.find_event(id).await
    }

    async fn stats(&self) -> Result<OutboxStats, StoreError> {
        self.check(StoreOp::Stats, 0, 0)?;
        self.inner.stats().await
    }
}

/// Claim transaction that loses some of its candidates to a concurrent
/// writer between the select and the update.
struct RacedClaim {
    tx: Box<dyn ClaimTransaction>,
    store: Arc<dyn EventStore>,
    race: Option<ClaimRace>,
}

#[async_trait]
impl ClaimTransaction for RacedClaim {
    async fn find_claimable_ids(&mut self, limit: usize) -> Result<Vec<EventId>, StoreError> {
        let ids = self.tx.find_claimable_ids(limit).await?;
        if let Some(race) = self.race.take() {
            for id in ids.iter().take(race.steal) {
                self.store.update_status(*id, race.status).await?;
            }
        }
        Ok(ids)
    }

    async fn claim_by_ids(
        &mut self,
        ids: &[EventId],
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.tx.claim_by_ids(ids, now).await
    }

    async fn find_by_ids(&mut self, ids: &[EventId]) -> Result<Vec<OutboxEvent>, StoreError> {
        self.tx.find_by_ids(ids).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outflow_core::MemoryEventStore;

    #[tokio::test]
    async fn one_shot_fault_then_pass_through() {
        let store = FaultyStore::new(Arc::new(MemoryEventStore::new()));
        store.fail_next(StoreOp::Stats, Fault::Database, 1);

        assert!(matches!(store.stats().await, Err(StoreError::Database(_))));
        assert_eq!(store.stats().await.unwrap().total(), 0);
        assert_eq!(store.calls(StoreOp::Stats), 2);
    }

    #[tokio::test]
    async fn raced_claim_sees_candidates_resolved_before_its_update() {
        let memory = MemoryEventStore::new();
        crate::fixtures::seed_orders(&memory, 2).await.unwrap();
        let store = FaultyStore::new(Arc::new(memory.clone()));
        store.race_next_claim(1, OutboxStatus::Completed);

        let mut tx = store.begin_claim().await.unwrap();
        let ids = tx.find_claimable_ids(10).await.unwrap();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(tx.claim_by_ids(&ids, Utc::now()).await.unwrap(), 1);
        tx.commit().await.unwrap();

        // One race per arming.
        let mut next = store.begin_claim().await.unwrap();
        assert!(next.find_claimable_ids(10).await.unwrap().is_empty());
        next.commit().await.unwrap();
        assert_eq!(memory.stats().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn conflict_fault_carries_the_token() {
        let store = FaultyStore::new(Arc::new(MemoryEventStore::new()));
        store.fail_always(StoreOp::UpdateStatusVersioned, Fault::Conflict);

        let err = store
            .update_status_versioned(7, OutboxStatus::Completed, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { id: 7, expected_version: 3 }));

        store.heal(StoreOp::UpdateStatusVersioned);
        assert_eq!(
            store
                .update_status_versioned(7, OutboxStatus::Completed, 3)
                .await
                .unwrap(),
            0
        );
    }
}
