//! Two-phase batch claiming.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::error::StoreError;
use crate::event::{OutboxEvent, OutboxStatus};
use crate::store::EventStore;

/// Hands each caller an exclusive batch of claimable events.
///
/// The lock-select and the conditional update run in one store transaction.
/// The update re-checks the status because the two are separate statements;
/// exclusivity across processes comes from the skip-locked read alone.
#[derive(Clone)]
pub struct ClaimCoordinator {
    store: Arc<dyn EventStore>,
}

impl ClaimCoordinator {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Claim up to `limit` events, stamping their lease with `now`.
    ///
    /// Returns an empty batch when nothing is claimable or a concurrent
    /// claimant got there first. Only store failures are errors.
    pub async fn fetch_and_claim(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.store.begin_claim().await?;

        let ids = tx.find_claimable_ids(limit).await?;
        if ids.is_empty() {
            debug!(limit, "No claimable events found");
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let claimed = tx.claim_by_ids(&ids, now).await?;
        if claimed == 0 {
            debug!(
                candidates = ids.len(),
                "No events were claimed, another instance got them first"
            );
            tx.commit().await?;
            return Ok(Vec::new());
        }
        if claimed < ids.len() as u64 {
            debug!(
                candidates = ids.len(),
                claimed, "Claimed only part of the candidate batch"
            );
        }

        let events: Vec<OutboxEvent> = tx
            .find_by_ids(&ids)
            .await?
            .into_iter()
            .filter(|event| event.status == OutboxStatus::Processing)
            .collect();
        tx.commit().await?;

        debug!(claimed = events.len(), "Claimed outbox batch");
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NewOutboxEvent;
    use crate::memory::MemoryEventStore;

    async fn store_with(n: usize) -> MemoryEventStore {
        let store = MemoryEventStore::new();
        for i in 0..n {
            store
                .insert_event(NewOutboxEvent::new(format!("order-{i}"), "ORDER_CREATED", "{}"))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn empty_backlog_yields_empty_batch() {
        let store = MemoryEventStore::new();
        let coordinator = ClaimCoordinator::new(Arc::new(store));

        let batch = coordinator.fetch_and_claim(10, Utc::now()).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn claims_up_to_limit_in_id_order() {
        let store = store_with(4).await;
        let coordinator = ClaimCoordinator::new(Arc::new(store.clone()));
        let now = Utc::now();

        let batch = coordinator.fetch_and_claim(3, now).await.unwrap();

        assert_eq!(batch.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(batch
            .iter()
            .all(|e| e.status == OutboxStatus::Processing && e.claimed_at == Some(now)));
        assert_eq!(store.stats().await.unwrap().started, 1);
        assert!(store.locked_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_limit_claims_nothing() {
        let store = store_with(2).await;
        let coordinator = ClaimCoordinator::new(Arc::new(store.clone()));

        assert!(coordinator.fetch_and_claim(0, Utc::now()).await.unwrap().is_empty());
        assert_eq!(store.stats().await.unwrap().started, 2);
    }

    #[tokio::test]
    async fn processing_and_completed_rows_are_not_reclaimed() {
        let store = store_with(3).await;
        let coordinator = ClaimCoordinator::new(Arc::new(store.clone()));

        let first = coordinator.fetch_and_claim(1, Utc::now()).await.unwrap();
        store
            .update_status(first[0].id, OutboxStatus::Completed)
            .await
            .unwrap();
        let second = coordinator.fetch_and_claim(1, Utc::now()).await.unwrap();

        let third = coordinator.fetch_and_claim(10, Utc::now()).await.unwrap();
        assert_eq!(third.len(), 1);
        assert_ne!(third[0].id, first[0].id);
        assert_ne!(third[0].id, second[0].id);
    }

    #[tokio::test]
    async fn failed_rows_are_claimable_again() {
        let store = store_with(1).await;
        let coordinator = ClaimCoordinator::new(Arc::new(store.clone()));

        let batch = coordinator.fetch_and_claim(10, Utc::now()).await.unwrap();
        store
            .update_status(batch[0].id, OutboxStatus::Failed)
            .await
            .unwrap();

        let again = coordinator.fetch_and_claim(10, Utc::now()).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, batch[0].id);
        assert_eq!(again[0].version, 3);
    }
}
