//! Claim exclusivity and lease recovery across competing claimants.

use chrono::{Duration, Utc};
use dashmap::DashSet;
use outflow_core::{
    ClaimCoordinator, EventStore, MemoryEventStore, OutboxStatus, Publisher, Reaper, Relay,
    RelayConfig,
};
use outflow_testing::{fixtures, FaultyStore, MockBroker};
use std::collections::HashSet;
use std::sync::Arc;

#[tokio::test]
async fn interleaved_claims_partition_the_backlog() {
    let store = MemoryEventStore::new();
    fixtures::seed_orders(&store, 3).await.unwrap();

    let mut first = store.begin_claim().await.unwrap();
    let mut second = store.begin_claim().await.unwrap();

    let first_ids = first.find_claimable_ids(5).await.unwrap();
    let second_ids = second.find_claimable_ids(5).await.unwrap();
    assert_eq!(first_ids, vec![1, 2, 3]);
    assert!(second_ids.is_empty());

    assert_eq!(first.claim_by_ids(&first_ids, Utc::now()).await.unwrap(), 3);
    first.commit().await.unwrap();
    second.commit().await.unwrap();

    assert_eq!(store.stats().await.unwrap().processing, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_claims_never_overlap() {
    let store = Arc::new(MemoryEventStore::new());
    fixtures::seed_orders(&*store, 3).await.unwrap();
    let a = ClaimCoordinator::new(store.clone());
    let b = ClaimCoordinator::new(store.clone());
    let now = Utc::now();

    let (left, right) = tokio::join!(a.fetch_and_claim(5, now), b.fetch_and_claim(5, now));
    let (left, right) = (left.unwrap(), right.unwrap());

    assert_eq!(left.len() + right.len(), 3);
    let left_ids: HashSet<_> = left.iter().map(|e| e.id).collect();
    assert!(right.iter().all(|e| !left_ids.contains(&e.id)));
    assert!(left
        .iter()
        .chain(&right)
        .all(|e| e.status == OutboxStatus::Processing && e.claimed_at == Some(now)));
}

#[tokio::test]
async fn claim_that_loses_every_candidate_sends_nothing() {
    let memory = Arc::new(MemoryEventStore::new());
    fixtures::seed_orders(&*memory, 2).await.unwrap();
    let store = FaultyStore::new(memory.clone());
    store.race_next_claim(2, OutboxStatus::Completed);
    let broker = MockBroker::new();

    let report = Publisher::new(Arc::new(store), Arc::new(broker.clone()), "orders")
        .run_cycle(10, Utc::now())
        .await;

    assert!(report.is_idle());
    assert!(!report.claim_failed);
    assert_eq!(broker.accepted_count(), 0);
    assert!(memory.locked_ids().unwrap().is_empty());

    let stats = memory.stats().await.unwrap();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.processing, 0);
}

#[tokio::test]
async fn claim_that_loses_some_candidates_returns_only_its_own() {
    let memory = Arc::new(MemoryEventStore::new());
    fixtures::seed_orders(&*memory, 3).await.unwrap();
    let store = FaultyStore::new(memory.clone());
    store.race_next_claim(2, OutboxStatus::Completed);
    let now = Utc::now();

    let batch = ClaimCoordinator::new(Arc::new(store))
        .fetch_and_claim(10, now)
        .await
        .unwrap();

    assert_eq!(batch.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3]);
    assert_eq!(batch[0].status, OutboxStatus::Processing);
    assert_eq!(batch[0].claimed_at, Some(now));
    assert!(memory.locked_ids().unwrap().is_empty());

    let first = memory.find_event(1).await.unwrap().unwrap();
    assert_eq!(first.status, OutboxStatus::Completed);
    assert_eq!(first.claimed_at, None);
}

#[tokio::test]
async fn abandoned_claim_is_recovered_after_the_lease() {
    let store = Arc::new(MemoryEventStore::new());
    fixtures::seed(&*store, &["order-1"]).await.unwrap();
    let t = Utc::now();

    // The claimant crashes after claiming and never resolves.
    let claimed = ClaimCoordinator::new(store.clone())
        .fetch_and_claim(10, t)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    let reaper = Reaper::new(store.clone());
    let lease = std::time::Duration::from_secs(180);
    assert_eq!(reaper.sweep_at(t + Duration::seconds(60), lease).await.unwrap(), 0);
    assert_eq!(
        reaper
            .sweep_at(t + Duration::minutes(3) + Duration::seconds(1), lease)
            .await
            .unwrap(),
        1
    );

    let row = store.find_event(1).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.claimed_at, None);

    let again = ClaimCoordinator::new(store.clone())
        .fetch_and_claim(10, Utc::now())
        .await
        .unwrap();
    assert_eq!(again.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn running_relay_recovers_and_publishes_abandoned_event() {
    let store = Arc::new(MemoryEventStore::new());
    fixtures::seed(&*store, &["order-1", "order-2"]).await.unwrap();
    ClaimCoordinator::new(store.clone())
        .fetch_and_claim(1, Utc::now())
        .await
        .unwrap();
    store
        .backdate_lease(1, Utc::now() - Duration::minutes(10))
        .unwrap();

    let broker = MockBroker::new();
    let config = RelayConfig::default()
        .with_topic("orders")
        .with_publish_interval(std::time::Duration::from_millis(100))
        .with_reap_interval(std::time::Duration::from_secs(1));
    let handle = Relay::new(config, store.clone(), Arc::new(broker.clone()))
        .unwrap()
        .start();

    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    handle.shutdown().await;

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.completed, 2);
    assert_eq!(broker.values_for("order-1").len(), 1);
}

/// Claimants race over a shared backlog with random batch sizes and random
/// broker failures. No event may be held by two claimants at once and every
/// event must end COMPLETED.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn randomized_claimants_keep_exclusivity_and_lose_nothing() {
    const EVENTS: usize = 200;
    const CLAIMANTS: u64 = 6;

    let store = Arc::new(MemoryEventStore::new());
    fixtures::seed_orders(&*store, EVENTS).await.unwrap();
    let in_flight = Arc::new(DashSet::new());

    let mut tasks = Vec::new();
    for seed in 0..CLAIMANTS {
        let store = store.clone();
        let in_flight = in_flight.clone();
        tasks.push(tokio::spawn(async move {
            let mut rng = fastrand::Rng::with_seed(seed);
            let claims = ClaimCoordinator::new(store.clone());

            for _ in 0..10_000 {
                if store.stats().await.unwrap().completed == EVENTS as i64 {
                    return;
                }
                let batch = claims
                    .fetch_and_claim(rng.usize(1..=8), Utc::now())
                    .await
                    .unwrap();
                for event in &batch {
                    assert!(in_flight.insert(event.id), "event {} claimed twice", event.id);
                }
                tokio::task::yield_now().await;

                for event in batch {
                    in_flight.remove(&event.id);
                    let status = if rng.u8(0..4) == 0 {
                        OutboxStatus::Failed
                    } else {
                        OutboxStatus::Completed
                    };
                    assert_eq!(store.update_status(event.id, status).await.unwrap(), 1);
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.completed, EVENTS as i64);
    assert_eq!(stats.total(), EVENTS as i64);
    assert!(in_flight.is_empty());
}
