//! Seed helpers for outbox tests.

use outflow_core::{EventStore, NewOutboxEvent, OutboxEvent, StoreError};

pub const ORDER_CREATED: &str = "ORDER_CREATED";

/// An `ORDER_CREATED` event for `aggregate_id` with a small JSON payload.
pub fn order_created(aggregate_id: impl Into<String>) -> NewOutboxEvent {
    let aggregate_id = aggregate_id.into();
    let payload = format!(r#"{{"order_id":"{aggregate_id}"}}"#);
    NewOutboxEvent::new(aggregate_id, ORDER_CREATED, payload)
}

/// Insert one event per aggregate id, in order.
pub async fn seed<S>(store: &S, aggregate_ids: &[&str]) -> Result<Vec<OutboxEvent>, StoreError>
where
    S: EventStore + ?Sized,
{
    let mut events = Vec::with_capacity(aggregate_ids.len());
    for aggregate_id in aggregate_ids {
        events.push(store.insert_event(order_created(*aggregate_id)).await?);
    }
    Ok(events)
}

/// Insert `n` events on distinct aggregates `order-0..order-n`.
pub async fn seed_orders<S>(store: &S, n: usize) -> Result<Vec<OutboxEvent>, StoreError>
where
    S: EventStore + ?Sized,
{
    let mut events = Vec::with_capacity(n);
    for i in 0..n {
        events.push(store.insert_event(order_created(format!("order-{i}"))).await?);
    }
    Ok(events)
}

/// Insert a run of events on one aggregate, numbered through the payload.
pub async fn seed_sequence<S>(
    store: &S,
    aggregate_id: &str,
    n: usize,
) -> Result<Vec<OutboxEvent>, StoreError>
where
    S: EventStore + ?Sized,
{
    let mut events = Vec::with_capacity(n);
    for seq in 0..n {
        let event = NewOutboxEvent::new(aggregate_id, ORDER_CREATED, format!(r#"{{"seq":{seq}}}"#));
        events.push(store.insert_event(event).await?);
    }
    Ok(events)
}
