//! # Outflow
//!
//! The claim, publish and reap engine behind a transactional outbox.
//!
//! Business code writes an outbox row in the same transaction as its own
//! state change. Outflow moves those rows to a message broker with
//! at-least-once delivery. Any number of relay instances can share the backlog
//! and they coordinate only through the store's row locks.
//!
//! ## Architecture
//!
//! ```text
//! publish trigger                               reap trigger
//!     │                                              │
//!     ▼ run_cycle(limit, now)                        ▼ sweep(lease_timeout)
//! Publisher                                       Reaper
//!     │                                              │
//!     ├─► ClaimCoordinator.fetch_and_claim()         └─► release_expired_leases(cutoff)
//!     │       │  one transaction:                            │
//!     │       ├─ find_claimable_ids  (SKIP LOCKED)           ▼
//!     │       ├─ claim_by_ids        (status re-check)   PROCESSING ──► FAILED
//!     │       └─ find_by_ids
//!     │
//!     ├─► Broker.send(topic, key = aggregate_id, value = payload)   × batch
//!     │
//!     └─► join all deliveries ──► StatusTracker.resolve() per event
//!                                     ├─ ack   ──► COMPLETED
//!                                     └─ error ──► FAILED
//! ```
//!
//! ## Key Invariants
//!
//! 1. **COMPLETED is terminal** - no write ever leaves it
//! 2. **Lease iff PROCESSING** - `claimed_at` is set exactly while a claim is live
//! 3. **Claimable iff STARTED or FAILED** - everything else is skipped
//! 4. **One owner per PROCESSING row** - the skip-locked claim guarantees it,
//!    the concurrency token is only a secondary check
//! 5. **Nothing is dropped** - every row ends COMPLETED or stays retryable
//!
//! ## Guarantees
//!
//! - **At-least-once delivery**: a crash between send and status write, or a
//!   lease that expires while a send is still in flight, causes a duplicate.
//!   Consumers must be idempotent.
//! - **Per-key ordering within a batch**: sends are accepted in id order.
//! - **Bounded recovery**: an abandoned claim is released after one lease
//!   timeout plus at most one reap interval.
//!
//! ## Example
//!
//! ```ignore
//! use outflow_core::{MemoryEventStore, NewOutboxEvent, Relay, RelayConfig};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryEventStore::new());
//! store.insert_event(NewOutboxEvent::new("order-1", "ORDER_CREATED", r#"{"total":42}"#)).await?;
//!
//! let relay = Relay::new(RelayConfig::default().with_topic("orders"), store, broker)?;
//!
//! // Drive it yourself...
//! let report = relay.run_cycle(10, chrono::Utc::now()).await;
//!
//! // ...or let it schedule itself.
//! let handle = relay.start();
//! handle.shutdown().await;
//! ```

mod broker;
mod claim;
mod config;
mod error;
mod event;
mod publisher;
mod reaper;
mod relay;
mod status;
mod store;

// In-memory store for tests and local runs
pub mod memory;

// Re-export row types
pub use event::{EventId, NewOutboxEvent, OutboxEvent, OutboxStatus};

// Re-export error types
pub use error::{BoxError, BrokerError, ConfigError, OutflowError, OutflowResult, StoreError};

// Re-export boundary traits
pub use broker::{Broker, BrokerAck, BrokerRecord, Delivery};
pub use store::{ClaimTransaction, EventStore, OutboxStats};

// Re-export engine components
pub use claim::ClaimCoordinator;
pub use publisher::{CycleReport, Publisher};
pub use reaper::{lease_cutoff, Reaper};
pub use status::{StatusTracker, TransitionOutcome, WriteMode};

// Re-export relay types (primary entry point)
pub use config::RelayConfig;
pub use memory::MemoryEventStore;
pub use relay::{Relay, RelayHandle};

// Re-export commonly used external types
pub use async_trait::async_trait;
