//! Testing utilities for outflow.
//!
//! - [`MockBroker`]: records every send and answers per aggregate key
//!   (ack, fail, reject, delay or time out)
//! - [`FaultyStore`]: wraps any store and injects database errors or
//!   conflicts into chosen operations
//! - [`fixtures`]: seed helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use outflow_core::{MemoryEventStore, Publisher};
//! use outflow_testing::{fixtures, MockBroker};
//!
//! let store = Arc::new(MemoryEventStore::new());
//! fixtures::seed(&*store, &["order-1"]).await?;
//!
//! let broker = MockBroker::new();
//! broker.fail_next("order-1");
//!
//! let publisher = Publisher::new(store.clone(), Arc::new(broker.clone()), "orders");
//! let report = publisher.run_cycle(10, Utc::now()).await;
//! assert_eq!(report.failed, 1);
//! ```

mod broker;
pub mod fixtures;
mod store;

pub use broker::{MockBroker, Outcome};
pub use store::{Fault, FaultyStore, StoreOp};
