//! Broker boundary.

use futures::future::BoxFuture;

use crate::error::BrokerError;
use crate::event::OutboxEvent;

/// A message handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    pub topic: String,
    /// Partition/ordering key; always the event's aggregate id.
    pub key: String,
    pub value: String,
}

impl BrokerRecord {
    pub fn for_event(topic: &str, event: &OutboxEvent) -> Self {
        Self {
            topic: topic.to_string(),
            key: event.aggregate_id.clone(),
            value: event.payload.clone(),
        }
    }
}

/// Broker acknowledgment. `position` is whatever the broker uses to locate
/// the record (offset, stream entry id), when it reports one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerAck {
    pub position: Option<String>,
}

/// Pending acknowledgment of one send.
pub type Delivery = BoxFuture<'static, Result<BrokerAck, BrokerError>>;

/// Asynchronous, key-ordered message broker.
///
/// `send` either rejects the record on the spot or accepts it and returns a
/// [`Delivery`] that resolves once the broker acknowledged or failed it.
/// Records accepted in order for the same key must be delivered in that
/// order. Implementations bound the delivery with their own timeout.
pub trait Broker: Send + Sync {
    fn send(&self, record: BrokerRecord) -> Result<Delivery, BrokerError>;
}
