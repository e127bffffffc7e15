//! Scriptable in-process broker.

use dashmap::DashMap;
use futures::FutureExt;
use outflow_core::{Broker, BrokerAck, BrokerError, BrokerRecord, Delivery};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// How the broker answers a send for a given key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Acknowledge immediately.
    Ack,
    /// Accept, then fail the delivery.
    Fail(String),
    /// Refuse synchronously; the record is never accepted.
    Reject(String),
    /// Accept and acknowledge after a delay.
    Delay(Duration),
    /// Accept and fail with a timeout after the given duration.
    Timeout(Duration),
}

#[derive(Debug, Clone)]
struct Rule {
    outcome: Outcome,
    /// `None` applies forever.
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct Inner {
    rules: DashMap<String, Rule>,
    accepted: Mutex<Vec<BrokerRecord>>,
    acked: Mutex<Vec<BrokerRecord>>,
    by_key: DashMap<String, Vec<String>>,
    offsets: AtomicU64,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Records every send and answers according to per-key rules.
///
/// Keys without a rule are acknowledged immediately. Clones share state, so
/// a test can keep one handle while the relay owns another.
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    inner: Arc<Inner>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every send for `key` with `outcome`.
    pub fn script(&self, key: impl Into<String>, outcome: Outcome) -> &Self {
        self.inner.rules.insert(
            key.into(),
            Rule {
                outcome,
                remaining: None,
            },
        );
        self
    }

    /// Answer the next `times` sends for `key` with `outcome`, then ack.
    pub fn script_times(&self, key: impl Into<String>, outcome: Outcome, times: usize) -> &Self {
        self.inner.rules.insert(
            key.into(),
            Rule {
                outcome,
                remaining: Some(times),
            },
        );
        self
    }

    pub fn fail_key(&self, key: impl Into<String>) -> &Self {
        self.script(key, Outcome::Fail("broker error".to_string()))
    }

    pub fn fail_next(&self, key: impl Into<String>) -> &Self {
        self.script_times(key, Outcome::Fail("broker error".to_string()), 1)
    }

    pub fn reject_key(&self, key: impl Into<String>) -> &Self {
        self.script(key, Outcome::Reject("serialization failed".to_string()))
    }

    pub fn clear(&self, key: &str) {
        self.inner.rules.remove(key);
    }

    /// Records accepted for delivery, in acceptance order.
    pub fn accepted(&self) -> Vec<BrokerRecord> {
        guard(&self.inner.accepted).clone()
    }

    /// Records the broker acknowledged, in acknowledgment order.
    pub fn acked(&self) -> Vec<BrokerRecord> {
        guard(&self.inner.acked).clone()
    }

    /// Values accepted for `key`, in acceptance order.
    pub fn values_for(&self, key: &str) -> Vec<String> {
        self.inner
            .by_key
            .get(key)
            .map(|values| values.clone())
            .unwrap_or_default()
    }

    pub fn accepted_count(&self) -> usize {
        guard(&self.inner.accepted).len()
    }

    fn next_outcome(&self, key: &str) -> Outcome {
        let Some(mut rule) = self.inner.rules.get_mut(key) else {
            return Outcome::Ack;
        };
        let outcome = rule.outcome.clone();
        match rule.remaining.as_mut() {
            Some(0) => Outcome::Ack,
            Some(remaining) => {
                *remaining -= 1;
                outcome
            }
            None => outcome,
        }
    }
}

impl Broker for MockBroker {
    fn send(&self, record: BrokerRecord) -> Result<Delivery, BrokerError> {
        let outcome = self.next_outcome(&record.key);
        if let Outcome::Reject(reason) = &outcome {
            return Err(BrokerError::Rejected(reason.clone()));
        }

        guard(&self.inner.accepted).push(record.clone());
        self.inner
            .by_key
            .entry(record.key.clone())
            .or_default()
            .push(record.value.clone());

        let inner = Arc::clone(&self.inner);
        Ok(async move {
            match outcome {
                Outcome::Fail(reason) => return Err(BrokerError::Rejected(reason)),
                Outcome::Timeout(after) => {
                    tokio::time::sleep(after).await;
                    return Err(BrokerError::Timeout(after));
                }
                Outcome::Delay(after) => tokio::time::sleep(after).await,
                Outcome::Ack | Outcome::Reject(_) => {}
            }

            let offset = inner.offsets.fetch_add(1, Ordering::SeqCst);
            guard(&inner.acked).push(record);
            Ok(BrokerAck {
                position: Some(offset.to_string()),
            })
        }
        .boxed())
    }
}
