//! Publish cycle: claim a batch, send it, resolve each event.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::{Broker, BrokerRecord};
use crate::claim::ClaimCoordinator;
use crate::event::{OutboxEvent, OutboxStatus};
use crate::status::{StatusTracker, TransitionOutcome};
use crate::store::EventStore;

/// Outcome of one publish cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Events handed to this cycle by the claim.
    pub claimed: usize,
    /// Sends the broker acknowledged.
    pub completed: usize,
    /// Sends rejected, timed out or failed.
    pub failed: usize,
    /// Status writes that found the row already resolved or changed.
    pub stale_writes: usize,
    /// Status writes that errored; those rows wait for the reaper.
    pub unresolved: usize,
    /// The claim itself errored and nothing was sent.
    pub claim_failed: bool,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.claimed == 0
    }
}

struct Dispatched {
    status: OutboxStatus,
    write: Option<TransitionOutcome>,
}

/// Sends claimed events to the broker and records the outcome per event.
#[derive(Clone)]
pub struct Publisher {
    claims: ClaimCoordinator,
    tracker: StatusTracker,
    broker: Arc<dyn Broker>,
    topic: String,
}

impl Publisher {
    pub fn new(store: Arc<dyn EventStore>, broker: Arc<dyn Broker>, topic: impl Into<String>) -> Self {
        Self {
            claims: ClaimCoordinator::new(Arc::clone(&store)),
            tracker: StatusTracker::new(store),
            broker,
            topic: topic.into(),
        }
    }

    /// Replace the status tracker, e.g. to switch its write mode.
    pub fn with_tracker(mut self, tracker: StatusTracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Run one cycle: claim up to `limit` events with lease time `now`,
    /// send them all concurrently and wait for every send to finish.
    ///
    /// Never fails. Claim errors, send failures and status-write problems are
    /// logged and counted in the report.
    #[instrument(skip_all, fields(limit = limit, topic = %self.topic))]
    pub async fn run_cycle(&self, limit: usize, now: DateTime<Utc>) -> CycleReport {
        let events = match self.claims.fetch_and_claim(limit, now).await {
            Ok(events) => events,
            Err(err) => {
                error!(error = %err, "Failed to claim outbox events");
                return CycleReport {
                    claim_failed: true,
                    ..Default::default()
                };
            }
        };
        if events.is_empty() {
            return CycleReport::default();
        }

        let mut report = CycleReport {
            claimed: events.len(),
            ..Default::default()
        };

        // Sends are accepted in id order before any of them is awaited, so
        // the broker sees same-key events in the order they were recorded.
        let pending: Vec<_> = events.into_iter().map(|event| self.dispatch(event)).collect();

        for dispatched in join_all(pending).await {
            match dispatched.status {
                OutboxStatus::Completed => report.completed += 1,
                _ => report.failed += 1,
            }
            match dispatched.write {
                Some(TransitionOutcome::Applied) => {}
                Some(TransitionOutcome::Missed | TransitionOutcome::Conflict) => {
                    report.stale_writes += 1
                }
                None => report.unresolved += 1,
            }
        }

        info!(
            claimed = report.claimed,
            completed = report.completed,
            failed = report.failed,
            stale_writes = report.stale_writes,
            unresolved = report.unresolved,
            "Finished publishing outbox batch"
        );
        report
    }

    fn dispatch(&self, event: OutboxEvent) -> impl Future<Output = Dispatched> + Send + 'static {
        let accepted = self.broker.send(BrokerRecord::for_event(&self.topic, &event));
        let tracker = self.tracker.clone();

        async move {
            let status = match accepted {
                Ok(delivery) => match delivery.await {
                    Ok(ack) => {
                        debug!(
                            event_id = event.id,
                            aggregate_id = %event.aggregate_id,
                            position = ?ack.position,
                            "Published event"
                        );
                        OutboxStatus::Completed
                    }
                    Err(err) => {
                        warn!(
                            event_id = event.id,
                            aggregate_id = %event.aggregate_id,
                            error = %err,
                            "Failed to publish event"
                        );
                        OutboxStatus::Failed
                    }
                },
                Err(err) => {
                    warn!(
                        event_id = event.id,
                        aggregate_id = %event.aggregate_id,
                        error = %err,
                        "Broker rejected event before sending"
                    );
                    OutboxStatus::Failed
                }
            };

            let write = match tracker.resolve(&event, status).await {
                Ok(outcome) => Some(outcome),
                Err(err) => {
                    error!(
                        event_id = event.id,
                        aggregate_id = %event.aggregate_id,
                        %status,
                        error = %err,
                        "Failed to record event status, leaving it for the reaper"
                    );
                    None
                }
            };

            Dispatched { status, write }
        }
    }
}
