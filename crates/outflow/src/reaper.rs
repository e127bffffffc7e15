//! Lease recovery for events whose publisher died mid-flight.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{OutflowError, OutflowResult};
use crate::store::EventStore;

/// Releases PROCESSING events whose lease outlived `lease_timeout` back to
/// FAILED, making them claimable again.
///
/// This is the only recovery path for crashed workers. An abandoned event
/// stays unavailable for up to one lease timeout plus one sweep interval.
#[derive(Clone)]
pub struct Reaper {
    store: Arc<dyn EventStore>,
}

impl Reaper {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Sweep against the wall clock.
    pub async fn sweep(&self, lease_timeout: Duration) -> OutflowResult<u64> {
        self.sweep_at(Utc::now(), lease_timeout).await
    }

    /// Release every lease taken before `now - lease_timeout`.
    pub async fn sweep_at(&self, now: DateTime<Utc>, lease_timeout: Duration) -> OutflowResult<u64> {
        let cutoff = lease_cutoff(now, lease_timeout)?;

        let released = self.store.release_expired_leases(cutoff).await?;
        if released > 0 {
            warn!(released, %cutoff, "Released stuck outbox events");
        } else {
            debug!(%cutoff, "No expired leases");
        }
        Ok(released)
    }
}

/// `now - lease_timeout`, or an error when the timeout does not fit.
pub fn lease_cutoff(now: DateTime<Utc>, lease_timeout: Duration) -> OutflowResult<DateTime<Utc>> {
    chrono::Duration::from_std(lease_timeout)
        .ok()
        .and_then(|timeout| now.checked_sub_signed(timeout))
        .ok_or(OutflowError::LeaseOutOfRange(lease_timeout))
}
