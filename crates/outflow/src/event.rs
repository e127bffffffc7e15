//! Outbox rows and their status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Store-assigned surrogate identifier of an outbox row.
pub type EventId = i64;

/// Delivery status of an outbox row.
///
/// ```text
/// STARTED ──claim──► PROCESSING ──success──► COMPLETED
///                      │    ▲
///           failure /  │    │ claim
///        lease expiry  ▼    │
///                     FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Started,
    Processing,
    Failed,
    Completed,
}

impl OutboxStatus {
    /// Statuses a claimant may pick up.
    pub const CLAIMABLE: [OutboxStatus; 2] = [OutboxStatus::Started, OutboxStatus::Failed];

    /// Column value as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Started => "STARTED",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Failed => "FAILED",
            OutboxStatus::Completed => "COMPLETED",
        }
    }

    pub fn is_claimable(&self) -> bool {
        Self::CLAIMABLE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Completed)
    }

    /// Whether the Status Tracker may write this status after a send.
    pub fn is_resolution(&self) -> bool {
        matches!(self, OutboxStatus::Completed | OutboxStatus::Failed)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTED" => Ok(OutboxStatus::Started),
            "PROCESSING" => Ok(OutboxStatus::Processing),
            "FAILED" => Ok(OutboxStatus::Failed),
            "COMPLETED" => Ok(OutboxStatus::Completed),
            other => Err(StoreError::Decode(format!("unknown outbox status '{other}'"))),
        }
    }
}

/// A durable unit of at-least-once work.
///
/// `payload` and `event_type` are opaque to the engine. `claimed_at` is set
/// if and only if `status` is [`OutboxStatus::Processing`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: EventId,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: String,
    pub status: OutboxStatus,
    /// Concurrency token, bumped on every successful update.
    pub version: i32,
    pub created_at: DateTime<Utc>,
    /// Claim lease timestamp.
    pub claimed_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn is_claimable(&self) -> bool {
        self.status.is_claimable()
    }

    /// Whether the lease of a PROCESSING row started before `cutoff`.
    pub fn lease_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Processing
            && self.claimed_at.is_some_and(|claimed_at| claimed_at < cutoff)
    }
}

/// Input accepted by the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOutboxEvent {
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: String,
}

impl NewOutboxEvent {
    pub fn new(
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload: payload.into(),
        }
    }
}
