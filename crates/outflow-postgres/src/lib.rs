//! PostgreSQL implementation of the outflow event store.
//!
//! This crate provides the production [`EventStore`] for the outflow relay.
//!
//! # Features
//!
//! - Batch claiming with `FOR UPDATE SKIP LOCKED`, so concurrent relays
//!   partition the backlog instead of queueing on each other's locks
//! - Conditional claim update that re-checks the status inside the transaction
//! - Bulk lease release for the reaper
//! - Ingestion inside the caller's own business transaction
//!
//! # Database Schema
//!
//! Shipped as an embedded migration (see [`PgEventStore::migrate`]):
//!
//! ```sql
//! CREATE TABLE outbox_event (
//!     id BIGSERIAL PRIMARY KEY,
//!     aggregate_id TEXT NOT NULL,
//!     event_type TEXT NOT NULL,
//!     payload TEXT NOT NULL,
//!
//!     status TEXT NOT NULL DEFAULT 'STARTED'
//!         CHECK (status IN ('STARTED', 'PROCESSING', 'FAILED', 'COMPLETED')),
//!     version INTEGER NOT NULL DEFAULT 0,
//!
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     claimed_at TIMESTAMPTZ,
//!
//!     CHECK ((status = 'PROCESSING') = (claimed_at IS NOT NULL))
//! );
//!
//! CREATE INDEX idx_outbox_event_claimable ON outbox_event (id)
//!     WHERE status IN ('STARTED', 'FAILED');
//! CREATE INDEX idx_outbox_event_lease ON outbox_event (claimed_at)
//!     WHERE status = 'PROCESSING';
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use outflow_postgres::{insert_outbox_event, PgEventStore};
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! let store = PgEventStore::new(pool.clone());
//! store.migrate().await?;
//!
//! // Record the event next to the business write
//! let mut tx = pool.begin().await?;
//! sqlx::query("UPDATE orders SET state = 'placed' WHERE id = $1").bind(order_id).execute(&mut *tx).await?;
//! insert_outbox_event(&mut *tx, &NewOutboxEvent::new(order_id.to_string(), "ORDER_CREATED", payload)).await?;
//! tx.commit().await?;
//!
//! // Hand the store to the relay
//! let relay = Relay::new(config, Arc::new(store), broker)?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outflow_core::{
    ClaimTransaction, EventId, EventStore, NewOutboxEvent, OutboxEvent, OutboxStats,
    OutboxStatus, StoreError,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgExecutor, PgPool, Postgres, Row, Transaction};
use tracing::debug;

/// PostgreSQL event store.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    /// Create a store on an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool of at most `max_connections`.
    ///
    /// Each claim holds one connection for the length of its transaction,
    /// so size the pool for concurrent cycles plus status writes.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(StoreError::database)?;
        Ok(Self::new(pool))
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(StoreError::database)
    }
}

/// Insert a new STARTED event through any executor, typically the caller's
/// open business transaction so the event commits or rolls back with it.
pub async fn insert_outbox_event<'e, E>(
    executor: E,
    event: &NewOutboxEvent,
) -> Result<OutboxEvent, StoreError>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query(
        r#"
        INSERT INTO outbox_event (aggregate_id, event_type, payload)
        VALUES ($1, $2, $3)
        RETURNING id, aggregate_id, event_type, payload, status, version, created_at, claimed_at
        "#,
    )
    .bind(&event.aggregate_id)
    .bind(&event.event_type)
    .bind(&event.payload)
    .fetch_one(executor)
    .await
    .map_err(StoreError::database)?;

    event_from_row(&row)
}

fn event_from_row(row: &PgRow) -> Result<OutboxEvent, StoreError> {
    let status: String = row.try_get("status").map_err(StoreError::database)?;

    Ok(OutboxEvent {
        id: row.try_get("id").map_err(StoreError::database)?,
        aggregate_id: row.try_get("aggregate_id").map_err(StoreError::database)?,
        event_type: row.try_get("event_type").map_err(StoreError::database)?,
        payload: row.try_get("payload").map_err(StoreError::database)?,
        status: status.parse()?,
        version: row.try_get("version").map_err(StoreError::database)?,
        created_at: row.try_get("created_at").map_err(StoreError::database)?,
        claimed_at: row.try_get("claimed_at").map_err(StoreError::database)?,
    })
}

/// Claim transaction on a dedicated pooled connection. Dropping it without
/// [`commit`](ClaimTransaction::commit) rolls back and releases the row locks.
struct PgClaimTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ClaimTransaction for PgClaimTransaction {
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent claimants split the
    /// backlog rather than wait on each other.
    async fn find_claimable_ids(&mut self, limit: usize) -> Result<Vec<EventId>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id
            FROM outbox_event
            WHERE status IN ('STARTED', 'FAILED')
            ORDER BY id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(StoreError::database)
    }

    async fn claim_by_ids(
        &mut self,
        ids: &[EventId],
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_event
            SET status = 'PROCESSING',
                claimed_at = $1,
                version = version + 1
            WHERE id = ANY($2)
              AND status IN ('STARTED', 'FAILED')
            "#,
        )
        .bind(now)
        .bind(ids)
        .execute(&mut *self.tx)
        .await
        .map_err(StoreError::database)?;

        Ok(result.rows_affected())
    }

    async fn find_by_ids(&mut self, ids: &[EventId]) -> Result<Vec<OutboxEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, aggregate_id, event_type, payload, status, version, created_at, claimed_at
            FROM outbox_event
            WHERE id = ANY($1)
            ORDER BY id ASC
            "#,
        )
        .bind(ids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(StoreError::database)?;

        rows.iter().map(event_from_row).collect()
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let PgClaimTransaction { tx } = *self;
        tx.commit().await.map_err(StoreError::database)
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn begin_claim(&self) -> Result<Box<dyn ClaimTransaction>, StoreError> {
        let tx = self.pool.begin().await.map_err(StoreError::database)?;
        Ok(Box::new(PgClaimTransaction { tx }))
    }

    /// Single bulk statement; needs no prior selection.
    async fn release_expired_leases(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_event
            SET status = 'FAILED',
                claimed_at = NULL,
                version = version + 1
            WHERE status = 'PROCESSING'
              AND claimed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;

        Ok(result.rows_affected())
    }

    async fn update_status(&self, id: EventId, status: OutboxStatus) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_event
            SET status = $2,
                claimed_at = NULL,
                version = version + 1
            WHERE id = $1
              AND status <> 'COMPLETED'
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;

        Ok(result.rows_affected())
    }

    /// The conflict check is a follow-up read and only classifies the miss;
    /// the guarded update alone decides whether anything was written.
    async fn update_status_versioned(
        &self,
        id: EventId,
        status: OutboxStatus,
        expected_version: i32,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_event
            SET status = $2,
                claimed_at = NULL,
                version = version + 1
            WHERE id = $1
              AND version = $3
              AND status <> 'COMPLETED'
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;

        if result.rows_affected() > 0 {
            return Ok(result.rows_affected());
        }

        let current = sqlx::query("SELECT version, status FROM outbox_event WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::database)?;

        let Some(row) = current else {
            return Ok(0);
        };
        let version: i32 = row.try_get("version").map_err(StoreError::database)?;
        let current_status: String = row.try_get("status").map_err(StoreError::database)?;

        if current_status != OutboxStatus::Completed.as_str() && version != expected_version {
            debug!(id, expected_version, version, "Versioned status write lost the race");
            return Err(StoreError::Conflict {
                id,
                expected_version,
            });
        }
        Ok(0)
    }

    async fn insert_event(&self, event: NewOutboxEvent) -> Result<OutboxEvent, StoreError> {
        insert_outbox_event(&self.pool, &event).await
    }

    async fn find_event(&self, id: EventId) -> Result<Option<OutboxEvent>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, aggregate_id, event_type, payload, status, version, created_at, claimed_at
            FROM outbox_event
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)?;

        row.as_ref().map(event_from_row).transpose()
    }

    /// Get statistics about outbox health.
    async fn stats(&self) -> Result<OutboxStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'STARTED') as started,
                COUNT(*) FILTER (WHERE status = 'PROCESSING') as processing,
                COUNT(*) FILTER (WHERE status = 'FAILED') as failed,
                COUNT(*) FILTER (WHERE status = 'COMPLETED') as completed
            FROM outbox_event
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::database)?;

        Ok(OutboxStats {
            started: row.try_get("started").map_err(StoreError::database)?,
            processing: row.try_get("processing").map_err(StoreError::database)?,
            failed: row.try_get("failed").map_err(StoreError::database)?,
            completed: row.try_get("completed").map_err(StoreError::database)?,
        })
    }
}
