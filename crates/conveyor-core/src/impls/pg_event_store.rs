//! Postgres-backed EventStore.
//!
//! Schema: `migrations/0001_outbox_events.sql`.
//!
//! ## Claiming
//!
//! `claim_batch` selects eligible rows with `FOR UPDATE SKIP LOCKED` and marks
//! them `processing` in the same statement. Concurrent dispatchers skip rows
//! another transaction holds, so no row is handed out twice.
//!
//! ## Error mapping
//!
//! | SQLx error | StoreError |
//! |---|---|
//! | Database `23505` (unique violation) on insert | `Duplicate` |
//! | PoolClosed / PoolTimedOut / Io / Tls | `Unavailable` |
//! | Decode / ColumnDecode | `Corrupt` |
//! | anything else | `Unavailable` |

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use crate::app::status::OutboxCounts;
use crate::domain::{
    EventId, JobType, OutboxEvent, OutboxStatus, Resolution, StoreError,
};
use crate::ports::EventStore;

pub const MIGRATION: &str = include_str!("../../migrations/0001_outbox_events.sql");

const COLUMNS: &str = "id, type, payload, status, attempts, last_error, next_attempt_at, processed_at, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox table and indexes if missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Insert an outbox row inside the caller's transaction, next to the domain
    /// write it announces. Both commit or neither does.
    #[instrument(skip(tx, event), fields(event_id = %event.id, job_type = %event.job_type), err)]
    pub async fn append_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> Result<(), StoreError> {
        insert(event)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_insert_error(event.id, e))?;
        Ok(())
    }
}

fn insert(event: &OutboxEvent) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO outbox_events
            (id, type, payload, status, attempts, last_error, next_attempt_at, processed_at, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(event.id.as_ulid().to_string())
    .bind(event.job_type.as_str())
    .bind(&event.payload)
    .bind(event.status.as_str())
    .bind(i32::try_from(event.attempts).unwrap_or(i32::MAX))
    .bind(event.last_error.as_deref())
    .bind(event.next_attempt_at)
    .bind(event.processed_at)
    .bind(event.created_at)
    .bind(event.updated_at)
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn append(&self, event: OutboxEvent) -> Result<(), StoreError> {
        insert(&event)
            .execute(&self.pool)
            .await
            .map_err(|e| map_insert_error(event.id, e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let sql = format!(
            r#"
            WITH candidates AS (
                SELECT id FROM outbox_events
                WHERE status = 'pending'
                   OR (status = 'failed' AND (next_attempt_at IS NULL OR next_attempt_at <= $1))
                   OR (status = 'processing' AND updated_at < $2)
                ORDER BY created_at ASC, id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_events o
               SET status = 'processing', updated_at = $1
              FROM candidates c
             WHERE o.id = c.id
            RETURNING {}
            "#,
            qualified_columns("o")
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(stale_before)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;

        // UPDATE ... RETURNING does not preserve the CTE order.
        let mut events = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(events)
    }

    #[instrument(skip(self, resolution), fields(status = %resolution.target_status()), err)]
    async fn resolve(
        &self,
        id: EventId,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("resolve", e))?;

        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM outbox_events WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_ulid().to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("resolve", e))?
        .ok_or(StoreError::NotFound(id))?;

        let mut event = decode_row(&row)?;
        if event.status != OutboxStatus::Processing {
            return Ok(false);
        }
        event.apply(resolution, now)?;

        sqlx::query(
            r#"
            UPDATE outbox_events
               SET status = $2, attempts = $3, last_error = $4, next_attempt_at = $5,
                   processed_at = $6, updated_at = $7
             WHERE id = $1
            "#,
        )
        .bind(id.as_ulid().to_string())
        .bind(event.status.as_str())
        .bind(i32::try_from(event.attempts).unwrap_or(i32::MAX))
        .bind(event.last_error.as_deref())
        .bind(event.next_attempt_at)
        .bind(event.processed_at)
        .bind(event.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("resolve", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("resolve", e))?;
        Ok(true)
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM outbox_events WHERE id = $1"))
            .bind(id.as_ulid().to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn list(&self, status: OutboxStatus, limit: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM outbox_events WHERE status = $1 ORDER BY created_at ASC, id ASC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;
        rows.iter().map(decode_row).collect()
    }

    async fn counts(&self) -> Result<OutboxCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM outbox_events GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("counts", e))?;

        let mut counts = OutboxCounts::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("counts", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("counts", e))?;
            let status = OutboxStatus::from_str(&status).map_err(StoreError::Corrupt)?;
            let n = usize::try_from(n).unwrap_or(0);
            match status {
                OutboxStatus::Pending => counts.pending = n,
                OutboxStatus::Processing => counts.processing = n,
                OutboxStatus::Sent => counts.sent = n,
                OutboxStatus::Failed => counts.failed = n,
                OutboxStatus::DeadLetter => counts.dead_letter = n,
            }
        }
        Ok(counts)
    }
}

fn qualified_columns(alias: &str) -> String {
    COLUMNS
        .split(", ")
        .map(|c| format!("{alias}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn decode_row(row: &PgRow) -> Result<OutboxEvent, StoreError> {
    let corrupt = |e: sqlx::Error| StoreError::Corrupt(e.to_string());

    let id: String = row.try_get("id").map_err(corrupt)?;
    let job_type: String = row.try_get("type").map_err(corrupt)?;
    let status: String = row.try_get("status").map_err(corrupt)?;
    let attempts: i32 = row.try_get("attempts").map_err(corrupt)?;

    Ok(OutboxEvent {
        id: EventId::from_str(&id).map_err(|e| StoreError::Corrupt(format!("id '{id}': {e}")))?,
        job_type: JobType::parse(job_type).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        payload: row.try_get("payload").map_err(corrupt)?,
        status: OutboxStatus::from_str(&status).map_err(StoreError::Corrupt)?,
        attempts: u32::try_from(attempts).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        last_error: row.try_get("last_error").map_err(corrupt)?,
        next_attempt_at: row.try_get("next_attempt_at").map_err(corrupt)?,
        processed_at: row.try_get("processed_at").map_err(corrupt)?,
        created_at: row.try_get("created_at").map_err(corrupt)?,
        updated_at: row.try_get("updated_at").map_err(corrupt)?,
    })
}

fn map_insert_error(id: EventId, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err
        && db_err.code().as_deref() == Some("23505")
    {
        return StoreError::Duplicate(id);
    }
    map_sqlx_error("append", err)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Decode(e) => StoreError::Corrupt(format!("{operation}: {e}")),
        sqlx::Error::ColumnDecode { index, source } => {
            StoreError::Corrupt(format!("{operation}: column {index}: {source}"))
        }
        sqlx::Error::Database(db_err) => {
            StoreError::Unavailable(format!("database error in {operation}: {}", db_err.message()))
        }
        other => StoreError::Unavailable(format!("sqlx error in {operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returning_clause_is_qualified() {
        let cols = qualified_columns("o");
        assert!(cols.starts_with("o.id, o.type, o.payload"));
        assert!(cols.ends_with("o.updated_at"));
    }

    #[test]
    fn migration_defines_outbox_table() {
        assert!(MIGRATION.contains("CREATE TABLE IF NOT EXISTS outbox_events"));
        for status in OutboxStatus::ALL {
            assert!(MIGRATION.contains(&format!("'{}'", status.as_str())));
        }
    }
}
