//! EventStore port - outbox テーブル（未配送 publish の正本）
//!
//! outbox 行は告げるドメイン変更と同じトランザクションで書き込まれ、
//! dispatcher だけが消費する。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::app::status::OutboxCounts;
use crate::domain::{EventId, OutboxEvent, OutboxStatus, Resolution, StoreError};

/// Outbox storage.
///
/// # Invariants
/// - `claim_batch` selects and marks `processing` in one atomic step; two
///   concurrent callers never receive the same row.
/// - `resolve` applies only to rows currently `processing`; terminal rows are
///   never modified.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: OutboxEvent) -> Result<(), StoreError>;

    /// Claim up to `limit` eligible events, oldest first.
    ///
    /// Eligible: `pending`, `failed` with `next_attempt_at <= now`, or
    /// `processing` last touched before `stale_before`.
    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, StoreError>;

    /// Record how a claimed event left `processing`.
    ///
    /// Returns `false` when the row was already resolved elsewhere (e.g. by a
    /// dispatcher that reclaimed it after a stale lock).
    async fn resolve(
        &self,
        id: EventId,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, StoreError>;

    /// Events in `status`, oldest first.
    async fn list(&self, status: OutboxStatus, limit: usize) -> Result<Vec<OutboxEvent>, StoreError>;

    async fn counts(&self) -> Result<OutboxCounts, StoreError>;
}
