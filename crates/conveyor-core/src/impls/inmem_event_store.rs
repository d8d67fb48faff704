//! InMemoryEventStore - 開発・テスト用の outbox ストア

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::app::status::OutboxCounts;
use crate::domain::{EventId, OutboxEvent, OutboxStatus, Resolution, StoreError};
use crate::ports::EventStore;

/// Outbox rows behind one mutex. Claiming happens inside a single critical
/// section, which gives the same exclusivity `FOR UPDATE SKIP LOCKED` gives
/// the Postgres store.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    rows: Arc<Mutex<HashMap<EventId, OutboxEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    /// Overwrite a row as-is (test setup for crashed dispatchers and the like).
    #[cfg(test)]
    pub(crate) async fn put_raw(&self, event: OutboxEvent) {
        self.rows.lock().await.insert(event.id, event);
    }
}

fn oldest_first(events: &mut [OutboxEvent]) {
    events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: OutboxEvent) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&event.id) {
            return Err(StoreError::Duplicate(event.id));
        }
        rows.insert(event.id, event);
        Ok(())
    }

    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let mut rows = self.rows.lock().await;

        let mut eligible: Vec<OutboxEvent> = rows
            .values()
            .filter(|e| e.is_claimable(now, stale_before))
            .cloned()
            .collect();
        oldest_first(&mut eligible);
        eligible.truncate(limit);

        let mut claimed = Vec::with_capacity(eligible.len());
        for candidate in eligible {
            if let Some(row) = rows.get_mut(&candidate.id) {
                row.claim(now)?;
                claimed.push(row.clone());
            }
        }
        Ok(claimed)
    }

    async fn resolve(
        &self,
        id: EventId,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().await;
        let row = rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if row.status != OutboxStatus::Processing {
            return Ok(false);
        }
        row.apply(resolution, now)?;
        Ok(true)
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, StoreError> {
        Ok(self.rows.lock().await.get(&id).cloned())
    }

    async fn list(&self, status: OutboxStatus, limit: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        let rows = self.rows.lock().await;
        let mut events: Vec<OutboxEvent> = rows
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        oldest_first(&mut events);
        events.truncate(limit);
        Ok(events)
    }

    async fn counts(&self) -> Result<OutboxCounts, StoreError> {
        let rows = self.rows.lock().await;
        let mut counts = OutboxCounts::default();
        for event in rows.values() {
            counts.record(event.status);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobType;
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap()
    }

    fn event_at(created_at: DateTime<Utc>) -> OutboxEvent {
        OutboxEvent::new(
            EventId::from_ulid(Ulid::new()),
            JobType::parse("lead.discover").unwrap(),
            json!({"source": "crm"}),
            created_at,
        )
    }

    fn stale(now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::minutes(5)
    }

    #[tokio::test]
    async fn claim_marks_processing_oldest_first() {
        let store = InMemoryEventStore::new();
        let late = event_at(t0() + Duration::seconds(2));
        let early = event_at(t0());
        store.append(late.clone()).await.unwrap();
        store.append(early.clone()).await.unwrap();

        let now = t0() + Duration::seconds(3);
        let claimed = store.claim_batch(now, stale(now), 10).await.unwrap();

        assert_eq!(
            claimed.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![early.id, late.id]
        );
        assert!(claimed.iter().all(|e| e.status == OutboxStatus::Processing));

        let again = store.claim_batch(now, stale(now), 10).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn claim_respects_limit() {
        let store = InMemoryEventStore::new();
        for i in 0..5 {
            store.append(event_at(t0() + Duration::seconds(i))).await.unwrap();
        }
        let claimed = store.claim_batch(t0(), stale(t0()), 2).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(store.counts().await.unwrap().pending, 3);
    }

    #[tokio::test]
    async fn concurrent_claims_are_disjoint() {
        let store = InMemoryEventStore::new();
        for i in 0..40 {
            store.append(event_at(t0() + Duration::milliseconds(i))).await.unwrap();
        }

        let a = store.clone();
        let b = store.clone();
        let (left, right) = tokio::join!(
            async move { a.claim_batch(t0(), stale(t0()), 25).await.unwrap() },
            async move { b.claim_batch(t0(), stale(t0()), 25).await.unwrap() },
        );

        assert_eq!(left.len() + right.len(), 40);
        assert!(left.iter().all(|l| right.iter().all(|r| r.id != l.id)));
    }

    #[tokio::test]
    async fn resolve_skips_rows_no_longer_processing() {
        let store = InMemoryEventStore::new();
        let event = event_at(t0());
        store.append(event.clone()).await.unwrap();
        store.claim_batch(t0(), stale(t0()), 1).await.unwrap();

        assert!(store
            .resolve(event.id, Resolution::Sent { attempted: true }, t0())
            .await
            .unwrap());
        assert!(!store
            .resolve(event.id, Resolution::Sent { attempted: true }, t0())
            .await
            .unwrap());

        let stored = store.get(event.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn resolve_unknown_id_is_not_found() {
        let store = InMemoryEventStore::new();
        let err = store
            .resolve(EventId::from_ulid(Ulid::new()), Resolution::Sent { attempted: true }, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let store = InMemoryEventStore::new();
        let first = event_at(t0());
        let second = event_at(t0() + Duration::seconds(1));
        store.append(first.clone()).await.unwrap();
        store.append(second.clone()).await.unwrap();
        store.claim_batch(t0(), stale(t0()), 1).await.unwrap();

        let pending = store.list(OutboxStatus::Pending, 10).await.unwrap();
        assert_eq!(pending.iter().map(|e| e.id).collect::<Vec<_>>(), vec![second.id]);
        let processing = store.list(OutboxStatus::Processing, 10).await.unwrap();
        assert_eq!(processing[0].id, first.id);
    }
}
