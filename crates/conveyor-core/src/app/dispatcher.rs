//! OutboxDispatcher - outbox イベントの claim と publish
//!
//! # フロー（1 サイクル）
//! 1. `EventStore::claim_batch` で対象行をアトミックに claim（`processing` にする）
//! 2. 古い順に各イベントを処理:
//!    - terminal → skip
//!    - `attempts >= max_attempts` → `dead_letter`（publish しない）
//!    - 未知の type / 不正な payload / retry policy なし → `dead_letter`（publish しない）
//!    - target が既に進んでいる（または存在しない）→ `sent`（publish しない）
//!    - singleton key `outbox:<id>` で publish → `sent`
//!    - publish エラー → backoff 付きで `failed`、`max_attempts` で `dead_letter`
//! 3. publish に成功した件数を返す
//!
//! 1 件のエラーはログに残し、バッチは止めない。複数 dispatcher の並行実行を
//! 安全にしているのはストア側の claim であり、プロセス内ロックには依存しない。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::domain::run::outbox_key;
use crate::domain::{OutboxEvent, PublishOptions, QueueError, Resolution, StoreError};
use crate::policy::{OutboxBackoff, RetryPolicyTable};
use crate::ports::clock::{self, Clock};
use crate::ports::{EventStore, JobQueue, TargetProbe, TargetState};
use crate::typed::JobRegistry;

pub const MAX_ATTEMPTS_EXCEEDED: &str = "max attempts exceeded";

/// Bounded retry policy for the publish call itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxPublishPolicy {
    pub retry_limit: u32,
    pub retry_delay: Duration,
    pub retry_backoff: bool,
}

impl Default for OutboxPublishPolicy {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            retry_delay: Duration::from_secs(5),
            retry_backoff: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff: OutboxBackoff,
    /// `processing` rows untouched for this long are reclaimed.
    pub stale_lock: Duration,
    pub store_timeout: Duration,
    pub queue_timeout: Duration,
    pub publish: OutboxPublishPolicy,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_attempts: 5,
            backoff: OutboxBackoff::default(),
            stale_lock: Duration::from_secs(5 * 60),
            store_timeout: Duration::from_secs(10),
            queue_timeout: Duration::from_secs(10),
            publish: OutboxPublishPolicy::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("claiming outbox batch failed: {0}")]
    Claim(#[source] StoreError),
}

/// What happened to one claimed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Published,
    Deduplicated,
    Guarded,
    Failed,
    DeadLettered,
    Skipped,
}

pub struct OutboxDispatcher {
    store: Arc<dyn EventStore>,
    queue: Arc<dyn JobQueue>,
    registry: Arc<JobRegistry>,
    policies: Arc<RetryPolicyTable>,
    probe: Arc<dyn TargetProbe>,
    clock: Arc<dyn Clock>,
    settings: DispatcherSettings,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn EventStore>,
        queue: Arc<dyn JobQueue>,
        registry: Arc<JobRegistry>,
        policies: Arc<RetryPolicyTable>,
        probe: Arc<dyn TargetProbe>,
        clock: Arc<dyn Clock>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            policies,
            probe,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// Run one claim-and-publish cycle. Returns the number of events published.
    #[instrument(skip(self), fields(batch_size = self.settings.batch_size))]
    pub async fn dispatch_cycle(&self) -> Result<usize, DispatchError> {
        let now = self.clock.now();
        let stale_before = clock::before(now, self.settings.stale_lock);

        let claimed = self
            .store_call(self.store.claim_batch(now, stale_before, self.settings.batch_size))
            .await
            .map_err(DispatchError::Claim)?;
        if claimed.is_empty() {
            return Ok(0);
        }
        debug!(claimed = claimed.len(), "claimed outbox batch");

        let mut published = 0;
        for event in &claimed {
            match self.dispatch_event(event).await {
                Ok(Dispatched::Published | Dispatched::Deduplicated) => published += 1,
                Ok(_) => {}
                Err(e) => {
                    // Row stays `processing` until the stale-lock window reclaims it.
                    error!(event_id = %event.id, job_type = %event.job_type, error = %e, "outbox event handling failed");
                }
            }
        }
        Ok(published)
    }

    async fn dispatch_event(&self, event: &OutboxEvent) -> Result<Dispatched, StoreError> {
        if event.status.is_terminal() {
            return Ok(Dispatched::Skipped);
        }

        if event.attempts >= self.settings.max_attempts {
            warn!(event_id = %event.id, attempts = event.attempts, "outbox event out of attempts");
            return self
                .dead_letter(event, MAX_ATTEMPTS_EXCEEDED.to_string(), false)
                .await;
        }

        let Some(schema) = self.registry.schema(&event.job_type) else {
            return self
                .dead_letter(event, format!("unknown job type '{}'", event.job_type), false)
                .await;
        };
        if let Err(e) = schema.validate(&event.payload) {
            return self
                .dead_letter(event, format!("invalid payload: {e}"), false)
                .await;
        }
        let Some(policy) = self.policies.get(&event.job_type) else {
            return self
                .dead_letter(event, format!("no retry policy for '{}'", event.job_type), false)
                .await;
        };

        match self.store_call(self.probe.probe(event)).await {
            Ok(TargetState::AlreadyAdvanced) => {
                info!(event_id = %event.id, job_type = %event.job_type, "target already advanced; marking sent without publish");
                return self.resolve(event, Resolution::Sent { attempted: false }, Dispatched::Guarded).await;
            }
            Ok(TargetState::Missing) => {
                warn!(event_id = %event.id, job_type = %event.job_type, "correlated record missing; marking sent without publish");
                return self.resolve(event, Resolution::Sent { attempted: false }, Dispatched::Guarded).await;
            }
            Ok(TargetState::Proceed | TargetState::NotApplicable) => {}
            Err(e) => {
                return self.record_failure(event, format!("target probe failed: {e}")).await;
            }
        }

        let publish = self.settings.publish;
        let options = PublishOptions {
            retry_limit: publish.retry_limit,
            retry_delay: publish.retry_delay,
            retry_backoff: publish.retry_backoff,
            dead_letter: Some(policy.dead_letter.clone()),
            singleton_key: Some(outbox_key(event.id)),
        };

        match self
            .queue_call(self.queue.publish(&event.job_type, event.payload.clone(), options))
            .await
        {
            Ok(published) => {
                let outcome = if published.is_duplicate() {
                    Dispatched::Deduplicated
                } else {
                    Dispatched::Published
                };
                info!(
                    event_id = %event.id,
                    job_type = %event.job_type,
                    message_id = %published.message_id(),
                    deduplicated = published.is_duplicate(),
                    "outbox event published"
                );
                self.resolve(event, Resolution::Sent { attempted: true }, outcome).await
            }
            Err(e) => self.record_failure(event, e.to_string()).await,
        }
    }

    async fn record_failure(&self, event: &OutboxEvent, error: String) -> Result<Dispatched, StoreError> {
        let attempts = event.attempts.saturating_add(1);
        if attempts >= self.settings.max_attempts {
            warn!(event_id = %event.id, attempts, error = %error, "outbox event dead-lettered after final attempt");
            return self.dead_letter(event, error, true).await;
        }

        let next_attempt_at = clock::after(self.clock.now(), self.settings.backoff.delay(attempts));
        warn!(
            event_id = %event.id,
            job_type = %event.job_type,
            attempts,
            next_attempt_at = %next_attempt_at,
            error = %error,
            "outbox publish failed; will retry"
        );
        self.resolve(
            event,
            Resolution::Failed {
                error,
                next_attempt_at,
            },
            Dispatched::Failed,
        )
        .await
    }

    async fn dead_letter(
        &self,
        event: &OutboxEvent,
        reason: String,
        attempted: bool,
    ) -> Result<Dispatched, StoreError> {
        error!(event_id = %event.id, job_type = %event.job_type, reason = %reason, "outbox event dead-lettered");
        self.resolve(
            event,
            Resolution::DeadLetter { reason, attempted },
            Dispatched::DeadLettered,
        )
        .await
    }

    async fn resolve(
        &self,
        event: &OutboxEvent,
        resolution: Resolution,
        outcome: Dispatched,
    ) -> Result<Dispatched, StoreError> {
        let now = self.clock.now();
        let applied = self
            .store_call(self.store.resolve(event.id, resolution, now))
            .await?;
        if !applied {
            debug!(event_id = %event.id, "outbox event already resolved by another dispatcher");
            return Ok(Dispatched::Skipped);
        }
        Ok(outcome)
    }

    async fn store_call<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let limit = self.settings.store_timeout;
        tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(StoreError::Timeout(limit)))
    }

    async fn queue_call<T>(
        &self,
        fut: impl Future<Output = Result<T, QueueError>>,
    ) -> Result<T, QueueError> {
        let limit = self.settings.queue_timeout;
        tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(QueueError::Timeout(limit)))
    }
}
