//! PublisherLoop - Outbox イベントの配送
//!
//! # フロー
//! 1. `interval` ごとに `CycleGuard` への進入を試みる
//! 2. 同じプロセスの前サイクルが実行中なら、その tick は skip
//! 3. それ以外は `OutboxDispatcher::dispatch_cycle()` を実行。エラーはログに
//!    残し、次の tick で再試行
//!
//! guard が防ぐのは同一プロセス内の重なりだけ。プロセス間の排他はストアの
//! アトミックな claim が担う。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::dispatcher::{DispatchError, OutboxDispatcher};

/// In-process re-entrancy flag for dispatch cycles.
#[derive(Debug, Default)]
pub struct CycleGuard {
    running: AtomicBool,
}

/// Held while a cycle runs; dropping it reopens the guard.
#[derive(Debug)]
pub struct CycleTicket<'a> {
    guard: &'a CycleGuard,
}

impl CycleGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_enter(&self) -> Option<CycleTicket<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleTicket { guard: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for CycleTicket<'_> {
    fn drop(&mut self) {
        self.guard.running.store(false, Ordering::Release);
    }
}

pub struct PublisherLoop {
    dispatcher: Arc<OutboxDispatcher>,
    interval: Duration,
    guard: CycleGuard,
}

impl PublisherLoop {
    pub fn new(dispatcher: Arc<OutboxDispatcher>, interval: Duration) -> Self {
        Self {
            dispatcher,
            interval,
            guard: CycleGuard::new(),
        }
    }

    pub fn guard(&self) -> &CycleGuard {
        &self.guard
    }

    /// One guarded cycle. `None` when a cycle is already running here.
    pub async fn tick(&self) -> Option<Result<usize, DispatchError>> {
        let Some(_ticket) = self.guard.try_enter() else {
            debug!("previous dispatch cycle still running; skipping tick");
            return None;
        };
        Some(self.dispatcher.dispatch_cycle().await)
    }

    /// Tick until `shutdown` flips to `true` (or its sender is dropped).
    /// A cycle in progress is never interrupted.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval = ?self.interval, "publisher loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.tick().await {
                        Some(Ok(0)) | None => {}
                        Some(Ok(published)) => info!(published, "dispatch cycle done"),
                        Some(Err(e)) => error!(error = %e, "dispatch cycle failed"),
                    }
                }
            }
        }
        info!("publisher loop stopped");
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use crate::app::dispatcher::DispatcherSettings;
    use crate::domain::{OutboxEvent, OutboxStatus};
    use crate::impls::{InMemoryEventStore, InMemoryJobQueue};
    use crate::policy::{RetryPolicy, RetryPolicyTable};
    use crate::ports::{Clock, EventStore, FixedClock, IdGenerator, NoTargetProbe, UlidGenerator};
    use crate::typed::{Job, JobRegistry};

    #[derive(Serialize, Deserialize)]
    struct UpdateLabels {
        lead: String,
    }

    impl Job for UpdateLabels {
        const TYPE: &'static str = "labels.update";

        fn natural_key(&self) -> String {
            self.lead.clone()
        }
    }

    fn publisher(store: &InMemoryEventStore, clock: &FixedClock) -> PublisherLoop {
        let mut registry = JobRegistry::new();
        registry.declare::<UpdateLabels>().unwrap();
        let mut policies = RetryPolicyTable::new();
        policies.insert(
            UpdateLabels::job_type(),
            RetryPolicy {
                retry_limit: 1,
                retry_delay: Duration::from_secs(5),
                retry_backoff: false,
                dead_letter: UpdateLabels::job_type().dead_letter(),
            },
        );
        let dispatcher = OutboxDispatcher::new(
            Arc::new(store.clone()),
            Arc::new(InMemoryJobQueue::new(Arc::new(clock.clone()))),
            Arc::new(registry),
            Arc::new(policies),
            Arc::new(NoTargetProbe),
            Arc::new(clock.clone()),
            DispatcherSettings::default(),
        );
        PublisherLoop::new(Arc::new(dispatcher), Duration::from_millis(100))
    }

    #[test]
    fn guard_admits_one_cycle_at_a_time() {
        let guard = CycleGuard::new();

        let ticket = guard.try_enter();
        assert!(ticket.is_some());
        assert!(guard.is_running());
        assert!(guard.try_enter().is_none());

        drop(ticket);
        assert!(!guard.is_running());
        assert!(guard.try_enter().is_some());
    }

    #[tokio::test]
    async fn tick_is_skipped_while_guard_is_held() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap());
        let store = InMemoryEventStore::new();
        let publisher = publisher(&store, &clock);

        let ticket = publisher.guard().try_enter();
        assert!(publisher.tick().await.is_none());
        drop(ticket);

        assert_eq!(publisher.tick().await.unwrap().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_dispatches_until_shutdown() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap());
        let store = InMemoryEventStore::new();
        let ids = UlidGenerator::new(clock.clone());
        let event = OutboxEvent::new(
            ids.event_id(),
            UpdateLabels::job_type(),
            json!({ "lead": "lead-4" }),
            clock.now(),
        );
        let id = event.id;
        store.append(event).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = Arc::new(publisher(&store, &clock)).spawn(rx);

        tokio::time::sleep(Duration::from_millis(350)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(store.get(id).await.unwrap().unwrap().status, OutboxStatus::Sent);
    }
}
