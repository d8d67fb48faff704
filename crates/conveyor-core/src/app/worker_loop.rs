//! WorkerLoop - ステージ実行ループ
//!
//! # フロー（1 配送ごと）
//! 1. キューに handler がない → dead-letter
//! 2. payload の decode + validate → 失敗なら dead-letter
//! 3. handler を別タスクで `handler_timeout` 付きで実行
//! 4. `RetryableError` / timeout / panic → `fail`（リトライはキューのポリシーに従う）
//! 5. `Success` / `TerminalError` → 後続を enqueue してから `ack`
//!    enqueue 中のトランスポートエラーは lease を fail して再配送させる。
//!    既に enqueue 済みのステージは singleton key が吸収する。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, error, info_span, warn};

use super::chain::Chainer;
use crate::domain::{JobType, QueueError, RunContext, StageOutcome};
use crate::ports::{JobQueue, MessageLease};
use crate::typed::codec;
use crate::typed::{DynHandler, JobRegistry, StageContext};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Worker tasks per queue.
    pub concurrency: usize,
    pub batch_size: usize,
    /// Idle sleep when a fetch comes back empty.
    pub poll_interval: Duration,
    pub handler_timeout: Duration,
    pub queue_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            batch_size: 5,
            poll_interval: Duration::from_millis(500),
            handler_timeout: Duration::from_secs(60),
            queue_timeout: Duration::from_secs(10),
        }
    }
}

/// How one delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Completed,
    /// Handed back to the queue's retry policy.
    Failed,
    DeadLettered,
}

pub struct WorkerLoop {
    queue: Arc<dyn JobQueue>,
    registry: Arc<JobRegistry>,
    chainer: Arc<Chainer>,
    settings: WorkerSettings,
}

impl WorkerLoop {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        registry: Arc<JobRegistry>,
        chainer: Arc<Chainer>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            registry,
            chainer,
            settings,
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Fetch up to `batch_size` messages from `queue` and settle each one.
    /// Returns how many were fetched.
    pub async fn process_batch(&self, queue: &JobType) -> Result<usize, QueueError> {
        let leases = self
            .queue_call(self.queue.fetch(queue, self.settings.batch_size))
            .await?;
        let fetched = leases.len();

        for lease in leases {
            let message_id = lease.message().id;
            if let Err(e) = self.process(lease).await {
                error!(queue = %queue, message_id = %message_id, error = %e, "settling message failed");
            }
        }
        Ok(fetched)
    }

    pub async fn process(&self, lease: Box<dyn MessageLease>) -> Result<Processed, QueueError> {
        let message = lease.message();
        let job_type = message.queue.clone();
        let message_id = message.id;
        let payload = message.payload.clone();
        let delivery = message.retry_count.saturating_add(1);

        let Some(handler) = self.registry.handler(&job_type) else {
            warn!(job_type = %job_type, message_id = %message_id, "no handler registered; dead-lettering");
            return self
                .queue_call(lease.dead_letter(format!("no handler registered for '{job_type}'")))
                .await
                .map(|_| Processed::DeadLettered);
        };

        let run = codec::read_context(&payload)
            .unwrap_or_else(|| RunContext::start(message_id.to_string(), &job_type));
        let ctx = StageContext {
            job_type: job_type.clone(),
            message_id,
            delivery,
            run,
        };
        let span = info_span!(
            "stage",
            job_type = %job_type,
            message_id = %message_id,
            run_id = %ctx.run_id(),
            correlation_id = %ctx.correlation_id(),
            delivery,
        );

        self.run_stage(lease, handler, payload, ctx)
            .instrument(span)
            .await
    }

    async fn run_stage(
        &self,
        lease: Box<dyn MessageLease>,
        handler: Arc<dyn DynHandler>,
        payload: serde_json::Value,
        ctx: StageContext,
    ) -> Result<Processed, QueueError> {
        // Own task, so a handler panic settles only this lease.
        let limit = self.settings.handler_timeout;
        let stage_ctx = ctx.clone();
        let mut task = tokio::spawn(
            async move { handler.handle_dyn(payload, &stage_ctx).await }.instrument(Span::current()),
        );

        let handled = match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                warn!(timeout = ?limit, "handler timed out");
                self.queue_call(lease.fail(format!("handler timed out after {limit:?}"))).await?;
                return Ok(Processed::Failed);
            }
        };

        let outcome = match handled {
            Err(e) => {
                error!(error = %e, "handler panicked");
                self.queue_call(lease.fail(format!("handler panicked: {e}"))).await?;
                return Ok(Processed::Failed);
            }
            Ok(Err(e)) => {
                error!(error = %e, "malformed payload; dead-lettering");
                self.queue_call(lease.dead_letter(e.to_string())).await?;
                return Ok(Processed::DeadLettered);
            }
            Ok(Ok(outcome)) => outcome,
        };

        match &outcome {
            StageOutcome::RetryableError { reason } => {
                warn!(reason = %reason, "stage failed; will be retried");
                self.queue_call(lease.fail(reason.clone())).await?;
                return Ok(Processed::Failed);
            }
            StageOutcome::TerminalError { reason, notify } => {
                warn!(reason = %reason, notify = notify.len(), "stage failed terminally");
            }
            StageOutcome::Success { next } => {
                debug!(next = next.len(), "stage done");
            }
        }

        if let Err(e) = self.chainer.enqueue_all(&ctx.run, outcome.follow_ups()).await {
            if e.kind().is_retryable() {
                warn!(error = %e, "enqueueing next stage failed; stage will be redelivered");
                self.queue_call(lease.fail(e.to_string())).await?;
                return Ok(Processed::Failed);
            }
            error!(error = %e, "next stage cannot be enqueued; dead-lettering");
            self.queue_call(lease.dead_letter(e.to_string())).await?;
            return Ok(Processed::DeadLettered);
        }

        self.queue_call(lease.ack()).await?;
        Ok(Processed::Completed)
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

/// Worker group handle.
/// - group（と `shutdown_tx`）を drop するとワーカー全体が止まる
/// - `shutdown_and_join()` は処理中のメッセージの決着を待つ
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `settings.concurrency` workers for each queue.
    pub fn spawn(worker: Arc<WorkerLoop>, queues: &[JobType]) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let per_queue = worker.settings.concurrency.max(1);

        let mut joins = Vec::with_capacity(queues.len() * per_queue);
        for queue in queues {
            for worker_id in 0..per_queue {
                let w = Arc::clone(&worker);
                let q = queue.clone();
                let rx = shutdown_rx.clone();
                joins.push(tokio::spawn(async move {
                    worker_task(worker_id, q, w, rx).await;
                }));
            }
        }

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Stop fetching. Handlers already running finish their delivery.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            if let Err(e) = j.await {
                error!(error = %e, "worker task panicked");
            }
        }
    }
}

async fn worker_task(
    worker_id: usize,
    queue: JobType,
    worker: Arc<WorkerLoop>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(worker_id, queue = %queue, "worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let idle = match worker.process_batch(&queue).await {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) => {
                warn!(worker_id, queue = %queue, error = %e, "fetch failed");
                true
            }
        };
        if !idle {
            continue;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(worker.settings.poll_interval) => {}
        }
    }
    debug!(worker_id, queue = %queue, "worker stopped");
}
