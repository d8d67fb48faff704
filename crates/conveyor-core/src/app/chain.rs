//! Chainer - ステージの enqueue（run context + singleton key）
//!
//! 各ステージメッセージには以下が付く:
//! - job type の `RetryPolicy`（retry limit, delay, backoff, dead-letter queue）
//! - payload 内の `runId` / `correlationId`（新しい run、または親の子）
//! - singleton key。ステージは `<type>:<natural key>`、スケジュール起動は
//!   `schedule:<name>`。再配送された親が run を分岐させることはない。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::domain::run::stage_key;
use crate::domain::{ErrorKind, JobType, NextStage, PublishOptions, Published, QueueError, RunContext};
use crate::policy::RetryPolicyTable;
use crate::ports::{IdGenerator, JobQueue};
use crate::typed::codec::{self, CodecError};
use crate::typed::Job;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("no retry policy for job type '{0}'")]
    NoPolicy(JobType),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("enqueue into '{queue}' failed: {source}")]
    Queue {
        queue: JobType,
        #[source]
        source: QueueError,
    },
}

impl ChainError {
    /// Queue failures keep the queue's classification; anything else is a wiring or payload bug.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChainError::Queue { source, .. } => source.kind(),
            ChainError::NoPolicy(_) | ChainError::Codec(_) => ErrorKind::Permanent,
        }
    }
}

/// One stage message handed to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    pub job_type: JobType,
    pub published: Published,
    pub run: RunContext,
}

pub struct Chainer {
    queue: Arc<dyn JobQueue>,
    policies: Arc<RetryPolicyTable>,
    ids: Arc<dyn IdGenerator>,
    queue_timeout: Duration,
}

impl Chainer {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        policies: Arc<RetryPolicyTable>,
        ids: Arc<dyn IdGenerator>,
        queue_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            policies,
            ids,
            queue_timeout,
        }
    }

    pub fn has_policy(&self, job_type: &JobType) -> bool {
        self.policies.get(job_type).is_some()
    }

    /// Start a new run with `job` as its first stage.
    pub async fn start_run<J: Job>(&self, job: &J) -> Result<Enqueued, ChainError> {
        let body = serde_json::to_value(job).map_err(|source| CodecError::Encode {
            job_type: J::TYPE.to_string(),
            source,
        })?;
        let job_type = J::job_type();
        let key = stage_key(&job_type, &job.natural_key());
        self.start_run_raw(&job_type, body, key).await
    }

    /// Start a new run from an already-encoded first stage body.
    pub async fn start_run_raw(
        &self,
        job_type: &JobType,
        body: Value,
        singleton_key: String,
    ) -> Result<Enqueued, ChainError> {
        let run = RunContext::start(self.ids.run_id(), job_type);
        self.publish(job_type, body, singleton_key, run).await
    }

    /// Enqueue a follow-up stage under `parent`'s run.
    pub async fn enqueue_next(
        &self,
        parent: &RunContext,
        next: &NextStage,
    ) -> Result<Enqueued, ChainError> {
        let run = parent.child(&next.job_type);
        let key = stage_key(&next.job_type, &next.natural_key);
        self.publish(&next.job_type, next.payload.clone(), key, run)
            .await
    }

    /// Enqueue stages in order, stopping at the first error.
    pub async fn enqueue_all(
        &self,
        parent: &RunContext,
        next: &[NextStage],
    ) -> Result<Vec<Enqueued>, ChainError> {
        let mut enqueued = Vec::with_capacity(next.len());
        for stage in next {
            enqueued.push(self.enqueue_next(parent, stage).await?);
        }
        Ok(enqueued)
    }

    async fn publish(
        &self,
        job_type: &JobType,
        body: Value,
        singleton_key: String,
        run: RunContext,
    ) -> Result<Enqueued, ChainError> {
        let policy = self
            .policies
            .get(job_type)
            .ok_or_else(|| ChainError::NoPolicy(job_type.clone()))?;
        let payload = codec::attach_context(job_type.as_str(), body, &run)?;
        let options = PublishOptions::from(policy).with_singleton_key(singleton_key);

        let published = tokio::time::timeout(
            self.queue_timeout,
            self.queue.publish(job_type, payload, options),
        )
        .await
        .unwrap_or(Err(QueueError::Timeout(self.queue_timeout)))
        .map_err(|source| ChainError::Queue {
            queue: job_type.clone(),
            source,
        })?;

        if published.is_duplicate() {
            info!(
                job_type = %job_type,
                run_id = %run.run_id,
                message_id = %published.message_id(),
                "stage already queued; singleton hit"
            );
        } else {
            debug!(
                job_type = %job_type,
                run_id = %run.run_id,
                correlation_id = %run.correlation_id,
                message_id = %published.message_id(),
                "stage enqueued"
            );
        }

        Ok(Enqueued {
            job_type: job_type.clone(),
            published,
            run,
        })
    }
}
