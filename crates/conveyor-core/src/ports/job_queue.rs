//! JobQueue port - at-least-once 配送キュー（メッセージごとの retry policy 付き）

use async_trait::async_trait;

use crate::domain::{JobMessage, JobType, PublishOptions, Published, QueueError};

/// A fetched message. The worker owns it and must resolve it exactly once.
///
/// - Queue owns state transitions (queued -> active -> ...).
/// - Worker runs the handler and reports the result.
#[async_trait]
pub trait MessageLease: Send {
    fn message(&self) -> &JobMessage;

    /// Done. Releases the singleton key.
    async fn ack(self: Box<Self>) -> Result<(), QueueError>;

    /// Failed; the queue schedules a redelivery or dead-letters per the message's options.
    async fn fail(self: Box<Self>, error: String) -> Result<(), QueueError>;

    /// Skip retries and route straight to the dead-letter queue.
    async fn dead_letter(self: Box<Self>, reason: String) -> Result<(), QueueError>;
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue, unless a live message with the same singleton key exists in
    /// `queue`, in which case its id comes back as `Published::Deduplicated`.
    async fn publish(
        &self,
        queue: &JobType,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> Result<Published, QueueError>;

    /// Up to `max` ready messages. Empty when nothing is due; never blocks.
    async fn fetch(&self, queue: &JobType, max: usize) -> Result<Vec<Box<dyn MessageLease>>, QueueError>;
}
