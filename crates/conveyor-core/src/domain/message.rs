//! Queue envelope and publish options.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ids::MessageId;
use super::job_type::JobType;
use crate::policy::retry::{self, RetryDecision};
use crate::policy::RetryPolicy;

/// Per-message delivery options understood by the job queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOptions {
    /// Redeliveries allowed after the first failure.
    pub retry_limit: u32,
    pub retry_delay: Duration,
    pub retry_backoff: bool,
    /// Queue that receives the payload once retries are exhausted.
    pub dead_letter: Option<JobType>,
    /// At most one live message per key and queue.
    pub singleton_key: Option<String>,
}

impl PublishOptions {
    /// No retries, no dead-letter routing. Used for messages landing in a dead-letter queue.
    pub fn none() -> Self {
        Self {
            retry_limit: 0,
            retry_delay: Duration::ZERO,
            retry_backoff: false,
            dead_letter: None,
            singleton_key: None,
        }
    }

    pub fn with_singleton_key(mut self, key: impl Into<String>) -> Self {
        self.singleton_key = Some(key.into());
        self
    }

    /// Retry decision after `failures` failed deliveries.
    pub fn decide(&self, failures: u32) -> RetryDecision {
        retry::decide(self.retry_limit, self.retry_delay, self.retry_backoff, failures)
    }
}

impl From<&RetryPolicy> for PublishOptions {
    fn from(policy: &RetryPolicy) -> Self {
        Self {
            retry_limit: policy.retry_limit,
            retry_delay: policy.retry_delay,
            retry_backoff: policy.retry_backoff,
            dead_letter: Some(policy.dead_letter.clone()),
            singleton_key: None,
        }
    }
}

/// A message as the queue stores and delivers it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub id: MessageId,
    pub queue: JobType,
    pub payload: serde_json::Value,
    pub options: PublishOptions,

    /// Failed deliveries so far.
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl JobMessage {
    pub fn new(
        id: MessageId,
        queue: JobType,
        payload: serde_json::Value,
        options: PublishOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            queue,
            payload,
            options,
            retry_count: 0,
            created_at: now,
            last_error: None,
        }
    }

    pub fn singleton_key(&self) -> Option<&str> {
        self.options.singleton_key.as_deref()
    }
}

/// Answer to a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Published {
    /// A new message was enqueued.
    Enqueued(MessageId),
    /// A live message with the same singleton key already exists.
    Deduplicated(MessageId),
}

impl Published {
    pub fn message_id(&self) -> MessageId {
        match self {
            Published::Enqueued(id) | Published::Deduplicated(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Published::Deduplicated(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_follow_policy() {
        let policy = RetryPolicy {
            retry_limit: 3,
            retry_delay: Duration::from_secs(30),
            retry_backoff: true,
            dead_letter: JobType::parse("enrichment.run.dlq").unwrap(),
        };

        let options = PublishOptions::from(&policy).with_singleton_key("enrichment.run:lead-7");

        assert_eq!(options.retry_limit, 3);
        assert_eq!(options.dead_letter.as_ref().map(JobType::as_str), Some("enrichment.run.dlq"));
        assert_eq!(options.singleton_key.as_deref(), Some("enrichment.run:lead-7"));
        assert_eq!(options.decide(2), policy.decide(2));
        assert_eq!(options.decide(4), RetryDecision::Exhausted);
    }

    #[test]
    fn options_without_retries_exhaust_on_first_failure() {
        assert_eq!(PublishOptions::none().decide(1), RetryDecision::Exhausted);
    }
}
