//! Queue retry policy: how many redeliveries, how far apart, where to after.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::JobType;

/// Upper bound for a single backoff delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

/// What to do with a message after its n-th failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { retry: u32, delay: Duration },
    Exhausted,
}

/// Retry policy attached to every message of one job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Redeliveries allowed after the first failure.
    pub retry_limit: u32,

    /// Delay before the first redelivery.
    pub retry_delay: Duration,

    /// Double the delay on each further redelivery.
    pub retry_backoff: bool,

    /// Queue receiving the payload once retries are exhausted.
    pub dead_letter: JobType,
}

impl RetryPolicy {
    /// Delay before redelivery number `retry` (1-based).
    ///
    /// With backoff: `retry_delay * 2^(retry-1)`, capped at one hour.
    /// Example with retry_delay=30s: 30s, 60s, 120s, 240s, ...
    pub fn next_delay(&self, retry: u32) -> Duration {
        redelivery_delay(self.retry_delay, self.retry_backoff, retry)
    }

    /// Decide after `failures` failed deliveries (1 after the first failure).
    pub fn decide(&self, failures: u32) -> RetryDecision {
        decide(self.retry_limit, self.retry_delay, self.retry_backoff, failures)
    }
}

pub(crate) fn redelivery_delay(base: Duration, backoff: bool, retry: u32) -> Duration {
    if !backoff {
        return base.min(MAX_RETRY_DELAY);
    }
    let exponent = retry.saturating_sub(1);
    2u32.checked_pow(exponent)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
}

pub(crate) fn decide(retry_limit: u32, base: Duration, backoff: bool, failures: u32) -> RetryDecision {
    if failures <= retry_limit {
        RetryDecision::Retry {
            retry: failures,
            delay: redelivery_delay(base, backoff, failures),
        }
    } else {
        RetryDecision::Exhausted
    }
}
