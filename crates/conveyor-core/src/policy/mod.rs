//! Retry and backoff policies.

pub mod backoff;
pub mod retry;
pub mod table;

pub use self::backoff::OutboxBackoff;
pub use self::retry::{MAX_RETRY_DELAY, RetryDecision, RetryPolicy};
pub use self::table::{PolicyConfig, PolicyError, RetryPolicyTable};
