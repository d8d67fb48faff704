//! Errors - エラー型と運用分類

use std::time::Duration;

use super::ids::EventId;
use super::outbox::OutboxStatus;

/// Operational classification of a failure.
///
/// - Infrastructure: the queue is unreachable or timed out; a later attempt may succeed.
/// - Permanent: retrying is pointless (missing policy, bad payload, lost lease).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Permanent,
    Infrastructure,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Permanent)
    }
}

/// Event store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("event store unavailable: {0}")]
    Unavailable(String),

    #[error("event store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("outbox event {0} not found")]
    NotFound(EventId),

    #[error("outbox event {0} already exists")]
    Duplicate(EventId),

    #[error("corrupt outbox row: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Job queue failures.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job queue unavailable: {0}")]
    Unavailable(String),

    #[error("job queue call timed out after {0:?}")]
    Timeout(Duration),

    #[error("lease for message already resolved")]
    LeaseLost,
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Unavailable(_) | QueueError::Timeout(_) => ErrorKind::Infrastructure,
            QueueError::LeaseLost => ErrorKind::Permanent,
        }
    }
}

/// An illegal outbox state transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("outbox event {id} is terminal ({status}) and cannot change")]
    Terminal { id: EventId, status: OutboxStatus },

    #[error("outbox event {id} is {status}, expected processing")]
    NotClaimed { id: EventId, status: OutboxStatus },
}
