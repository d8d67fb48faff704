//! Status - outbox とキューの件数ビュー

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::OutboxStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxCounts {
    pub pending: usize,
    pub processing: usize,
    pub sent: usize,
    pub failed: usize,
    pub dead_letter: usize,
}

impl OutboxCounts {
    pub fn record(&mut self, status: OutboxStatus) {
        match status {
            OutboxStatus::Pending => self.pending += 1,
            OutboxStatus::Processing => self.processing += 1,
            OutboxStatus::Sent => self.sent += 1,
            OutboxStatus::Failed => self.failed += 1,
            OutboxStatus::DeadLetter => self.dead_letter += 1,
        }
    }

    /// Events still waiting to be published.
    pub fn backlog(&self) -> usize {
        self.pending + self.processing + self.failed
    }
}

impl fmt::Display for OutboxCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pending={} processing={} failed={} sent={} dead_letter={}",
            self.pending, self.processing, self.failed, self.sent, self.dead_letter
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub active: usize,
    pub retry_scheduled: usize,
    pub completed: usize,
    pub dead_lettered: usize,
}

impl fmt::Display for QueueCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queued={} active={} retry_scheduled={} completed={} dead_lettered={}",
            self.queued, self.active, self.retry_scheduled, self.completed, self.dead_lettered
        )
    }
}
