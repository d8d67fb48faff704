//! Stage outcome: what a handler tells the work loop after one delivery.

use super::job_type::JobType;
use crate::typed::Job;

/// A follow-up stage requested by a handler.
///
/// The payload is the bare job body; run context and singleton key are
/// attached by the chainer when it is enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NextStage {
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub natural_key: String,
}

impl NextStage {
    pub fn of<J: Job>(job: &J) -> Result<Self, serde_json::Error> {
        Ok(Self {
            job_type: J::job_type(),
            payload: serde_json::to_value(job)?,
            natural_key: job.natural_key(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Side effect done. `next` may be empty at the end of the pipeline.
    Success { next: Vec<NextStage> },

    /// Try again later under the queue's retry policy.
    RetryableError { reason: String },

    /// Failure recorded on the entity; this branch stops. `notify` stages are still enqueued.
    TerminalError {
        reason: String,
        notify: Vec<NextStage>,
    },
}

impl StageOutcome {
    pub fn done() -> Self {
        StageOutcome::Success { next: Vec::new() }
    }

    /// Success, followed by `job`.
    pub fn advance<J: Job>(job: &J) -> Self {
        match NextStage::of(job) {
            Ok(next) => StageOutcome::Success { next: vec![next] },
            Err(e) => StageOutcome::terminal(format!(
                "cannot encode next stage {}: {e}",
                J::job_type()
            )),
        }
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        StageOutcome::RetryableError {
            reason: reason.into(),
        }
    }

    pub fn terminal(reason: impl Into<String>) -> Self {
        StageOutcome::TerminalError {
            reason: reason.into(),
            notify: Vec::new(),
        }
    }

    pub fn with_next(mut self, stage: NextStage) -> Self {
        match &mut self {
            StageOutcome::Success { next } => next.push(stage),
            StageOutcome::TerminalError { notify, .. } => notify.push(stage),
            StageOutcome::RetryableError { .. } => {}
        }
        self
    }

    /// Stages to enqueue after this outcome.
    pub fn follow_ups(&self) -> &[NextStage] {
        match self {
            StageOutcome::Success { next } => next,
            StageOutcome::TerminalError { notify, .. } => notify,
            StageOutcome::RetryableError { .. } => &[],
        }
    }
}
