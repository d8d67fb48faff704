use thiserror::Error;

use crate::app::{BuildError, ChainError, ScheduleError};
use crate::domain::{InvalidJobType, QueueError, StoreError};
use crate::policy::PolicyError;
use crate::typed::CodecError;

/// Everything that can stop a conveyor from booting or seeding a run.
#[derive(Debug, Error)]
pub enum ConveyorError {
    #[error("configuration: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error(transparent)]
    JobType(#[from] InvalidJobType),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobType;

    #[test]
    fn wrapped_errors_keep_their_message() {
        let err = ConveyorError::from(JobType::parse("Not A Type").unwrap_err());
        assert!(matches!(err, ConveyorError::JobType(_)));
        assert!(err.to_string().contains("Not A Type"));

        let err = ConveyorError::from(QueueError::LeaseLost);
        assert_eq!(err.to_string(), "lease for message already resolved");
    }
}
