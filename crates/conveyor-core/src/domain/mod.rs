//! Domain model: identifiers, outbox events, queue messages, run context, outcomes.

pub mod errors;
pub mod ids;
pub mod job_type;
pub mod message;
pub mod outbox;
pub mod outcome;
pub mod run;

pub use self::errors::{ErrorKind, QueueError, StoreError, TransitionError};
pub use self::ids::{EventId, MessageId};
pub use self::job_type::{InvalidJobType, JobType};
pub use self::message::{JobMessage, PublishOptions, Published};
pub use self::outbox::{OutboxEvent, OutboxStatus, Resolution};
pub use self::outcome::{NextStage, StageOutcome};
pub use self::run::RunContext;
