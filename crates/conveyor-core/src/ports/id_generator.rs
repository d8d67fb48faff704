//! IdGenerator port - ID 生成の抽象化
//!
//! テスト容易性のために trait として抽象化しています。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース。時刻は注入した `Clock` から取る

use ulid::Ulid;

use crate::domain::{EventId, MessageId};
use crate::ports::Clock;

/// ULID-based identifiers: time-sortable, no coordination between nodes.
pub trait IdGenerator: Send + Sync {
    fn event_id(&self) -> EventId;

    fn message_id(&self) -> MessageId;

    /// Fresh run identifier (`run-<ulid>`).
    fn run_id(&self) -> String;
}

/// ULIDs whose timestamp part comes from `C`, so a `FixedClock` gives
/// deterministic time prefixes.
#[derive(Debug, Clone)]
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn event_id(&self) -> EventId {
        EventId::from(self.next())
    }

    fn message_id(&self) -> MessageId {
        MessageId::from(self.next())
    }

    fn run_id(&self) -> String {
        format!("run-{}", self.next())
    }
}
