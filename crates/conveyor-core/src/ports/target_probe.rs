//! TargetProbe port - outbox publish 前の重複ガード
//!
//! outbox イベントの中にはドメイン行の遷移（例: lead が `enriching` へ移る）を
//! 告げるものがある。その行が既に期待状態を過ぎていれば、以前の配送で仕事は
//! 済んでおり、再 publish は重複になる。

use async_trait::async_trait;

use crate::domain::{OutboxEvent, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    /// Target is in the expected pre-publish state.
    Proceed,
    /// Target already advanced; resolve as sent without publishing.
    AlreadyAdvanced,
    /// Correlated record no longer exists; resolve as sent without publishing.
    Missing,
    /// The event has no guarded target.
    NotApplicable,
}

#[async_trait]
pub trait TargetProbe: Send + Sync {
    async fn probe(&self, event: &OutboxEvent) -> Result<TargetState, StoreError>;
}

/// Probe for deployments without guarded targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTargetProbe;

#[async_trait]
impl TargetProbe for NoTargetProbe {
    async fn probe(&self, _event: &OutboxEvent) -> Result<TargetState, StoreError> {
        Ok(TargetState::NotApplicable)
    }
}
