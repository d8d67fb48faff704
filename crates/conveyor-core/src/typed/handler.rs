//! Handler trait - ステージを実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (`StageHandler<J>`)
//! - Object-safe trait (`DynHandler`)
//! - Type erasure パターン (`TypedHandler<J, H>` → `DynHandler`)

use async_trait::async_trait;
use std::marker::PhantomData;

use super::codec::{self, CodecError};
use super::job::Job;
use crate::domain::{JobType, MessageId, RunContext, StageOutcome};

/// What a handler knows about the delivery it is processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageContext {
    pub job_type: JobType,
    pub message_id: MessageId,
    /// 1 on first delivery, +1 per redelivery.
    pub delivery: u32,
    pub run: RunContext,
}

impl StageContext {
    pub fn run_id(&self) -> &str {
        &self.run.run_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.run.correlation_id
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery > 1
    }
}

/// Executes one stage for a typed job.
///
/// Handlers run under at-least-once delivery: side effects go through
/// `UpsertByNaturalKey` (or an equivalent conditional write).
#[async_trait]
pub trait StageHandler<J: Job>: Send + Sync {
    async fn handle(&self, job: J, ctx: &StageContext) -> StageOutcome;
}

/// Object-safe handler keyed by job type.
#[async_trait]
pub trait DynHandler: Send + Sync {
    /// Decode, validate, then run the stage. Decode failures never reach the handler.
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
        ctx: &StageContext,
    ) -> Result<StageOutcome, CodecError>;

    fn job_type(&self) -> JobType;
}

pub struct TypedHandler<J: Job, H: StageHandler<J>> {
    handler: H,
    _marker: PhantomData<fn() -> J>,
}

impl<J: Job, H: StageHandler<J>> TypedHandler<J, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<J: Job, H: StageHandler<J>> DynHandler for TypedHandler<J, H> {
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
        ctx: &StageContext,
    ) -> Result<StageOutcome, CodecError> {
        let job: J = codec::decode(payload)?;
        Ok(self.handler.handle(job, ctx).await)
    }

    fn job_type(&self) -> JobType {
        J::job_type()
    }
}

/// Validates payloads for one job type without executing anything.
pub trait PayloadSchema: Send + Sync {
    fn validate(&self, payload: &serde_json::Value) -> Result<(), CodecError>;
}

pub struct TypedSchema<J: Job>(PhantomData<fn() -> J>);

impl<J: Job> TypedSchema<J> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<J: Job> Default for TypedSchema<J> {
    fn default() -> Self {
        Self::new()
    }
}

impl<J: Job> PayloadSchema for TypedSchema<J> {
    fn validate(&self, payload: &serde_json::Value) -> Result<(), CodecError> {
        codec::decode::<J>(payload.clone()).map(|_| ())
    }
}
