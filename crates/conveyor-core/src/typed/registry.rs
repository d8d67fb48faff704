//! JobRegistry - Job type、payload schema、Handler の登録と管理
//!
//! # 使用例
//! ```ignore
//! let mut registry = JobRegistry::new();
//! registry.declare::<SendMessage>()?;                  // schema のみ（dispatcher 側）
//! registry.register::<EnrichLead, _>(EnrichHandler)?;  // schema + handler（worker 側）
//!
//! let handler = registry.handler(&EnrichLead::job_type());
//! ```
//!
//! # 学習ポイント
//! - HashMap での型消去された trait object の管理
//! - 文字列での lookup は境界（`lookup`）だけ、それ以外は `JobType` がキー

use std::collections::BTreeMap;
use std::sync::Arc;

use super::handler::{DynHandler, PayloadSchema, StageHandler, TypedHandler, TypedSchema};
use super::job::Job;
use crate::domain::{InvalidJobType, JobType};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for job type '{0}' is already registered")]
    AlreadyRegistered(JobType),

    #[error("invalid job type name: {0}")]
    InvalidName(#[from] InvalidJobType),

    #[error("unknown job type '{0}'")]
    UnknownType(String),
}

struct Entry {
    schema: Arc<dyn PayloadSchema>,
    handler: Option<Arc<dyn DynHandler>>,
}

#[derive(Default)]
pub struct JobRegistry {
    entries: BTreeMap<JobType, Entry>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `J` known (schema only). Declaring twice is a no-op.
    pub fn declare<J: Job>(&mut self) -> Result<(), RegistryError> {
        let job_type = JobType::parse(J::TYPE)?;
        self.entries.entry(job_type).or_insert_with(|| Entry {
            schema: Arc::new(TypedSchema::<J>::new()),
            handler: None,
        });
        Ok(())
    }

    pub fn register<J: Job, H: StageHandler<J> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        let job_type = JobType::parse(J::TYPE)?;
        let entry = self.entries.entry(job_type.clone()).or_insert_with(|| Entry {
            schema: Arc::new(TypedSchema::<J>::new()),
            handler: None,
        });
        if entry.handler.is_some() {
            return Err(RegistryError::AlreadyRegistered(job_type));
        }
        entry.handler = Some(Arc::new(TypedHandler::new(handler)));
        Ok(())
    }

    /// Resolve a type name coming from outside (config, queue rows).
    pub fn lookup(&self, name: &str) -> Result<JobType, RegistryError> {
        let job_type = JobType::parse(name)?;
        if self.entries.contains_key(&job_type) {
            Ok(job_type)
        } else {
            Err(RegistryError::UnknownType(name.to_string()))
        }
    }

    pub fn contains(&self, job_type: &JobType) -> bool {
        self.entries.contains_key(job_type)
    }

    pub fn schema(&self, job_type: &JobType) -> Option<Arc<dyn PayloadSchema>> {
        self.entries.get(job_type).map(|e| Arc::clone(&e.schema))
    }

    pub fn handler(&self, job_type: &JobType) -> Option<Arc<dyn DynHandler>> {
        self.entries.get(job_type).and_then(|e| e.handler.clone())
    }

    /// All known job types, sorted.
    pub fn job_types(&self) -> Vec<JobType> {
        self.entries.keys().cloned().collect()
    }

    /// Job types with a handler, sorted.
    pub fn handled_types(&self) -> Vec<JobType> {
        self.entries
            .iter()
            .filter(|(_, e)| e.handler.is_some())
            .map(|(t, _)| t.clone())
            .collect()
    }
}
