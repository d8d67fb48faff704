//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//!
//! # Fail-fast 設計
//! `build()` は以下の場合 `App` を返さない:
//! - `expect_jobs()` で指定した job type が登録も宣言もされていない
//! - retry policy テーブルが登録済み job type と一致しない
//!   （`RetryPolicyTable::validate` を参照）

use std::sync::Arc;
use std::time::Duration;

use super::chain::Chainer;
use super::dispatcher::{DispatcherSettings, OutboxDispatcher};
use super::scheduler::Scheduler;
use super::worker_loop::{WorkerLoop, WorkerSettings};
use crate::domain::JobType;
use crate::policy::{PolicyError, RetryPolicyTable};
use crate::ports::{Clock, EventStore, IdGenerator, JobQueue, TargetProbe};
use crate::typed::{Job, JobRegistry, RegistryError, StageHandler};

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .register::<EnrichLead, _>(EnrichHandler)?
///     .declare::<SendMessage>()?
///     .policies(RetryPolicyTable::from_config(&config.policies)?)
///     .expect_jobs(&["enrichment.run", "message.send"])
///     .build()?;
/// ```
pub struct AppBuilder {
    registry: JobRegistry,
    policies: RetryPolicyTable,
    expected_jobs: Option<Vec<String>>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing job types: {0:?}. These jobs were expected but not registered.")]
    MissingJobTypes(Vec<String>),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: JobRegistry::new(),
            policies: RetryPolicyTable::new(),
            expected_jobs: None,
        }
    }

    /// Handler を登録
    pub fn register<J: Job, H: StageHandler<J> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, BuildError> {
        self.registry.register::<J, H>(handler)?;
        Ok(self)
    }

    /// Handler なしで `J` を宣言（dispatch 専用プロセス向け）
    pub fn declare<J: Job>(mut self) -> Result<Self, BuildError> {
        self.registry.declare::<J>()?;
        Ok(self)
    }

    pub fn policies(mut self, policies: RetryPolicyTable) -> Self {
        self.policies = policies;
        self
    }

    pub fn expect_jobs(mut self, job_types: &[&str]) -> Self {
        self.expected_jobs = Some(job_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        if let Some(expected) = &self.expected_jobs {
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| self.registry.lookup(name).is_err())
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingJobTypes(missing));
            }
        }

        self.policies.validate(&self.registry.job_types())?;

        Ok(App {
            registry: Arc::new(self.registry),
            policies: Arc::new(self.policies),
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Validated registry and policies, plus constructors for the runtime pieces
/// that share them.
#[derive(Clone)]
pub struct App {
    pub registry: Arc<JobRegistry>,
    pub policies: Arc<RetryPolicyTable>,
}

impl App {
    /// Queues that have a handler in this process.
    pub fn worker_queues(&self) -> Vec<JobType> {
        self.registry.handled_types()
    }

    pub fn dispatcher(
        &self,
        store: Arc<dyn EventStore>,
        queue: Arc<dyn JobQueue>,
        probe: Arc<dyn TargetProbe>,
        clock: Arc<dyn Clock>,
        settings: DispatcherSettings,
    ) -> OutboxDispatcher {
        OutboxDispatcher::new(
            store,
            queue,
            Arc::clone(&self.registry),
            Arc::clone(&self.policies),
            probe,
            clock,
            settings,
        )
    }

    pub fn chainer(
        &self,
        queue: Arc<dyn JobQueue>,
        ids: Arc<dyn IdGenerator>,
        queue_timeout: Duration,
    ) -> Chainer {
        Chainer::new(queue, Arc::clone(&self.policies), ids, queue_timeout)
    }

    pub fn worker(
        &self,
        queue: Arc<dyn JobQueue>,
        chainer: Arc<Chainer>,
        settings: WorkerSettings,
    ) -> WorkerLoop {
        WorkerLoop::new(queue, Arc::clone(&self.registry), chainer, settings)
    }

    pub fn scheduler(
        &self,
        chainer: Arc<Chainer>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
    ) -> Scheduler {
        Scheduler::new(chainer, Arc::clone(&self.registry), clock, poll_interval)
    }
}
