//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてオーケストレーションを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: Job の登録とポリシー検証（Fail-fast）
//! - **OutboxDispatcher**: outbox イベントを claim してキューへ publish
//! - **PublisherLoop**: `CycleGuard` 付きで dispatcher を定期実行
//! - **Chainer**: run context と singleton key 付きでステージを enqueue
//! - **WorkerLoop** / **WorkerGroup**: fetch→handle→chain→settle
//! - **Scheduler**: cron エントリから run を起動
//! - **status**: outbox とキューの件数

pub mod builder;
pub mod chain;
pub mod dispatcher;
pub mod publisher_loop;
pub mod scheduler;
pub mod status;
pub mod worker_loop;

pub use self::builder::{App, AppBuilder, BuildError};
pub use self::chain::{ChainError, Chainer, Enqueued};
pub use self::dispatcher::{DispatchError, DispatcherSettings, OutboxDispatcher, OutboxPublishPolicy};
pub use self::publisher_loop::{CycleGuard, PublisherLoop};
pub use self::scheduler::{Fire, ScheduleError, ScheduleOptions, Scheduler};
pub use self::status::{OutboxCounts, QueueCounts};
pub use self::worker_loop::{Processed, WorkerGroup, WorkerLoop, WorkerSettings};
