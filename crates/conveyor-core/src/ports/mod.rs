//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（リレーショナルストア、ジョブキュー、ドメインテーブル）
//! を隠蔽し、dispatcher と worker を InMemory 実装でテストし、本番では実際の
//! 実装で動かせるようにします。

pub mod clock;
pub mod event_store;
pub mod id_generator;
pub mod job_queue;
pub mod target_probe;
pub mod upsert;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_store::EventStore;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::job_queue::{JobQueue, MessageLease};
pub use self::target_probe::{NoTargetProbe, TargetProbe, TargetState};
pub use self::upsert::{UpsertByNaturalKey, UpsertResult};
