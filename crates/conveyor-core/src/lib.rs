//! conveyor-core
//!
//! 多段パイプラインのためのジョブオーケストレーション。
//! transactional outbox、キューのリトライ/冪等性契約、run/correlation id
//! 付きのステージ連鎖、cron による run の起動を提供します。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, job_type, outbox, message, run, outcome, errors）
//! - **ports**: 抽象化レイヤー（EventStore, JobQueue, TargetProbe, UpsertByNaturalKey, Clock, IdGenerator）
//! - **typed**: 型付き Job API（Job trait, StageHandler, JobRegistry, payload codec）
//! - **policy**: retry policy, outbox backoff, policy table
//! - **app**: アプリケーションロジック（builder, dispatcher, publisher_loop, chain, worker_loop, scheduler, status）
//! - **impls**: 実装（InMemory 系は開発・テスト用、PgEventStore は feature `postgres`）
//! - **config**: 設定の読み込み（defaults → file → env）
//! - **error**: 起動・シード時のエラー型 `ConveyorError`

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod policy;
pub mod ports;
pub mod typed;

pub use crate::config::ConveyorConfig;
pub use crate::error::ConveyorError;
