//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryEventStore** / **InMemoryJobQueue** / **InMemoryUpsertStore**: テストとローカル実行用
//! - **PgEventStore**（feature `postgres`）: 本番用の outbox テーブル

pub mod inmem_event_store;
pub mod inmem_queue;
pub mod inmem_upsert;
#[cfg(feature = "postgres")]
pub mod pg_event_store;

pub use self::inmem_event_store::InMemoryEventStore;
pub use self::inmem_queue::InMemoryJobQueue;
pub use self::inmem_upsert::InMemoryUpsertStore;
#[cfg(feature = "postgres")]
pub use self::pg_event_store::PgEventStore;
