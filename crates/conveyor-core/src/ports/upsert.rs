//! UpsertByNaturalKey port - ステージ副作用の冪等な書き込み
//!
//! 再配送されたメッセージは同じ natural key で書き込みを繰り返すので、
//! 2 回目はレコードが既にあることを見つけて何もしない。

use async_trait::async_trait;

use crate::domain::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertResult {
    Inserted,
    Updated,
    /// Same record already stored under this key.
    Unchanged,
}

impl UpsertResult {
    pub fn is_noop(self) -> bool {
        matches!(self, UpsertResult::Unchanged)
    }
}

#[async_trait]
pub trait UpsertByNaturalKey<R: Send + Sync + 'static>: Send + Sync {
    async fn upsert(&self, natural_key: &str, record: R) -> Result<UpsertResult, StoreError>;

    async fn find(&self, natural_key: &str) -> Result<Option<R>, StoreError>;
}
