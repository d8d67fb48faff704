//! In-memory UpsertByNaturalKey, one map per record type.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::StoreError;
use crate::ports::{UpsertByNaturalKey, UpsertResult};

#[derive(Debug)]
pub struct InMemoryUpsertStore<R> {
    records: Arc<RwLock<BTreeMap<String, R>>>,
}

impl<R> Clone for InMemoryUpsertStore<R> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
        }
    }
}

impl<R> Default for InMemoryUpsertStore<R> {
    fn default() -> Self {
        Self {
            records: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl<R: Clone> InMemoryUpsertStore<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Snapshot, ordered by natural key.
    pub async fn all(&self) -> Vec<(String, R)> {
        self.records
            .read()
            .await
            .iter()
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect()
    }
}

#[async_trait]
impl<R> UpsertByNaturalKey<R> for InMemoryUpsertStore<R>
where
    R: Clone + PartialEq + Send + Sync + 'static,
{
    async fn upsert(&self, natural_key: &str, record: R) -> Result<UpsertResult, StoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(natural_key) {
            Some(existing) if *existing == record => Ok(UpsertResult::Unchanged),
            Some(existing) => {
                *existing = record;
                Ok(UpsertResult::Updated)
            }
            None => {
                records.insert(natural_key.to_string(), record);
                Ok(UpsertResult::Inserted)
            }
        }
    }

    async fn find(&self, natural_key: &str) -> Result<Option<R>, StoreError> {
        Ok(self.records.read().await.get(natural_key).cloned())
    }
}
