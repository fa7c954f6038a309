use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{
    GeneratedImageRecord, ImageRepository, NewImageRecord, StoreError, record::sort_newest_first,
};

struct MemoryInner {
    next_id: u64,
    records: BTreeMap<u64, GeneratedImageRecord>,
}

/// Process-local store; records vanish on restart.
pub struct MemoryImageStore {
    inner: RwLock<MemoryInner>,
}

impl Default for MemoryImageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryInner {
                next_id: 1,
                records: BTreeMap::new(),
            }),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ImageRepository for MemoryImageStore {
    async fn create(&self, record: NewImageRecord) -> Result<GeneratedImageRecord, StoreError> {
        let mut inner = self.inner.write().await;
        let id = inner.next_id;
        inner.next_id += 1;
        let record = record.into_record(id, Utc::now());
        inner.records.insert(id, record.clone());
        Ok(record)
    }

    async fn list(&self) -> Result<Vec<GeneratedImageRecord>, StoreError> {
        let mut records: Vec<_> = self.inner.read().await.records.values().cloned().collect();
        sort_newest_first(&mut records);
        Ok(records)
    }

    async fn get(&self, id: u64) -> Result<Option<GeneratedImageRecord>, StoreError> {
        Ok(self.inner.read().await.records.get(&id).cloned())
    }

    async fn delete(&self, id: u64) -> Result<bool, StoreError> {
        Ok(self.inner.write().await.records.remove(&id).is_some())
    }
}
