use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::warn;

use super::{
    GeneratedImageRecord, ImageRepository, LocalFileStorage, NewImageRecord, StoreError,
    record::sort_newest_first,
};

const RECORD_DIR: &str = "records";
const NEXT_ID_KEY: &str = "next_id";

/// One pretty-printed JSON file per record under `<data dir>/records`. The
/// next id is persisted separately so deleted ids are never handed out again.
pub struct FileImageStore {
    storage: LocalFileStorage,
    next_id: Mutex<Option<u64>>,
}

impl FileImageStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            storage: LocalFileStorage::new(data_dir),
            next_id: Mutex::new(None),
        }
    }

    fn record_key(id: u64) -> String {
        format!("{RECORD_DIR}/{id:012}.json")
    }

    async fn load_next_id(&self) -> Result<u64, StoreError> {
        let persisted = match self.storage.get(NEXT_ID_KEY).await? {
            Some(bytes) => String::from_utf8_lossy(&bytes).trim().parse::<u64>().ok(),
            None => None,
        };
        let highest = self
            .read_all()
            .await?
            .iter()
            .map(|record| record.id)
            .max()
            .unwrap_or(0);
        Ok(persisted.unwrap_or(1).max(highest + 1))
    }

    async fn read_all(&self) -> Result<Vec<GeneratedImageRecord>, StoreError> {
        let mut records = Vec::new();
        for key in self.storage.list_keys(RECORD_DIR, "json").await? {
            let Some(bytes) = self.storage.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<GeneratedImageRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(err) => warn!(key = %key, error = %err, "skipping unreadable image record"),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl ImageRepository for FileImageStore {
    async fn create(&self, record: NewImageRecord) -> Result<GeneratedImageRecord, StoreError> {
        let mut next_id = self.next_id.lock().await;
        let id = match *next_id {
            Some(id) => id,
            None => self.load_next_id().await?,
        };

        self.storage
            .put(NEXT_ID_KEY, (id + 1).to_string().as_bytes())
            .await?;
        *next_id = Some(id + 1);

        let record = record.into_record(id, Utc::now());
        let payload = serde_json::to_vec_pretty(&record)?;
        self.storage.put(&Self::record_key(id), &payload).await?;
        Ok(record)
    }

    async fn list(&self) -> Result<Vec<GeneratedImageRecord>, StoreError> {
        let mut records = self.read_all().await?;
        sort_newest_first(&mut records);
        Ok(records)
    }

    async fn get(&self, id: u64) -> Result<Option<GeneratedImageRecord>, StoreError> {
        match self.storage.get(&Self::record_key(id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, id: u64) -> Result<bool, StoreError> {
        Ok(self.storage.remove(&Self::record_key(id)).await?)
    }
}
