pub mod file;
pub mod hash;
pub mod memory;
pub mod record;
pub mod static_files;
pub mod storage;

use async_trait::async_trait;
use thiserror::Error;

pub use file::FileImageStore;
pub use hash::compute_hash;
pub use memory::MemoryImageStore;
pub use record::{GeneratedImageRecord, MATCH_INPUT_IMAGE, NewImageRecord};
pub use static_files::{StaticFileError, StaticFiles};
pub use storage::LocalFileStorage;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Unavailable(String),
}

/// Persistence for generated image records. Each operation touches a single
/// record and is atomic on its own.
#[async_trait]
pub trait ImageRepository: Send + Sync {
    /// Assigns the id and creation timestamp.
    async fn create(&self, record: NewImageRecord) -> Result<GeneratedImageRecord, StoreError>;

    /// All records, newest first.
    async fn list(&self) -> Result<Vec<GeneratedImageRecord>, StoreError>;

    async fn get(&self, id: u64) -> Result<Option<GeneratedImageRecord>, StoreError>;

    async fn delete(&self, id: u64) -> Result<bool, StoreError>;
}
