use std::io;
use std::path::PathBuf;

use chrono::Utc;
use thiserror::Error;

use super::{LocalFileStorage, compute_hash};

/// URL prefix under which uploaded and reference images are served.
pub const IMAGES_PREFIX: &str = "/images/";

#[derive(Debug, Error)]
pub enum StaticFileError {
    #[error("static file not found: {0}")]
    NotFound(String),

    #[error("invalid static file path: {0}")]
    InvalidPath(String),

    #[error("static file io failed: {0}")]
    Io(#[from] io::Error),
}

/// Files under the public static directory, addressed by `/images/...`
/// locators.
#[derive(Clone, Debug)]
pub struct StaticFiles {
    storage: LocalFileStorage,
}

impl StaticFiles {
    pub fn new(root: PathBuf) -> Self {
        Self {
            storage: LocalFileStorage::new(root),
        }
    }

    pub fn images_dir(&self) -> PathBuf {
        self.storage.base_dir().join(IMAGES_PREFIX.trim_matches('/'))
    }

    pub fn is_local_path(locator: &str) -> bool {
        locator.starts_with(IMAGES_PREFIX)
    }

    pub async fn resolve_local_path(&self, locator: &str) -> Result<Vec<u8>, StaticFileError> {
        if !Self::is_local_path(locator) {
            return Err(StaticFileError::InvalidPath(locator.to_string()));
        }
        match self.storage.get(locator).await {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) => Err(StaticFileError::NotFound(locator.to_string())),
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => {
                Err(StaticFileError::InvalidPath(locator.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Writes `bytes` under a fresh name and returns its `/images/...` locator.
    pub async fn save(&self, bytes: &[u8], ext: &str) -> Result<String, StaticFileError> {
        let timestamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let hash = compute_hash(&format!("upload:{timestamp}:{}", bytes.len()));
        let locator = format!("{IMAGES_PREFIX}{}.{ext}", &hash[..21]);
        self.storage.put(&locator, bytes).await?;
        Ok(locator)
    }
}
