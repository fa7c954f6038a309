use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs;

static TEMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Key/value blobs laid out as files under one base directory.
#[derive(Clone, Debug)]
pub struct LocalFileStorage {
    base_dir: PathBuf,
}

impl LocalFileStorage {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        let path = self.resolve_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Writes to a sibling temp file and renames it over `key`, so readers
    /// see either the previous contents or the new ones.
    pub async fn put(&self, key: &str, data: &[u8]) -> io::Result<()> {
        let path = self.resolve_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp_path = temp_path_for(&path);
        fs::write(&temp_path, data).await?;
        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }
        Ok(())
    }

    /// Returns `false` when there was nothing to remove.
    pub async fn remove(&self, key: &str) -> io::Result<bool> {
        let path = self.resolve_path(key)?;
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// File names directly under `dir` ending in `.{ext}`.
    pub async fn list_keys(&self, dir: &str, ext: &str) -> io::Result<Vec<String>> {
        let dir_path = self.resolve_path(dir)?;
        let mut entries = match fs::read_dir(&dir_path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|value| value.to_str()) != Some(ext) {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|value| value.to_str()) {
                keys.push(format!("{}/{name}", dir.trim_end_matches('/')));
            }
        }
        Ok(keys)
    }

    /// Maps a key to a path inside the base directory. Keys that would escape
    /// it are rejected.
    pub fn resolve_path(&self, key: &str) -> io::Result<PathBuf> {
        let normalized = Path::new(key.trim_start_matches('/'));
        let escapes = normalized.components().any(|component| {
            !matches!(component, Component::Normal(_) | Component::CurDir)
        });
        if escapes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid storage key: {key}"),
            ));
        }
        Ok(self.base_dir.join(normalized))
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let sequence = TEMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(format!(".{}.{sequence}.tmp", std::process::id()));
    path.with_file_name(name)
}
