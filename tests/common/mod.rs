#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use kontext_studio::{
    auth::CallerIdentity,
    orchestrator::Orchestrator,
    replicate::{
        ErrorClassifier, ImageProvider, ModelVariant, ProviderError, ProviderInput,
        RawProviderOutput,
    },
    store::{
        GeneratedImageRecord, ImageRepository, MemoryImageStore, NewImageRecord, StaticFiles,
        StoreError,
    },
};

/// Provider stub that replays a fixed script of outcomes and records every
/// input it was called with.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<RawProviderOutput, ProviderError>>>,
    calls: Mutex<Vec<(ProviderInput, ModelVariant)>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<RawProviderOutput, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<(ProviderInput, ModelVariant)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ImageProvider for ScriptedProvider {
    async fn run(
        &self,
        input: &ProviderInput,
        model: ModelVariant,
    ) -> Result<RawProviderOutput, ProviderError> {
        self.calls.lock().unwrap().push((input.clone(), model));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::other("no scripted response left")))
    }
}

/// Store whose writes always fail.
pub struct FailingStore;

#[async_trait]
impl ImageRepository for FailingStore {
    async fn create(&self, _record: NewImageRecord) -> Result<GeneratedImageRecord, StoreError> {
        Err(StoreError::Unavailable("database is read-only".to_string()))
    }

    async fn list(&self) -> Result<Vec<GeneratedImageRecord>, StoreError> {
        Ok(Vec::new())
    }

    async fn get(&self, _id: u64) -> Result<Option<GeneratedImageRecord>, StoreError> {
        Ok(None)
    }

    async fn delete(&self, _id: u64) -> Result<bool, StoreError> {
        Ok(false)
    }
}

pub fn provider_error(message: &str) -> ProviderError {
    ErrorClassifier::default().error(message)
}

pub fn direct_url(url: &str) -> Result<RawProviderOutput, ProviderError> {
    Ok(RawProviderOutput::DirectUrl(url.to_string()))
}

/// Splits `bytes` into `chunks` pieces delivered as an async stream.
pub fn chunked_stream(bytes: &[u8], chunks: usize) -> Result<RawProviderOutput, ProviderError> {
    let size = bytes.len().div_ceil(chunks.max(1)).max(1);
    let pieces: Vec<Result<Bytes, ProviderError>> = bytes
        .chunks(size)
        .map(|piece| Ok(Bytes::copy_from_slice(piece)))
        .collect();
    Ok(RawProviderOutput::AsyncStream(stream::iter(pieces).boxed()))
}

/// Noisy RGB PNG. The noise keeps the PNG larger than its JPEG re-encodes.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut state: u32 = 0x9E37_79B9;
    let image = ImageBuffer::from_fn(width, height, |x, y| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        let noise = (state & 0x3F) as u8;
        Rgb([
            (x % 256) as u8 ^ noise,
            (y % 256) as u8 ^ noise,
            ((x + y) % 256) as u8,
        ])
    });
    let mut output = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut output), ImageFormat::Png)
        .unwrap();
    output
}

/// Single-colour PNG, smaller than any JPEG thumbnail of it.
pub fn solid_png(width: u32, height: u32) -> Vec<u8> {
    let image = ImageBuffer::from_pixel(width, height, Rgb([20u8, 120, 220]));
    let mut output = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut output), ImageFormat::Png)
        .unwrap();
    output
}

pub fn caller() -> CallerIdentity {
    CallerIdentity::new("alice")
}

pub struct Harness {
    pub provider: Arc<ScriptedProvider>,
    pub store: Arc<MemoryImageStore>,
    pub static_dir: tempfile::TempDir,
    pub orchestrator: Orchestrator,
}

pub fn harness(script: Vec<Result<RawProviderOutput, ProviderError>>) -> Harness {
    let provider = ScriptedProvider::new(script);
    let store = Arc::new(MemoryImageStore::new());
    let static_dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::new(
        provider.clone(),
        store.clone(),
        StaticFiles::new(static_dir.path().to_path_buf()),
    );
    Harness {
        provider,
        store,
        static_dir,
        orchestrator,
    }
}
