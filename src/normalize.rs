use futures::StreamExt;
use tracing::{debug, error};

use crate::error::GenerationError;
use crate::replicate::{ByteStream, ChunkReader, ProviderError, RawProviderOutput};

/// Provider output reduced to either a locator stored verbatim or the raw
/// image bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedOutput {
    Locator(String),
    Bytes(Vec<u8>),
}

pub async fn normalize(output: RawProviderOutput) -> Result<NormalizedOutput, GenerationError> {
    match output {
        RawProviderOutput::DirectUrl(url) => locator(url),
        RawProviderOutput::UrlArray(urls) => match urls.into_iter().next() {
            Some(url) => locator(url),
            None => Err(GenerationError::UnexpectedOutputFormat(
                "provider returned an empty output array".to_string(),
            )),
        },
        RawProviderOutput::AsyncStream(stream) => drain_stream(stream).await.and_then(non_empty),
        RawProviderOutput::ReaderStream(reader) => drain_reader(reader).await.and_then(non_empty),
        RawProviderOutput::Unknown(value) => {
            error!(output = %value, "unexpected output format from provider");
            Err(GenerationError::UnexpectedOutputFormat(describe(&value).to_string()))
        }
    }
}

fn locator(url: String) -> Result<NormalizedOutput, GenerationError> {
    if url.trim().is_empty() {
        return Err(GenerationError::UnexpectedOutputFormat(
            "provider returned an empty image url".to_string(),
        ));
    }
    Ok(NormalizedOutput::Locator(url))
}

fn non_empty(buffer: Vec<u8>) -> Result<NormalizedOutput, GenerationError> {
    if buffer.is_empty() {
        return Err(GenerationError::UnexpectedOutputFormat(
            "provider returned an empty image stream".to_string(),
        ));
    }
    debug!(size = buffer.len(), "image stream drained");
    Ok(NormalizedOutput::Bytes(buffer))
}

fn stream_failed(err: ProviderError) -> GenerationError {
    error!(error = %err, "error reading image stream");
    GenerationError::GenerationFailed(format!("failed to read image stream: {err}"))
}

async fn drain_stream(mut stream: ByteStream) -> Result<Vec<u8>, GenerationError> {
    let mut buffer = Vec::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk.map_err(stream_failed)?);
    }
    Ok(buffer)
}

async fn drain_reader(mut reader: Box<dyn ChunkReader>) -> Result<Vec<u8>, GenerationError> {
    let result = read_to_end(reader.as_mut()).await;
    reader.release_lock();
    result
}

async fn read_to_end(reader: &mut dyn ChunkReader) -> Result<Vec<u8>, GenerationError> {
    let mut buffer = Vec::new();
    while let Some(chunk) = reader.read().await.map_err(stream_failed)? {
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer)
}

fn describe(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null output",
        serde_json::Value::Bool(_) => "boolean output",
        serde_json::Value::Number(_) => "numeric output",
        serde_json::Value::String(_) => "string output",
        serde_json::Value::Array(_) => "array output",
        serde_json::Value::Object(_) => "object output",
    }
}
