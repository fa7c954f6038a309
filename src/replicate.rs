use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::{Duration, Instant, sleep};
use tracing::debug;

pub const DEFAULT_API_BASE: &str = "https://api.replicate.com/v1";
const FLUX_KONTEXT_MAX_MODEL: &str = "black-forest-labs/flux-kontext-max";
const FLUX_KONTEXT_PRO_MODEL: &str = "black-forest-labs/flux-kontext-pro";

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_POLL_TIMEOUT_SECS: u64 = 5 * 60;
const DEFAULT_SENSITIVE_PATTERN: &str = "flagged as sensitive";
const DEFAULT_INTERRUPTED_PATTERN: &str = "Prediction interrupted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    #[default]
    Max,
    Pro,
}

impl ModelVariant {
    pub fn model_id(self) -> &'static str {
        match self {
            Self::Max => FLUX_KONTEXT_MAX_MODEL,
            Self::Pro => FLUX_KONTEXT_PRO_MODEL,
        }
    }
}

/// How the request is sized. A reference image and explicit dimensions never
/// travel together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sizing {
    Dimensions { width: u32, height: u32 },
    AspectRatio(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInput {
    pub prompt: String,
    pub input_image: Option<String>,
    pub sizing: Sizing,
}

impl ProviderInput {
    pub fn to_json(&self) -> Value {
        let mut body = json!({ "prompt": self.prompt });
        if let Some(ref image) = self.input_image {
            body["input_image"] = json!(image);
        }
        match &self.sizing {
            Sizing::Dimensions { width, height } => {
                body["width"] = json!(width);
                body["height"] = json!(height);
            }
            Sizing::AspectRatio(Some(ratio)) => {
                body["aspect_ratio"] = json!(ratio);
            }
            Sizing::AspectRatio(None) => {}
        }
        body
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Sensitive,
    Interrupted,
    Other,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Other, message)
    }
}

/// Maps raw provider error text onto [`ProviderErrorKind`]. The provider only
/// reports failures as free text, so the patterns are replaceable.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    sensitive: Vec<String>,
    interrupted: Vec<String>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            sensitive: vec![DEFAULT_SENSITIVE_PATTERN.to_string()],
            interrupted: vec![DEFAULT_INTERRUPTED_PATTERN.to_string()],
        }
    }
}

impl ErrorClassifier {
    pub fn new(sensitive: Vec<String>, interrupted: Vec<String>) -> Self {
        Self {
            sensitive,
            interrupted,
        }
    }

    pub fn classify(&self, message: &str) -> ProviderErrorKind {
        if self.sensitive.iter().any(|pattern| message.contains(pattern.as_str())) {
            return ProviderErrorKind::Sensitive;
        }
        if self.interrupted.iter().any(|pattern| message.contains(pattern.as_str())) {
            return ProviderErrorKind::Interrupted;
        }
        ProviderErrorKind::Other
    }

    pub fn error(&self, message: impl Into<String>) -> ProviderError {
        let message = message.into();
        ProviderError::new(self.classify(&message), message)
    }
}

pub type ByteStream = BoxStream<'static, Result<Bytes, ProviderError>>;

/// Pull-based access to a streamed file. `release_lock` must be called once
/// the caller is done reading, whether or not the read succeeded.
#[async_trait]
pub trait ChunkReader: Send {
    async fn read(&mut self) -> Result<Option<Bytes>, ProviderError>;

    fn release_lock(&mut self);
}

pub enum RawProviderOutput {
    DirectUrl(String),
    UrlArray(Vec<String>),
    AsyncStream(ByteStream),
    ReaderStream(Box<dyn ChunkReader>),
    Unknown(Value),
}

impl fmt::Debug for RawProviderOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DirectUrl(url) => f.debug_tuple("DirectUrl").field(url).finish(),
            Self::UrlArray(urls) => f.debug_tuple("UrlArray").field(urls).finish(),
            Self::AsyncStream(_) => f.write_str("AsyncStream(..)"),
            Self::ReaderStream(_) => f.write_str("ReaderStream(..)"),
            Self::Unknown(value) => f.debug_tuple("Unknown").field(value).finish(),
        }
    }
}

/// A single provider run. Implementations never retry.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn run(
        &self,
        input: &ProviderInput,
        model: ModelVariant,
    ) -> Result<RawProviderOutput, ProviderError>;
}

/// How file outputs returned by Replicate are handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileOutputMode {
    #[default]
    Stream,
    Reader,
    Url,
}

impl FromStr for FileOutputMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stream" => Ok(Self::Stream),
            "reader" => Ok(Self::Reader),
            "url" => Ok(Self::Url),
            other => Err(format!("unknown file output mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplicateConfig {
    pub api_token: String,
    pub api_base: String,
    pub file_output: FileOutputMode,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    status: String,
    output: Option<Value>,
    error: Option<Value>,
}

pub struct ReplicateClient {
    client: Client,
    api_base: String,
    api_token: String,
    file_output: FileOutputMode,
    poll_interval: Duration,
    poll_timeout: Duration,
    classifier: ErrorClassifier,
}

impl ReplicateClient {
    pub fn new(config: &ReplicateConfig, classifier: ErrorClassifier) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            file_output: config.file_output,
            poll_interval: config.poll_interval,
            poll_timeout: config.poll_timeout,
            classifier,
        })
    }

    async fn assert_ok_response(
        &self,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ProviderError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        Err(self
            .classifier
            .error(format!("Replicate request failed: {status} {text}")))
    }

    async fn wait_for_prediction(
        &self,
        mut prediction: Prediction,
    ) -> Result<Prediction, ProviderError> {
        let deadline = Instant::now() + self.poll_timeout;
        let mut poll_count = 0u32;

        loop {
            match prediction.status.as_str() {
                "succeeded" => return Ok(prediction),
                "failed" | "canceled" => {
                    let detail = prediction
                        .error
                        .as_ref()
                        .map(|error| match error.as_str() {
                            Some(text) => text.to_string(),
                            None => error.to_string(),
                        })
                        .unwrap_or_else(|| "unknown error".to_string());
                    return Err(self
                        .classifier
                        .error(format!("Prediction {}: {detail}", prediction.status)));
                }
                _ => {}
            }

            if Instant::now() > deadline {
                return Err(ProviderError::other(format!(
                    "Prediction timed out (id={}, poll_count={poll_count})",
                    prediction.id
                )));
            }
            sleep(self.poll_interval).await;
            poll_count += 1;

            let response = self
                .client
                .get(format!("{}/predictions/{}", self.api_base, prediction.id))
                .bearer_auth(&self.api_token)
                .send()
                .await
                .map_err(|err| self.classifier.error(err.to_string()))?;
            let response = self.assert_ok_response(response).await?;
            prediction = response
                .json()
                .await
                .map_err(|err| ProviderError::other(format!("failed to parse prediction: {err}")))?;
            debug!(
                id = %prediction.id,
                status = %prediction.status,
                poll_count,
                "polled prediction"
            );
        }
    }

    async fn resolve_output(&self, output: Value) -> Result<RawProviderOutput, ProviderError> {
        match output {
            Value::String(url) => self.open_file(url).await,
            Value::Array(items) => {
                let urls: Option<Vec<String>> = items
                    .iter()
                    .map(|item| item.as_str().map(str::to_string))
                    .collect();
                match urls {
                    Some(urls) if self.file_output == FileOutputMode::Url || urls.is_empty() => {
                        Ok(RawProviderOutput::UrlArray(urls))
                    }
                    Some(mut urls) => self.open_file(urls.swap_remove(0)).await,
                    None => Ok(RawProviderOutput::Unknown(Value::Array(items))),
                }
            }
            other => Ok(RawProviderOutput::Unknown(other)),
        }
    }

    async fn open_file(&self, url: String) -> Result<RawProviderOutput, ProviderError> {
        if self.file_output == FileOutputMode::Url || url.starts_with("data:") {
            return Ok(RawProviderOutput::DirectUrl(url));
        }
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| self.classifier.error(err.to_string()))?;
        let response = self.assert_ok_response(response).await?;
        let classifier = self.classifier.clone();
        match self.file_output {
            FileOutputMode::Stream => Ok(RawProviderOutput::AsyncStream(
                response
                    .bytes_stream()
                    .map(move |chunk| chunk.map_err(|err| classifier.error(err.to_string())))
                    .boxed(),
            )),
            FileOutputMode::Reader => Ok(RawProviderOutput::ReaderStream(Box::new(ResponseReader {
                response: Some(response),
                classifier,
            }))),
            FileOutputMode::Url => Ok(RawProviderOutput::DirectUrl(url)),
        }
    }
}

#[async_trait]
impl ImageProvider for ReplicateClient {
    async fn run(
        &self,
        input: &ProviderInput,
        model: ModelVariant,
    ) -> Result<RawProviderOutput, ProviderError> {
        let model_id = model.model_id();
        debug!(
            model = model_id,
            has_input_image = input.input_image.is_some(),
            "creating prediction"
        );

        let response = self
            .client
            .post(format!("{}/models/{model_id}/predictions", self.api_base))
            .bearer_auth(&self.api_token)
            .header("Prefer", "wait")
            .json(&json!({ "input": input.to_json() }))
            .send()
            .await
            .map_err(|err| self.classifier.error(err.to_string()))?;
        let response = self.assert_ok_response(response).await?;
        let prediction: Prediction = response
            .json()
            .await
            .map_err(|err| ProviderError::other(format!("failed to parse prediction: {err}")))?;

        let prediction = self.wait_for_prediction(prediction).await?;
        self.resolve_output(prediction.output.unwrap_or(Value::Null)).await
    }
}

struct ResponseReader {
    response: Option<reqwest::Response>,
    classifier: ErrorClassifier,
}

#[async_trait]
impl ChunkReader for ResponseReader {
    async fn read(&mut self) -> Result<Option<Bytes>, ProviderError> {
        match self.response.as_mut() {
            Some(response) => response
                .chunk()
                .await
                .map_err(|err| self.classifier.error(err.to_string())),
            None => Ok(None),
        }
    }

    fn release_lock(&mut self) {
        self.response = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_to_image_input_carries_dimensions_only() {
        let input = ProviderInput {
            prompt: "A red circle".to_string(),
            input_image: None,
            sizing: Sizing::Dimensions {
                width: 1024,
                height: 768,
            },
        };
        assert_eq!(
            input.to_json(),
            json!({ "prompt": "A red circle", "width": 1024, "height": 768 })
        );
    }

    #[test]
    fn reference_input_omits_sentinel_aspect_ratio() {
        let input = ProviderInput {
            prompt: "make it smile".to_string(),
            input_image: Some("https://example.com/a.png".to_string()),
            sizing: Sizing::AspectRatio(None),
        };
        let body = input.to_json();
        assert_eq!(body["input_image"], "https://example.com/a.png");
        assert!(body.get("aspect_ratio").is_none());
        assert!(body.get("width").is_none());

        let input = ProviderInput {
            sizing: Sizing::AspectRatio(Some("16:9".to_string())),
            ..input
        };
        assert_eq!(input.to_json()["aspect_ratio"], "16:9");
    }

    #[test]
    fn classifier_prefers_sensitive_over_interrupted() {
        let classifier = ErrorClassifier::default();
        assert_eq!(
            classifier.classify("Prediction failed: input was flagged as sensitive"),
            ProviderErrorKind::Sensitive
        );
        assert_eq!(
            classifier.classify("Prediction interrupted; please retry (code: PA)"),
            ProviderErrorKind::Interrupted
        );
        assert_eq!(
            classifier.classify("Prediction interrupted after being flagged as sensitive"),
            ProviderErrorKind::Sensitive
        );
        assert_eq!(classifier.classify("502 Bad Gateway"), ProviderErrorKind::Other);
    }

    #[test]
    fn classifier_patterns_are_replaceable() {
        let classifier =
            ErrorClassifier::new(vec!["NSFW".to_string()], vec!["try again".to_string()]);
        assert_eq!(classifier.classify("flagged as sensitive"), ProviderErrorKind::Other);
        assert_eq!(classifier.classify("NSFW content detected"), ProviderErrorKind::Sensitive);
        assert_eq!(classifier.error("please try again").kind, ProviderErrorKind::Interrupted);
    }

    #[test]
    fn model_variants_map_to_kontext_models() {
        assert_eq!(ModelVariant::default(), ModelVariant::Max);
        assert_eq!(ModelVariant::Max.model_id(), "black-forest-labs/flux-kontext-max");
        assert_eq!(ModelVariant::Pro.model_id(), "black-forest-labs/flux-kontext-pro");
        let parsed: ModelVariant = serde_json::from_str("\"pro\"").unwrap();
        assert_eq!(parsed, ModelVariant::Pro);
    }

    #[test]
    fn file_output_mode_parses_case_insensitively() {
        assert_eq!("Reader".parse::<FileOutputMode>(), Ok(FileOutputMode::Reader));
        assert_eq!(" url ".parse::<FileOutputMode>(), Ok(FileOutputMode::Url));
        assert!("pipe".parse::<FileOutputMode>().is_err());
    }
}
