use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::{
    auth::CallerIdentity,
    error::GenerationError,
    image_processing::{self, ProcessedImage},
    normalize::{NormalizedOutput, normalize},
    replicate::{ImageProvider, ModelVariant, ProviderInput, Sizing},
    retry::{RetryPolicy, with_retries},
    store::{
        GeneratedImageRecord, ImageRepository, MATCH_INPUT_IMAGE, NewImageRecord, StaticFileError,
        StaticFiles,
    },
    validation::ReferenceImage,
};

pub const DEFAULT_DIMENSION: u32 = 1024;
pub const DEFAULT_COST: &str = "0.05";

fn default_dimension() -> u32 {
    DEFAULT_DIMENSION
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub input_image_url: Option<String>,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
    #[serde(default)]
    pub model: ModelVariant,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            input_image_url: None,
            width: DEFAULT_DIMENSION,
            height: DEFAULT_DIMENSION,
            aspect_ratio: None,
            model: ModelVariant::default(),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_reference(mut self, locator: impl Into<String>) -> Self {
        self.input_image_url = Some(locator.into());
        self
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: impl Into<String>) -> Self {
        self.aspect_ratio = Some(aspect_ratio.into());
        self
    }

    pub fn with_model(mut self, model: ModelVariant) -> Self {
        self.model = model;
        self
    }
}

/// Runs one generation request end to end: validate, call the provider with
/// retries, normalize and optimize the output, then persist exactly once.
pub struct Orchestrator {
    provider: Arc<dyn ImageProvider>,
    store: Arc<dyn ImageRepository>,
    static_files: StaticFiles,
    retry: RetryPolicy,
    cost: Option<String>,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn ImageProvider>,
        store: Arc<dyn ImageRepository>,
        static_files: StaticFiles,
    ) -> Self {
        Self {
            provider,
            store,
            static_files,
            retry: RetryPolicy::default(),
            cost: Some(DEFAULT_COST.to_string()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cost(mut self, cost: Option<String>) -> Self {
        self.cost = cost;
        self
    }

    pub fn store(&self) -> &Arc<dyn ImageRepository> {
        &self.store
    }

    pub fn static_files(&self) -> &StaticFiles {
        &self.static_files
    }

    pub async fn generate(
        &self,
        request: GenerationRequest,
        caller: &CallerIdentity,
    ) -> Result<GeneratedImageRecord, GenerationError> {
        if request.prompt.trim().is_empty() {
            return Err(GenerationError::Validation("prompt is required".to_string()));
        }
        let reference = match request.input_image_url.as_deref() {
            Some(raw) => ReferenceImage::parse(raw)?,
            None => None,
        };

        let input = ProviderInput {
            prompt: request.prompt.clone(),
            input_image: match &reference {
                Some(reference) => Some(self.inline_reference(reference).await?),
                None => None,
            },
            sizing: match reference {
                Some(_) => Sizing::AspectRatio(
                    request
                        .aspect_ratio
                        .clone()
                        .filter(|ratio| {
                            !ratio.trim().is_empty() && ratio != MATCH_INPUT_IMAGE
                        }),
                ),
                None => Sizing::Dimensions {
                    width: request.width,
                    height: request.height,
                },
            },
        };

        let model = request.model;
        info!(
            caller = %caller.name,
            model = model.model_id(),
            has_reference = input.input_image.is_some(),
            "starting image generation"
        );
        let provider = self.provider.as_ref();
        let input_ref = &input;
        let output = with_retries(move |_| provider.run(input_ref, model), &self.retry).await?;

        let (image_url, image_data, thumbnail_data) = match normalize(output).await? {
            NormalizedOutput::Locator(url) => (url, None, None),
            NormalizedOutput::Bytes(bytes) => {
                let processed = image_processing::process(&bytes);
                let primary = match &processed {
                    ProcessedImage::Processed { thumbnail, .. } => {
                        image_processing::to_data_uri("image/jpeg", thumbnail)
                    }
                    ProcessedImage::Fallback(original) => image_processing::to_data_uri(
                        image_processing::detect_mime_type(original).unwrap_or("image/png"),
                        original,
                    ),
                };
                (
                    primary,
                    Some(STANDARD.encode(processed.full())),
                    Some(STANDARD.encode(processed.thumbnail())),
                )
            }
        };

        let has_reference = input.input_image.is_some();
        let record = NewImageRecord {
            prompt: request.prompt,
            image_url,
            image_data,
            thumbnail_data,
            input_image_url: request.input_image_url.filter(|url| !url.trim().is_empty()),
            width: if has_reference { DEFAULT_DIMENSION } else { request.width },
            height: if has_reference { DEFAULT_DIMENSION } else { request.height },
            aspect_ratio: request.aspect_ratio,
            cost: self.cost.clone(),
        };

        let saved = self.store.create(record).await.map_err(|err| {
            error!(caller = %caller.name, error = %err, "generated image could not be saved");
            GenerationError::from(err)
        })?;
        info!(id = saved.id, caller = %caller.name, "image generated and saved");
        Ok(saved)
    }

    async fn inline_reference(
        &self,
        reference: &ReferenceImage,
    ) -> Result<String, GenerationError> {
        match reference {
            ReferenceImage::External(url) => Ok(url.clone()),
            ReferenceImage::Inline(data_uri) => Ok(data_uri.clone()),
            ReferenceImage::LocalPath(locator) => {
                let bytes = self
                    .static_files
                    .resolve_local_path(locator)
                    .await
                    .map_err(|err| match err {
                        StaticFileError::NotFound(path) => {
                            warn!(path = %path, "reference image not found");
                            GenerationError::ReferenceImageNotFound(path)
                        }
                        StaticFileError::InvalidPath(path) => {
                            GenerationError::Validation(format!(
                                "invalid reference image path: {path}"
                            ))
                        }
                        StaticFileError::Io(err) => {
                            GenerationError::ReferenceImageNotFound(format!("{locator}: {err}"))
                        }
                    })?;
                let mime_type =
                    image_processing::detect_mime_type(&bytes).unwrap_or("image/png");
                Ok(image_processing::to_data_uri(mime_type, &bytes))
            }
        }
    }
}
