use url::Url;

use crate::error::GenerationError;
use crate::store::StaticFiles;

/// Where a caller's reference image lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceImage {
    External(String),
    LocalPath(String),
    Inline(String),
}

impl ReferenceImage {
    pub fn parse(raw: &str) -> Result<Option<Self>, GenerationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        if trimmed.starts_with("data:image/") {
            if !trimmed.contains(";base64,") {
                return Err(GenerationError::Validation(
                    "inline reference image must be base64 encoded".to_string(),
                ));
            }
            return Ok(Some(Self::Inline(trimmed.to_string())));
        }
        if StaticFiles::is_local_path(trimmed) {
            return Ok(Some(Self::LocalPath(trimmed.to_string())));
        }
        validate_http_url(trimmed)?;
        Ok(Some(Self::External(trimmed.to_string())))
    }
}

pub fn validate_http_url(raw: &str) -> Result<Url, GenerationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(GenerationError::Validation("url must not be empty".to_string()));
    }
    let parsed = Url::parse(trimmed)
        .map_err(|err| GenerationError::Validation(format!("invalid URL or file path: {err}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(GenerationError::Validation(format!(
            "only http or https reference URLs are allowed, got {scheme}"
        ))),
    }
}
