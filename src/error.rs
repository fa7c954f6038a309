use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

/// Every way a generation request can end without a stored record.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("{0}")]
    Validation(String),

    #[error("reference image not found: {0}")]
    ReferenceImageNotFound(String),

    #[error("content was flagged as sensitive, please try a different prompt or image")]
    ContentRejected { detail: String },

    #[error("image generation failed: {0}")]
    GenerationFailed(String),

    #[error("unexpected output format from provider: {0}")]
    UnexpectedOutputFormat(String),

    #[error("failed to save generated image: {0}")]
    Persistence(#[from] StoreError),
}

impl GenerationError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::ReferenceImageNotFound(_) => "reference_image_not_found",
            Self::ContentRejected { .. } => "content_rejected",
            Self::GenerationFailed(_) => "generation_failed",
            Self::UnexpectedOutputFormat(_) => "unexpected_output_format",
            Self::Persistence(_) => "persistence_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::ReferenceImageNotFound(_) => StatusCode::BAD_REQUEST,
            Self::ContentRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::GenerationFailed(_) | Self::UnexpectedOutputFormat(_) => StatusCode::BAD_GATEWAY,
            Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub reason: String,
}

pub fn json_error(status: StatusCode, reason: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
            reason: reason.to_string(),
        }),
    )
        .into_response()
}

impl IntoResponse for GenerationError {
    fn into_response(self) -> Response {
        json_error(self.status(), self.reason(), &self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_content_maps_to_unprocessable() {
        let err = GenerationError::ContentRejected {
            detail: "Prediction failed: flagged as sensitive (E005)".to_string(),
        };
        assert_eq!(err.reason(), "content_rejected");
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(!err.to_string().contains("E005"));
    }

    #[test]
    fn validation_is_a_client_error() {
        let err = GenerationError::Validation("prompt is required".to_string());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "prompt is required");
    }
}
