use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, FromRef, FromRequest, Multipart, Path, Request, State,
        rejection::JsonRejection,
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{error, info};

use crate::{
    auth::{AccessTokens, CallerIdentity},
    error::{GenerationError, json_error},
    image_processing::{decode_data_uri, detect_mime_type, get_extension_from_mime_type},
    orchestrator::{GenerationRequest, Orchestrator},
    store::{GeneratedImageRecord, StoreError},
    validation::validate_http_url,
};

pub const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub tokens: Arc<AccessTokens>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, tokens: AccessTokens) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            tokens: Arc::new(tokens),
        }
    }
}

impl FromRef<AppState> for Arc<AccessTokens> {
    fn from_ref(state: &AppState) -> Self {
        state.tokens.clone()
    }
}

#[derive(Serialize)]
struct UploadResponse {
    #[serde(rename = "imageUrl")]
    image_url: String,
}

pub fn router(state: AppState) -> Router {
    let images_dir = state.orchestrator.static_files().images_dir();
    Router::new()
        .route("/api/generate", post(generate_image))
        .route("/api/images", get(list_images))
        .route("/api/images/{id}", get(get_image).delete(delete_image))
        .route("/api/images/{id}/full", get(full_image))
        .route("/api/image/{id}", get(primary_image))
        .route("/api/upload", post(upload_image))
        .route("/api/auth/user", get(auth_user))
        .nest_service("/images", ServeDir::new(images_dir))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "image store failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "persistence_error", "image store is unavailable")
}

fn parse_id(raw: &str) -> Result<u64, Response> {
    raw.parse::<u64>()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "validation_error", "Invalid image ID"))
}

fn not_found() -> Response {
    json_error(StatusCode::NOT_FOUND, "not_found", "Image not found")
}

async fn find_record(state: &AppState, raw_id: &str) -> Result<GeneratedImageRecord, Response> {
    let id = parse_id(raw_id)?;
    match state.orchestrator.store().get(id).await {
        Ok(Some(record)) => Ok(record),
        Ok(None) => Err(not_found()),
        Err(err) => Err(store_error(err)),
    }
}

async fn generate_image(
    State(state): State<AppState>,
    caller: CallerIdentity,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GeneratedImageRecord>, GenerationError> {
    let Json(request) = payload.map_err(|rejection| {
        GenerationError::Validation(format!("Invalid request data: {}", rejection.body_text()))
    })?;
    let record = state.orchestrator.generate(request, &caller).await?;
    Ok(Json(record))
}

async fn list_images(State(state): State<AppState>, _caller: CallerIdentity) -> Response {
    match state.orchestrator.store().list().await {
        Ok(records) => Json(records).into_response(),
        Err(err) => store_error(err),
    }
}

async fn get_image(
    State(state): State<AppState>,
    _caller: CallerIdentity,
    Path(id): Path<String>,
) -> Response {
    match find_record(&state, &id).await {
        Ok(record) => Json(record).into_response(),
        Err(response) => response,
    }
}

async fn delete_image(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.orchestrator.store().delete(id).await {
        Ok(true) => {
            info!(id, caller = %caller.name, "image deleted");
            Json(json!({ "success": true })).into_response()
        }
        Ok(false) => not_found(),
        Err(err) => store_error(err),
    }
}

fn image_response(bytes: Vec<u8>, content_type: &str, cache_control: &'static str) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CACHE_CONTROL, cache_control.to_string()),
            (
                header::HeaderName::from_static("cross-origin-resource-policy"),
                "cross-origin".to_string(),
            ),
        ],
        bytes,
    )
        .into_response()
}

async fn full_image(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let record = match find_record(&state, &id).await {
        Ok(record) => record,
        Err(response) => return response,
    };
    let Some(bytes) = record
        .image_data
        .as_deref()
        .filter(|data| !data.is_empty())
        .and_then(|data| STANDARD.decode(data).ok())
    else {
        return not_found();
    };
    let content_type = detect_mime_type(&bytes).unwrap_or("image/jpeg");
    image_response(bytes, content_type, "public, max-age=3600")
}

async fn primary_image(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let record = match find_record(&state, &id).await {
        Ok(record) => record,
        Err(response) => return response,
    };
    if record.image_url.starts_with("data:image/") {
        return match decode_data_uri(&record.image_url) {
            Some((mime_type, bytes)) => {
                let content_type = detect_mime_type(&bytes)
                    .map(str::to_string)
                    .unwrap_or(mime_type);
                image_response(bytes, &content_type, "public, max-age=31536000")
            }
            None => json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "corrupt_image",
                "Failed to serve image",
            ),
        };
    }
    Redirect::temporary(&record.image_url).into_response()
}

fn extension_from_filename(file_name: &str) -> Option<String> {
    if let Some((_, ext)) = file_name.rsplit_once('.') {
        let trimmed = ext.trim();
        if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Some(trimmed.to_lowercase());
        }
    }
    None
}

fn resolve_extension(bytes: &[u8], file_name: &str, content_type: Option<&str>) -> String {
    if let Some(mime_type) = detect_mime_type(bytes) {
        return get_extension_from_mime_type(mime_type).to_string();
    }
    if let Some(ext) = extension_from_filename(file_name) {
        return ext;
    }
    content_type
        .map(get_extension_from_mime_type)
        .unwrap_or("bin")
        .to_string()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadJson {
    #[serde(default)]
    image_data: Option<String>,
}

/// Accepts a multipart `file` field or a JSON `{ "imageData": "<data URI>" }`
/// body. Data URIs are written to the static directory; http(s) URLs are
/// handed back unchanged.
async fn upload_image(
    State(state): State<AppState>,
    caller: CallerIdentity,
    request: Request,
) -> Response {
    let is_json = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"));
    if is_json {
        upload_from_json(&state, &caller, request).await
    } else {
        upload_from_multipart(&state, &caller, request).await
    }
}

async fn upload_from_json(state: &AppState, caller: &CallerIdentity, request: Request) -> Response {
    let payload = match Json::<UploadJson>::from_request(request, state).await {
        Ok(Json(payload)) => payload,
        Err(rejection) => {
            return json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                &format!("Invalid request data: {}", rejection.body_text()),
            );
        }
    };
    let Some(image_data) = payload
        .image_data
        .map(|data| data.trim().to_string())
        .filter(|data| !data.is_empty())
    else {
        return json_error(StatusCode::BAD_REQUEST, "validation_error", "No image data provided");
    };

    if !image_data.starts_with("data:") {
        return match validate_http_url(&image_data) {
            Ok(_) => Json(UploadResponse {
                image_url: image_data,
            })
            .into_response(),
            Err(err) => err.into_response(),
        };
    }
    let Some((mime_type, bytes)) = decode_data_uri(&image_data) else {
        return json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "imageData must be a base64 data URI",
        );
    };
    save_upload(state, caller, &bytes, "", Some(&mime_type)).await
}

async fn upload_from_multipart(
    state: &AppState,
    caller: &CallerIdentity,
    request: Request,
) -> Response {
    let mut multipart = match Multipart::from_request(request, state).await {
        Ok(multipart) => multipart,
        Err(rejection) => {
            return json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                &format!("Invalid upload: {}", rejection.body_text()),
            );
        }
    };

    let mut upload = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() != Some("file") {
                    continue;
                }
                let content_type = field.content_type().map(str::to_string);
                let file_name = field.file_name().unwrap_or("").to_string();
                match field.bytes().await {
                    Ok(data) => upload = Some((file_name, content_type, data)),
                    Err(err) => {
                        return json_error(
                            StatusCode::BAD_REQUEST,
                            "validation_error",
                            &format!("Failed to read file: {err}"),
                        );
                    }
                }
                break;
            }
            Ok(None) => break,
            Err(err) => {
                return json_error(
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    &format!("Failed to read form: {err}"),
                );
            }
        }
    }

    let Some((file_name, content_type, bytes)) = upload else {
        return json_error(StatusCode::BAD_REQUEST, "validation_error", "No image data provided");
    };
    save_upload(state, caller, &bytes, &file_name, content_type.as_deref()).await
}

async fn save_upload(
    state: &AppState,
    caller: &CallerIdentity,
    bytes: &[u8],
    file_name: &str,
    content_type: Option<&str>,
) -> Response {
    if bytes.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "validation_error", "Uploaded file is empty");
    }
    if content_type.is_some_and(|content_type| !content_type.starts_with("image/")) {
        return json_error(StatusCode::BAD_REQUEST, "validation_error", "Unsupported file type");
    }

    let ext = resolve_extension(bytes, file_name, content_type);
    match state.orchestrator.static_files().save(bytes, &ext).await {
        Ok(image_url) => {
            info!(
                caller = %caller.name,
                image_url = %image_url,
                size = bytes.len(),
                "reference image uploaded"
            );
            Json(UploadResponse { image_url }).into_response()
        }
        Err(err) => {
            error!(error = %err, "failed to save uploaded image");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "persistence_error",
                "Failed to upload image",
            )
        }
    }
}

async fn auth_user(State(state): State<AppState>, headers: HeaderMap) -> Json<serde_json::Value> {
    match state.tokens.authenticate(&headers) {
        Some(caller) => Json(json!({ "authenticated": true, "name": caller.name })),
        None => Json(json!({ "authenticated": false })),
    }
}
