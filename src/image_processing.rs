use anyhow::{Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::{
    DynamicImage, GenericImageView, ImageFormat, codecs::jpeg::JpegEncoder, imageops::FilterType,
};
use tracing::{debug, warn};

pub const FULL_IMAGE_MAX_DIMENSION: u32 = 1200;
pub const FULL_IMAGE_QUALITY: u8 = 85;
pub const THUMBNAIL_SIZE: u32 = 200;
pub const THUMBNAIL_QUALITY: u8 = 30;

/// Result of optimizing a generated image. `Fallback` carries the untouched
/// original when it could not be re-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessedImage {
    Processed { full: Vec<u8>, thumbnail: Vec<u8> },
    Fallback(Vec<u8>),
}

impl ProcessedImage {
    pub fn full(&self) -> &[u8] {
        match self {
            Self::Processed { full, .. } => full,
            Self::Fallback(original) => original,
        }
    }

    pub fn thumbnail(&self) -> &[u8] {
        match self {
            Self::Processed { thumbnail, .. } => thumbnail,
            Self::Fallback(original) => original,
        }
    }
}

/// Re-encodes `bytes` into a bounded full image and a square thumbnail. The
/// original is kept when it cannot be decoded, or when it is already smaller
/// than the thumbnail would be.
pub fn process(bytes: &[u8]) -> ProcessedImage {
    match optimize(bytes) {
        Ok((full, thumbnail)) if thumbnail.len() < full.len() => {
            debug!(
                original = bytes.len(),
                full = full.len(),
                thumbnail = thumbnail.len(),
                "image optimized"
            );
            ProcessedImage::Processed { full, thumbnail }
        }
        Ok((full, thumbnail)) => {
            debug!(
                original = bytes.len(),
                full = full.len(),
                thumbnail = thumbnail.len(),
                "thumbnail is not smaller than the full image, keeping original"
            );
            ProcessedImage::Fallback(bytes.to_vec())
        }
        Err(err) => {
            warn!(
                error = %err,
                size = bytes.len(),
                "image optimization failed, keeping original"
            );
            ProcessedImage::Fallback(bytes.to_vec())
        }
    }
}

fn optimize(bytes: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let image = decode_image(bytes)?;

    let full = encode_jpeg(
        &fit_inside(&image, FULL_IMAGE_MAX_DIMENSION),
        FULL_IMAGE_QUALITY,
    )?;
    let full = if full.len() > bytes.len() {
        bytes.to_vec()
    } else {
        full
    };

    let thumbnail = encode_jpeg(&cover_square(&image, THUMBNAIL_SIZE), THUMBNAIL_QUALITY)?;
    Ok((full, thumbnail))
}

/// Shrinks so the longest side is at most `max`; never enlarges.
fn fit_inside(image: &DynamicImage, max: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    if width <= max && height <= max {
        return image.clone();
    }
    image.resize(max, max, FilterType::Lanczos3)
}

/// Centre-cropped square of side `size`, or of the shorter side when the
/// source is smaller.
fn cover_square(image: &DynamicImage, size: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    let side = size.min(width).min(height).max(1);
    image.resize_to_fill(side, side, FilterType::Triangle)
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    DynamicImage::ImageRgb8(image.to_rgb8())
        .write_with_encoder(JpegEncoder::new_with_quality(&mut output, quality))
        .map_err(|err| anyhow!("encode jpeg failed: {err}"))?;
    Ok(output)
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    let image = match detect_mime_type(bytes) {
        Some(mime_type) => image::load_from_memory_with_format(bytes, mime_to_format(mime_type)?),
        None => image::load_from_memory(bytes),
    };
    image.map_err(|err| anyhow!("decode image failed: {err}"))
}

pub fn get_dimensions(bytes: &[u8]) -> Result<(u32, u32)> {
    Ok(decode_image(bytes)?.dimensions())
}

pub fn detect_mime_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if bytes.starts_with(b"BM") {
        return Some("image/bmp");
    }
    None
}

pub fn mime_to_format(mime_type: &str) -> Result<ImageFormat> {
    match mime_type {
        "image/png" => Ok(ImageFormat::Png),
        "image/jpeg" | "image/jpg" => Ok(ImageFormat::Jpeg),
        "image/gif" => Ok(ImageFormat::Gif),
        "image/webp" => Ok(ImageFormat::WebP),
        "image/bmp" => Ok(ImageFormat::Bmp),
        _ => Err(anyhow!("unsupported mime type: {mime_type}")),
    }
}

pub fn get_extension_from_mime_type(mime_type: &str) -> &'static str {
    match mime_type.to_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/bmp" => "bmp",
        _ => "bin",
    }
}

pub fn to_data_uri(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", STANDARD.encode(bytes))
}

/// Splits a `data:<mime>;base64,<payload>` URI into its mime type and bytes.
pub fn decode_data_uri(uri: &str) -> Option<(String, Vec<u8>)> {
    let rest = uri.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime_type = header.strip_suffix(";base64")?;
    let bytes = STANDARD.decode(payload.trim()).ok()?;
    Some((mime_type.to_string(), bytes))
}
