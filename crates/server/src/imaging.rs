use std::{io::Cursor, time::Duration};

use axum::body::Bytes;
use image::{DynamicImage, GenericImageView, ImageFormat};
use reqwest::Client;
use shared::error::{ApiError, ErrorCode};
use url::Url;

pub const THUMBNAIL_EDGE: u32 = 1024;
pub const ARCHIVE_CONTENT_TYPE: &str = "image/jpeg";

pub fn parse_image_url(raw: &str) -> Result<Url, ApiError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| ApiError::validation(format!("Invalid image URL: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ApiError::validation(format!(
            "Invalid image URL: unsupported scheme '{other}'"
        ))),
    }
}

pub async fn fetch_image(
    http: &Client,
    url: &Url,
    timeout: Duration,
    max_bytes: usize,
) -> Result<Bytes, ApiError> {
    let fetch_failed = |detail: String| {
        ApiError::new(
            ErrorCode::FetchFailed,
            format!("Failed to fetch image from URL: {detail}"),
        )
    };

    let mut response = http
        .get(url.clone())
        .timeout(timeout)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| fetch_failed(e.to_string()))?;

    let too_large = || fetch_failed(format!("image exceeds {max_bytes} bytes"));
    if let Some(length) = response.content_length() {
        if length > max_bytes as u64 {
            return Err(too_large());
        }
    }

    // Chunked bodies carry no length up front.
    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| fetch_failed(e.to_string()))?
    {
        if body.len() + chunk.len() > max_bytes {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }
    if body.is_empty() {
        return Err(fetch_failed("empty response body".to_string()));
    }
    Ok(Bytes::from(body))
}

/// Decodes `bytes` without keeping anything, for when nothing is archived.
pub fn ensure_decodable(bytes: &[u8]) -> Result<(), ApiError> {
    decode(bytes).map(|_| ())
}

fn decode(bytes: &[u8]) -> Result<DynamicImage, ApiError> {
    image::load_from_memory(bytes).map_err(|e| {
        ApiError::new(
            ErrorCode::UnsupportedImage,
            format!("Unsupported or corrupt image: {e}"),
        )
    })
}

/// Decodes `bytes`, shrinks the image to fit the thumbnail box and re-encodes
/// it as JPEG. Images already inside the box keep their size.
pub fn archive_jpeg(bytes: &[u8]) -> Result<Vec<u8>, ApiError> {
    let decoded = decode(bytes)?;

    let (width, height) = decoded.dimensions();
    let fitted = if width > THUMBNAIL_EDGE || height > THUMBNAIL_EDGE {
        decoded.thumbnail(THUMBNAIL_EDGE, THUMBNAIL_EDGE)
    } else {
        decoded
    };

    let rgb = DynamicImage::ImageRgb8(fitted.to_rgb8());
    let mut out = Cursor::new(Vec::new());
    rgb.write_to(&mut out, ImageFormat::Jpeg)
        .map_err(|e| ApiError::internal(format!("failed to encode archive image: {e}")))?;
    Ok(out.into_inner())
}
