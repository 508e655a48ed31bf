use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use reqwest::StatusCode;
use tracing::warn;

use crate::utils::http::get_http_client;
use crate::utils::text::truncate_chars;

const MEDIA_DOWNLOAD_MAX_ATTEMPTS: usize = 3;
const MEDIA_DOWNLOAD_BASE_DELAY_MS: u64 = 400;
const MEDIA_ERROR_BODY_LIMIT: usize = 400;
const FALLBACK_IMAGE_MIME: &str = "image/jpeg";

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("media download failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("media download returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("downloaded media is empty")]
    Empty,
    #[error("unsupported image type {0}")]
    Unsupported(String),
}

/// Image bytes ready to be sent inline to the model.
#[derive(Debug, Clone)]
pub struct InlineImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl InlineImage {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, MediaError> {
        if bytes.is_empty() {
            return Err(MediaError::Empty);
        }
        let mime_type = detect_mime_type(&bytes).unwrap_or_else(|| FALLBACK_IMAGE_MIME.to_string());
        let mime_type = normalize_image_mime(&mime_type);
        if !is_supported_image_mime(&mime_type) {
            return Err(MediaError::Unsupported(mime_type));
        }
        Ok(Self { bytes, mime_type })
    }

    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(&self.bytes)
    }
}

pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    if data.len() > 12 {
        let ftyp = &data[4..12];
        if ftyp.starts_with(b"ftyp") {
            let brand = &ftyp[4..8];
            if brand == b"heic" || brand == b"heif" || brand == b"hevc" {
                return Some("image/heic".to_string());
            }
        }
    }

    infer::get(data).map(|kind| kind.mime_type().to_string())
}

fn normalize_image_mime(mime_type: &str) -> String {
    let lowered = mime_type.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "image/jpg" => "image/jpeg".to_string(),
        _ => lowered,
    }
}

fn is_supported_image_mime(mime_type: &str) -> bool {
    matches!(
        mime_type,
        "image/png" | "image/jpeg" | "image/webp" | "image/heic" | "image/heif"
    )
}

fn should_retry_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn retry_delay(attempt: usize) -> Duration {
    Duration::from_millis(MEDIA_DOWNLOAD_BASE_DELAY_MS << attempt)
}

pub async fn download_media(url: &str) -> Result<Vec<u8>, MediaError> {
    let client = get_http_client();
    let mut attempt = 0usize;
    loop {
        let last_attempt = attempt + 1 == MEDIA_DOWNLOAD_MAX_ATTEMPTS;
        match client.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|err| MediaError::Request(err.without_url()))?;
                if bytes.is_empty() {
                    return Err(MediaError::Empty);
                }
                return Ok(bytes.to_vec());
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let body = truncate_chars(&body, MEDIA_ERROR_BODY_LIMIT);
                warn!(
                    "Media download failed with status {} (attempt={}/{})",
                    status,
                    attempt + 1,
                    MEDIA_DOWNLOAD_MAX_ATTEMPTS
                );
                if !should_retry_status(status) || last_attempt {
                    return Err(MediaError::Status { status, body });
                }
            }
            Err(err) => {
                let err = err.without_url();
                warn!(
                    "Failed to fetch media: {} (timeout={}, connect={}, attempt={}/{})",
                    err,
                    err.is_timeout(),
                    err.is_connect(),
                    attempt + 1,
                    MEDIA_DOWNLOAD_MAX_ATTEMPTS
                );
                if !(err.is_timeout() || err.is_connect()) || last_attempt {
                    return Err(MediaError::Request(err));
                }
            }
        }
        tokio::time::sleep(retry_delay(attempt)).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: [u8; 16] = [
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48,
        0x44, 0x52,
    ];

    #[test]
    fn detects_png_bytes() {
        let image = InlineImage::from_bytes(PNG_HEADER.to_vec()).expect("png is supported");
        assert_eq!(image.mime_type, "image/png");
        assert!(!image.to_base64().is_empty());
    }

    #[test]
    fn unknown_bytes_fall_back_to_jpeg() {
        let image = InlineImage::from_bytes(vec![1, 2, 3, 4]).expect("fallback mime");
        assert_eq!(image.mime_type, "image/jpeg");
    }

    #[test]
    fn rejects_empty_and_non_image_payloads() {
        assert!(matches!(InlineImage::from_bytes(Vec::new()), Err(MediaError::Empty)));
        let pdf = b"%PDF-1.7\n%....".to_vec();
        assert!(matches!(
            InlineImage::from_bytes(pdf),
            Err(MediaError::Unsupported(mime)) if mime == "application/pdf"
        ));
    }

    #[test]
    fn heic_brand_is_detected() {
        let mut data = vec![0u8; 16];
        data[4..8].copy_from_slice(b"ftyp");
        data[8..12].copy_from_slice(b"heic");
        assert_eq!(detect_mime_type(&data).as_deref(), Some("image/heic"));
    }
}
