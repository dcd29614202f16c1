use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use super::errors::ApiError;
use super::{AppState, ClientId};
use crate::downloader::models::{AcquisitionRequest, ExtractionAttempt, MediaFormat};
use crate::downloader::platform::{detect, Platform};
use crate::downloader::tools::ToolInfo;
use crate::downloader::utils::CookieFile;

#[derive(Debug, Default, Deserialize)]
pub struct DownloadBody {
    pub url: Option<String>,
    pub format: Option<String>,
    pub quality: Option<String>,
    /// Netscape cookie jar text
    pub cookies: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    pub success: bool,
    pub file_path: String,
    pub download_url: String,
    pub filename: String,
    pub file_size: u64,
    pub platform: Platform,
    pub title: String,
    pub content_type: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub diagnostics: Vec<ExtractionAttempt>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub platforms: Vec<&'static str>,
    pub tiers: BTreeMap<String, Vec<String>>,
    pub pending_cleanups: usize,
    pub tools: Vec<ToolInfo>,
}

/// Validated body, before platform resolution
struct Validated {
    request: AcquisitionRequest,
    cookies: Option<String>,
}

fn validate(
    body: Result<Json<DownloadBody>, JsonRejection>,
    client: Option<Extension<ClientId>>,
) -> Result<Validated, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::validation("body", e.body_text()))?;

    let url = body
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::validation("url", "url is required"))?;

    match reqwest::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
        _ => return Err(ApiError::validation("url", format!("invalid url: {}", url))),
    }

    let format = match body.format.as_deref() {
        Some(f) if !f.trim().is_empty() => f
            .parse::<MediaFormat>()
            .map_err(|e| ApiError::validation("format", e))?,
        _ => MediaFormat::default(),
    };

    let mut request = AcquisitionRequest::new(url, format);
    if let Some(quality) = body.quality.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        request.quality = quality.to_string();
    }
    if let Some(Extension(ClientId(client))) = client {
        request.client_id = client;
    }

    Ok(Validated {
        request,
        cookies: body.cookies.filter(|c| !c.trim().is_empty()),
    })
}

/// POST /download - platform detected from the url
pub async fn download(
    State(state): State<AppState>,
    client: Option<Extension<ClientId>>,
    body: Result<Json<DownloadBody>, JsonRejection>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let Validated { request, cookies } = validate(body, client)?;

    let platform = detect(&request.url);
    if !platform.is_supported() {
        info!(client = %request.client_id, url = %request.url, "Unsupported");
        return Err(ApiError::UnsupportedPlatform { url: request.url });
    }

    acquire(&state, platform, request, cookies).await
}

/// POST /:platform - the route picks the chain; the url is not re-detected
pub async fn download_for_platform(
    State(state): State<AppState>,
    Path(segment): Path<String>,
    client: Option<Extension<ClientId>>,
    body: Result<Json<DownloadBody>, JsonRejection>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let platform = segment
        .parse::<Platform>()
        .map_err(|_| ApiError::UnknownRoute(segment.clone()))?;

    let Validated { request, cookies } = validate(body, client)?;

    let detected = detect(&request.url);
    if detected != platform {
        warn!(route = %platform, detected = %detected, url = %request.url, "url does not match route platform");
    }

    acquire(&state, platform, request, cookies).await
}

async fn acquire(
    state: &AppState,
    platform: Platform,
    request: AcquisitionRequest,
    cookies: Option<String>,
) -> Result<Json<DownloadResponse>, ApiError> {
    info!(client = %request.client_id, platform = %platform, url = %request.url, format = ?request.format, "Received");

    let chain = state
        .registry
        .get(platform)
        .ok_or_else(|| ApiError::UnsupportedPlatform {
            url: request.url.clone(),
        })?;

    // Lives until the chain has finished; removed on drop
    let cookie_file = match cookies {
        Some(contents) => Some(
            CookieFile::write(&state.scratch_dir, &contents)
                .map_err(|e| ApiError::Internal(format!("failed to store cookies: {}", e)))?,
        ),
        None => None,
    };

    let outcome = chain
        .run(&request, cookie_file.as_ref().map(CookieFile::path), &state.materializer)
        .await?;
    drop(cookie_file);

    let (result, file, diagnostics, note) = outcome.into_parts();

    state.cleanup.schedule(&file.path, &file.filename);

    info!(
        platform = %platform,
        file = %file.filename,
        size = file.size,
        degraded = note.is_some(),
        "Completed"
    );

    Ok(Json(DownloadResponse {
        success: true,
        file_path: file.path.display().to_string(),
        download_url: download_url(state.public_url.as_deref(), &file.filename),
        filename: file.filename,
        file_size: file.size,
        platform,
        title: result.title,
        content_type: file.content_type.as_str().to_string(),
        mime_type: file.mime,
        uploader: result.uploader,
        duration: result.duration,
        degraded: note.is_some(),
        note,
        diagnostics,
    }))
}

fn download_url(public_url: Option<&str>, filename: &str) -> String {
    let base = public_url.map(|u| u.trim_end_matches('/')).unwrap_or("");
    format!("{}/api/file/{}", base, filename)
}

/// A bare file name: no separators, no parent references
fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
        && !name.starts_with('.')
}

/// GET /file/:filename - streams a stored file and resets its cleanup timer
pub async fn get_file(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    if !is_safe_filename(&filename) {
        return Err(ApiError::NotFound(filename));
    }

    let path = state.storage_dir().join(&filename);
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(_) => return Err(ApiError::NotFound(filename)),
    };
    let size = file.metadata().await.map(|m| m.len()).ok();

    state.cleanup.touch(&filename);

    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(mime.essence_str()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Some(size) = size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    if let Ok(value) = HeaderValue::from_str(&format!("inline; filename=\"{}\"", filename)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    Ok(response)
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();

    Json(HealthResponse {
        status: "ok",
        timestamp,
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started.elapsed().as_secs(),
        platforms: Platform::supported().iter().map(Platform::as_str).collect(),
        tiers: state.registry.tier_sources(),
        pending_cleanups: state.cleanup.pending(),
        tools: state.tools.get_all_tools().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_url_prefix() {
        assert_eq!(download_url(None, "a_1.mp3"), "/api/file/a_1.mp3");
        assert_eq!(
            download_url(Some("https://api.example.com/"), "a_1.mp3"),
            "https://api.example.com/api/file/a_1.mp3"
        );
    }

    #[test]
    fn test_safe_filename() {
        assert!(is_safe_filename("Sample_Track_1700000000000.mp3"));
        assert!(!is_safe_filename(".."));
        assert!(!is_safe_filename("../etc/passwd"));
        assert!(!is_safe_filename("a\\b"));
        assert!(!is_safe_filename(".gitkeep"));
        assert!(!is_safe_filename(""));
    }

    #[test]
    fn test_validate_defaults() {
        let body = DownloadBody {
            url: Some(" https://youtu.be/abc ".into()),
            ..Default::default()
        };
        let validated = validate(Ok(Json(body)), None).unwrap();
        assert_eq!(validated.request.url, "https://youtu.be/abc");
        assert_eq!(validated.request.format, MediaFormat::Video);
        assert_eq!(validated.request.quality, "best");
        assert_eq!(validated.request.client_id, "unknown");
        assert!(validated.cookies.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let missing = validate(Ok(Json(DownloadBody::default())), None);
        assert!(matches!(missing, Err(ApiError::Validation { ref field, .. }) if field == "url"));

        let ftp = DownloadBody {
            url: Some("ftp://example.com/a.mp3".into()),
            ..Default::default()
        };
        assert!(validate(Ok(Json(ftp)), None).is_err());

        let format = DownloadBody {
            url: Some("https://vimeo.com/1".into()),
            format: Some("gif".into()),
            ..Default::default()
        };
        assert!(matches!(
            validate(Ok(Json(format)), None),
            Err(ApiError::Validation { ref field, .. }) if field == "format"
        ));
    }
}
