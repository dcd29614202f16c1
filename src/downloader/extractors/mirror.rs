// Mirror tier - scrapes a third-party downloader page for a direct media link
//
// The whole request/parse cycle is one opaque step: whatever the page does
// internally, we only see the HTTP status and the body.

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use tracing::debug;

use super::traits::{ExtractionStrategy, MirrorMethod};
use crate::downloader::errors::{ExtractionError, ExtractionErrorKind};
use crate::downloader::models::{
    AcquisitionRequest, AttemptContext, ByteSource, ContentKind, ExtractionResult,
};
use crate::downloader::utils::BrowserProfile;

/// Map an upstream HTTP status to a failure kind
pub(crate) fn status_kind(status: StatusCode) -> ExtractionErrorKind {
    ExtractionErrorKind::from_http_status(status.as_u16())
}

/// Map a transport error to a failure kind
pub(crate) fn request_error(source: &str, err: reqwest::Error) -> ExtractionError {
    if err.is_timeout() {
        ExtractionError::timeout(format!("{} timed out: {}", source, err))
    } else {
        ExtractionError::process(format!("{} request failed: {}", source, err))
    }
}

/// Resolve a possibly relative link against the page it came from
pub(crate) fn resolve_link(base: &str, link: &str) -> Option<String> {
    let base = reqwest::Url::parse(base).ok()?;
    let url = base.join(link).ok()?;
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

/// Extension of the last path segment when it names a known media type
pub(crate) fn media_extension(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.last()?;
    let (_, ext) = segment.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    ContentKind::from_extension(&ext)
        .filter(|kind| *kind != ContentKind::Text)
        .map(|_| ext)
}

pub struct MirrorScraper {
    label: String,
    endpoint: String,
    method: MirrorMethod,
    url_field: String,
    media_pattern: Regex,
    title_pattern: Option<Regex>,
    client: reqwest::Client,
}

impl MirrorScraper {
    pub fn new(
        label: impl Into<String>,
        endpoint: impl Into<String>,
        method: MirrorMethod,
        url_field: impl Into<String>,
        media_pattern: Regex,
        title_pattern: Option<Regex>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            label: label.into(),
            endpoint: endpoint.into(),
            method,
            url_field: url_field.into(),
            media_pattern,
            title_pattern,
            client,
        }
    }

    fn first_capture(re: &Regex, body: &str) -> Option<String> {
        let caps = re.captures(body)?;
        caps.get(1)
            .or_else(|| caps.get(0))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Undo the escaping pages commonly apply to embedded links
    fn unescape(link: &str) -> String {
        link.replace("\\/", "/").replace("&amp;", "&")
    }

    async fn fetch_page(&self, url: &str) -> Result<String, ExtractionError> {
        let params = [(self.url_field.as_str(), url)];
        let builder = match self.method {
            MirrorMethod::Get => self.client.get(&self.endpoint).query(&params),
            MirrorMethod::Form => self.client.post(&self.endpoint).form(&params),
        };

        let response = builder
            .headers(BrowserProfile::random().headers())
            .send()
            .await
            .map_err(|e| request_error(&self.label, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractionError::new(
                status_kind(status),
                format!("{} answered HTTP {}", self.label, status.as_u16()),
            ));
        }

        response.text().await.map_err(|e| request_error(&self.label, e))
    }
}

#[async_trait]
impl ExtractionStrategy for MirrorScraper {
    fn source(&self) -> &str {
        &self.label
    }

    async fn attempt(
        &self,
        request: &AcquisitionRequest,
        _ctx: &AttemptContext,
    ) -> Result<ExtractionResult, ExtractionError> {
        let body = self.fetch_page(&request.url).await?;

        let link = Self::first_capture(&self.media_pattern, &body)
            .map(|l| Self::unescape(&l))
            .ok_or_else(|| ExtractionError::empty(format!("{} page had no media link", self.label)))?;
        let media_url = resolve_link(&self.endpoint, &link).ok_or_else(|| {
            ExtractionError::empty(format!("{} returned an unusable link: {}", self.label, link))
        })?;

        debug!(mirror = %self.label, media_url = %media_url, "found media link");

        let title = self
            .title_pattern
            .as_ref()
            .and_then(|re| Self::first_capture(re, &body))
            .unwrap_or_else(|| "download".to_string());

        let declared_ext = media_extension(&media_url);
        let content_type = ContentKind::resolve(declared_ext.as_deref(), request.format);

        Ok(ExtractionResult {
            title,
            duration: None,
            uploader: None,
            content_type,
            source: ByteSource::Remote(media_url),
            declared_ext,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::models::MediaFormat;
    use axum::extract::Form;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::Router;
    use std::collections::HashMap;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn ctx() -> AttemptContext {
        AttemptContext {
            work_dir: std::env::temp_dir(),
            cookies_file: None,
        }
    }

    fn scraper(endpoint: String, method: MirrorMethod) -> MirrorScraper {
        MirrorScraper::new(
            "mirror:test",
            endpoint,
            method,
            "url",
            Regex::new(r#"data-src="([^"]+)""#).unwrap(),
            Some(Regex::new(r"<h1>([^<]+)</h1>").unwrap()),
            reqwest::Client::new(),
        )
    }

    #[tokio::test]
    async fn test_form_post_extracts_link_and_title() {
        let app = Router::new().route(
            "/convert",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                assert_eq!(form.get("url").map(String::as_str), Some("https://www.tiktok.com/@a/video/1"));
                r#"<h1>Dance Clip</h1><a data-src="/files/clip.mp4?sig=1&amp;x=2">dl</a>"#
            }),
        );
        let base = serve(app).await;
        let mirror = scraper(format!("{}/convert", base), MirrorMethod::Form);

        let result = mirror
            .attempt(
                &AcquisitionRequest::new("https://www.tiktok.com/@a/video/1", MediaFormat::Video),
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(result.title, "Dance Clip");
        assert_eq!(result.declared_ext.as_deref(), Some("mp4"));
        assert_eq!(result.content_type, ContentKind::Video);
        assert_eq!(
            result.source,
            ByteSource::Remote(format!("{}/files/clip.mp4?sig=1&x=2", base))
        );
    }

    #[tokio::test]
    async fn test_status_codes_map_to_kinds() {
        let app = Router::new()
            .route("/forbidden", get(|| async { AxumStatus::FORBIDDEN }))
            .route("/gone", get(|| async { AxumStatus::GONE }))
            .route("/busy", get(|| async { AxumStatus::TOO_MANY_REQUESTS }))
            .route("/broken", get(|| async { AxumStatus::BAD_GATEWAY }));
        let base = serve(app).await;

        let cases = [
            ("forbidden", ExtractionErrorKind::AuthRequired),
            ("gone", ExtractionErrorKind::NotFound),
            ("busy", ExtractionErrorKind::RateLimited),
            ("broken", ExtractionErrorKind::ProcessFailure),
        ];
        for (path, kind) in cases {
            let err = scraper(format!("{}/{}", base, path), MirrorMethod::Get)
                .attempt(&AcquisitionRequest::new("https://x.com/a/status/1", MediaFormat::Video), &ctx())
                .await
                .unwrap_err();
            assert_eq!(err.kind, kind, "path {}", path);
        }
    }

    #[tokio::test]
    async fn test_page_without_link_is_empty_result() {
        let app = Router::new().route("/", get(|| async { "<html>nothing here</html>" }));
        let base = serve(app).await;
        let err = scraper(format!("{}/", base), MirrorMethod::Get)
            .attempt(&AcquisitionRequest::new("https://vimeo.com/1", MediaFormat::Video), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ExtractionErrorKind::EmptyResult);
    }

    #[test]
    fn test_media_extension() {
        assert_eq!(media_extension("https://cdn.example/v/clip.MP4?x=1").as_deref(), Some("mp4"));
        assert_eq!(media_extension("https://cdn.example/v/download.php"), None);
        assert_eq!(media_extension("https://cdn.example/v/stream"), None);
    }

    #[test]
    fn test_resolve_link_rejects_other_schemes() {
        assert_eq!(resolve_link("https://m.example/a/b", "javascript:void(0)"), None);
        assert_eq!(
            resolve_link("https://m.example/a/b", "/c.mp3").as_deref(),
            Some("https://m.example/c.mp3")
        );
    }
}
