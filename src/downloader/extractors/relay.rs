// Relay tier - asks another deployment of a compatible backend to do the work
//
// The remote answers with JSON; a successful answer carries a link we fetch
// like any other remote media URL.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::diagnostics::classify_stderr;
use super::mirror::{media_extension, request_error, resolve_link, status_kind};
use super::traits::ExtractionStrategy;
use crate::downloader::errors::ExtractionError;
use crate::downloader::models::{
    AcquisitionRequest, AttemptContext, ByteSource, ContentKind, ExtractionResult, MediaFormat,
};

#[derive(Debug, Serialize)]
struct RelayRequest<'a> {
    url: &'a str,
    format: MediaFormat,
    quality: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, alias = "download_url", alias = "url")]
    download_url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    content_type: Option<ContentKind>,
    #[serde(default)]
    error: Option<String>,
}

pub struct RelayBackend {
    label: String,
    endpoint: String,
    client: reqwest::Client,
}

impl RelayBackend {
    pub fn new(label: impl Into<String>, endpoint: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            label: label.into(),
            endpoint: endpoint.into(),
            client,
        }
    }
}

#[async_trait]
impl ExtractionStrategy for RelayBackend {
    fn source(&self) -> &str {
        &self.label
    }

    async fn attempt(
        &self,
        request: &AcquisitionRequest,
        _ctx: &AttemptContext,
    ) -> Result<ExtractionResult, ExtractionError> {
        let body = RelayRequest {
            url: &request.url,
            format: request.format,
            quality: &request.quality,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error(&self.label, e))?;

        let status = response.status();
        // A compatible backend reports tier exhaustion as a 500 with a JSON body
        let parsed: Option<RelayResponse> = response.json().await.ok();

        let reply = match parsed {
            Some(reply) if status.is_success() && reply.success => reply,
            Some(reply) => {
                let message = reply
                    .error
                    .unwrap_or_else(|| format!("{} answered HTTP {}", self.label, status.as_u16()));
                let kind = if status.is_success() || status.is_server_error() {
                    classify_stderr(&message)
                } else {
                    status_kind(status)
                };
                return Err(ExtractionError::new(kind, format!("{}: {}", self.label, message)));
            }
            None if !status.is_success() => {
                return Err(ExtractionError::new(
                    status_kind(status),
                    format!("{} answered HTTP {}", self.label, status.as_u16()),
                ));
            }
            None => {
                return Err(ExtractionError::empty(format!(
                    "{} returned a body that is not JSON",
                    self.label
                )))
            }
        };

        let link = reply
            .download_url
            .filter(|l| !l.trim().is_empty())
            .ok_or_else(|| ExtractionError::empty(format!("{} reported success without a link", self.label)))?;
        let media_url = resolve_link(&self.endpoint, &link)
            .ok_or_else(|| ExtractionError::empty(format!("{} returned an unusable link: {}", self.label, link)))?;

        debug!(relay = %self.label, media_url = %media_url, "relay produced a link");

        let declared_ext = media_extension(&media_url);
        let content_type = reply
            .content_type
            .unwrap_or_else(|| ContentKind::resolve(declared_ext.as_deref(), request.format));

        Ok(ExtractionResult {
            title: reply.title.unwrap_or_else(|| "download".to_string()),
            duration: reply.duration,
            uploader: reply.uploader,
            content_type,
            source: ByteSource::Remote(media_url),
            declared_ext,
        })
    }
}
