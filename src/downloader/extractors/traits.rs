// ExtractionStrategy trait and the tier specifications that build strategies

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::downloader::errors::ExtractionError;
use crate::downloader::models::{AcquisitionRequest, AttemptContext, ExtractionResult};

/// One way of obtaining media bytes for a URL.
///
/// Implementations own their timeouts for individual upstream calls, but the
/// fallback chain also bounds every attempt and may drop the future at any
/// await point, so an attempt must not leave half-written state behind that
/// only it could clean up. Child processes are spawned with `kill_on_drop`.
#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    /// Short label recorded in diagnostics ("yt-dlp", "mirror:ssvid", ...)
    fn source(&self) -> &str;

    async fn attempt(
        &self,
        request: &AcquisitionRequest,
        ctx: &AttemptContext,
    ) -> Result<ExtractionResult, ExtractionError>;
}

/// Kind of tier, as written in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    /// External extraction tool run as a subprocess
    Tool,
    /// HTTP scrape of a third-party downloader page
    Mirror,
    /// Another deployment of a compatible backend
    Relay,
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tool => write!(f, "tool"),
            Self::Mirror => write!(f, "mirror"),
            Self::Relay => write!(f, "relay"),
        }
    }
}

/// How a mirror receives the source URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorMethod {
    /// GET with the URL as a query parameter
    #[default]
    Get,
    /// POST with the URL as an urlencoded form field
    Form,
}

/// Configuration of a single tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSpec {
    pub kind: TierKind,

    /// Label used in diagnostics; defaults to the program or endpoint host
    #[serde(default)]
    pub name: Option<String>,

    /// Tool tiers: program to run ("yt-dlp", "python3")
    #[serde(default)]
    pub program: Option<String>,

    /// Tool tiers: arguments placed before everything else (["-m", "yt_dlp"])
    #[serde(default)]
    pub args: Vec<String>,

    /// Mirror and relay tiers: endpoint URL
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub method: MirrorMethod,

    /// Mirror tiers: query parameter or form field carrying the source URL
    #[serde(default = "default_url_field")]
    pub url_field: String,

    /// Mirror tiers: regex whose first capture group (or whole match) is the
    /// media URL
    #[serde(default)]
    pub media_pattern: Option<String>,

    /// Mirror tiers: regex whose first capture group is the title
    #[serde(default)]
    pub title_pattern: Option<String>,
}

fn default_url_field() -> String {
    "url".to_string()
}

impl TierSpec {
    pub fn tool(program: &str, args: &[&str]) -> Self {
        Self {
            kind: TierKind::Tool,
            name: None,
            program: Some(program.to_string()),
            args: args.iter().map(|a| a.to_string()).collect(),
            endpoint: None,
            method: MirrorMethod::Get,
            url_field: default_url_field(),
            media_pattern: None,
            title_pattern: None,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Label recorded in diagnostics
    pub fn label(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match self.kind {
            TierKind::Tool => self.program.clone().unwrap_or_else(|| "tool".to_string()),
            TierKind::Mirror | TierKind::Relay => {
                let host = self
                    .endpoint
                    .as_deref()
                    .and_then(|e| reqwest::Url::parse(e).ok())
                    .and_then(|u| u.host_str().map(str::to_string))
                    .unwrap_or_else(|| "unknown".to_string());
                format!("{}:{}", self.kind, host)
            }
        }
    }
}
