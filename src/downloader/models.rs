// Common data models for the acquisition pipeline

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::SystemTime;

use super::errors::{ExtractionError, ExtractionErrorKind};

/// Requested media flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    Audio,
    #[default]
    Video,
}

impl FromStr for MediaFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            other => Err(format!("format must be 'audio' or 'video', got '{}'", other)),
        }
    }
}

/// One inbound acquisition call. Never persisted.
#[derive(Debug, Clone)]
pub struct AcquisitionRequest {
    pub url: String,
    pub format: MediaFormat,
    pub quality: String,
    pub client_id: String,
}

impl AcquisitionRequest {
    pub fn new(url: impl Into<String>, format: MediaFormat) -> Self {
        Self {
            url: url.into(),
            format,
            quality: "best".to_string(),
            client_id: "unknown".to_string(),
        }
    }
}

/// Per-request context handed to every tier
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// Scratch directory for this attempt only, removed when the attempt ends
    pub work_dir: PathBuf,
    /// Netscape cookie file supplied by the client, if any
    pub cookies_file: Option<PathBuf>,
}

/// Egress settings shared by tool and HTTP tiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Proxy URL with credentials already injected (http, https or socks5)
    pub proxy: Option<String>,

    /// Socket timeout in seconds
    pub timeout: Option<u32>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            timeout: Some(30),
        }
    }
}

/// What kind of artifact the client receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Audio,
    Video,
    Image,
    Text,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Image => "image",
            Self::Text => "text",
        }
    }

    /// Extension used when nothing better is known
    pub fn default_extension(&self) -> &'static str {
        match self {
            Self::Audio => "m4a",
            Self::Video => "mp4",
            Self::Image => "jpg",
            Self::Text => "txt",
        }
    }

    /// Kind implied by a MIME type's top-level type
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match essence.split('/').next() {
            Some("audio") => Some(Self::Audio),
            Some("video") => Some(Self::Video),
            Some("image") => Some(Self::Image),
            Some("text") => Some(Self::Text),
            _ => None,
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        mime_guess::from_ext(ext)
            .first()
            .and_then(|m| Self::from_mime(m.essence_str()))
    }

    /// Kind of a downloaded artifact given its extension and what was asked
    /// for. webm, mp4 and mkv also hold audio-only streams, so an audio
    /// request never turns into video because of the container.
    pub fn resolve(ext: Option<&str>, format: MediaFormat) -> Self {
        let requested = Self::from(format);
        match ext.and_then(Self::from_extension) {
            None | Some(Self::Text) => requested,
            Some(Self::Video) if requested == Self::Audio => requested,
            Some(kind) => kind,
        }
    }
}

impl From<MediaFormat> for ContentKind {
    fn from(format: MediaFormat) -> Self {
        match format {
            MediaFormat::Audio => Self::Audio,
            MediaFormat::Video => Self::Video,
        }
    }
}

/// Where the bytes of a successful extraction live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ByteSource {
    /// File already written by an external tool
    LocalFile(PathBuf),
    /// Direct media URL still to be fetched
    Remote(String),
    /// Bytes generated in-process (degraded fallback artifact)
    Inline(Vec<u8>),
}

/// Outcome of the single successful tier of a request
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub title: String,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    pub content_type: ContentKind,
    pub source: ByteSource,
    pub declared_ext: Option<String>,
}

/// Diagnostics for one invoked tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionAttempt {
    pub tier: usize,
    pub source: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExtractionErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub elapsed_ms: u64,
}

impl ExtractionAttempt {
    pub fn succeeded(tier: usize, source: &str, elapsed_ms: u64) -> Self {
        Self {
            tier,
            source: source.to_string(),
            success: true,
            error: None,
            message: None,
            elapsed_ms,
        }
    }

    pub fn failed(tier: usize, source: &str, error: &ExtractionError, elapsed_ms: u64) -> Self {
        Self {
            tier,
            source: source.to_string(),
            success: false,
            error: Some(error.kind),
            message: Some(error.message.clone()),
            elapsed_ms,
        }
    }
}

/// A file written to transient storage. Immutable once returned.
#[derive(Debug, Clone)]
pub struct ManagedFile {
    pub path: PathBuf,
    pub filename: String,
    pub content_type: ContentKind,
    pub mime: String,
    pub size: u64,
    pub created_at: SystemTime,
}
