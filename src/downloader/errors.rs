// Error types for extraction tiers, the fallback chain and file materialization

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use super::models::ExtractionAttempt;
use super::platform::Platform;

/// Why a single tier failed. Recorded per attempt, only surfaced in aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtractionErrorKind {
    /// Tier exceeded its wall-clock budget
    Timeout,

    /// Tool could not be started, exited non-zero, or the upstream answered
    /// with something we do not understand
    ProcessFailure,

    /// Login, cookies, age gate or membership required
    AuthRequired,

    /// Content deleted, private to others, or URL not recognised by the tier
    NotFound,

    /// Upstream throttling or bot detection
    RateLimited,

    /// The tier finished but produced nothing usable
    EmptyResult,
}

impl ExtractionErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "Timeout",
            Self::ProcessFailure => "ProcessFailure",
            Self::AuthRequired => "AuthRequired",
            Self::NotFound => "NotFound",
            Self::RateLimited => "RateLimited",
            Self::EmptyResult => "EmptyResult",
        }
    }

    /// Kind for a non-success HTTP status from an upstream service
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::AuthRequired,
            404 | 410 => Self::NotFound,
            429 => Self::RateLimited,
            _ => Self::ProcessFailure,
        }
    }
}

impl fmt::Display for ExtractionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure of one extraction tier
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ExtractionError {
    pub kind: ExtractionErrorKind,
    pub message: String,
}

impl ExtractionError {
    pub fn new(kind: ExtractionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ExtractionErrorKind::Timeout, message)
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::new(ExtractionErrorKind::ProcessFailure, message)
    }

    pub fn empty(message: impl Into<String>) -> Self {
        Self::new(ExtractionErrorKind::EmptyResult, message)
    }
}

/// Every configured tier failed and the platform has no degraded fallback
#[derive(Debug, Clone, Error)]
#[error("all {} tiers failed for {platform}", attempts.len())]
pub struct ChainExhausted {
    pub platform: Platform,
    pub attempts: Vec<ExtractionAttempt>,
}

/// A configured tier cannot be built
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid tier '{label}': {reason}")]
pub struct TierSpecError {
    pub label: String,
    pub reason: String,
}

/// Turning an extraction result into a stored file failed. Fetch failures
/// count against the tier that produced the link; the rest are fatal.
#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to rename {from} to {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to fetch {url}: {message}")]
    Fetch {
        url: String,
        kind: ExtractionErrorKind,
        message: String,
    },
}

impl MaterializeError {
    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }

    /// The tier-level failure behind a fetch error; `None` for local I/O
    pub fn as_tier_error(&self) -> Option<ExtractionError> {
        match self {
            Self::Fetch { kind, message, .. } => Some(ExtractionError::new(*kind, message.clone())),
            Self::Write { .. } | Self::Rename { .. } => None,
        }
    }
}

/// Why a chain run produced no file
#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Exhausted(#[from] ChainExhausted),

    /// Storage itself failed; later tiers would fail the same way
    #[error("{source}")]
    FileSystem {
        #[source]
        source: MaterializeError,
        attempts: Vec<ExtractionAttempt>,
    },
}
