use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::downloader::errors::{ChainError, ChainExhausted, MaterializeError};
use crate::downloader::models::ExtractionAttempt;
use crate::downloader::platform::Platform;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Validation { field: String, message: String },

    #[error("unsupported platform for url: {url}")]
    UnsupportedPlatform { url: String },

    #[error("unknown platform route: {0}")]
    UnknownRoute(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("rate limit exceeded, retry in {retry_after}s")]
    RateLimitExceeded { retry_after: u64 },

    #[error(transparent)]
    ChainExhausted(#[from] ChainExhausted),

    #[error("{source}")]
    FileSystem {
        #[source]
        source: MaterializeError,
        diagnostics: Vec<ExtractionAttempt>,
    },

    #[error("{0}")]
    Internal(String),
}

/// Body of every failed request
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub success: bool,
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supported_platforms: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    pub diagnostics: Vec<ExtractionAttempt>,
}

impl ApiError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation { .. } => StatusCode::BAD_REQUEST,
            ApiError::UnsupportedPlatform { .. } => StatusCode::BAD_REQUEST,
            ApiError::UnknownRoute(_) => StatusCode::NOT_FOUND,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ChainExhausted(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::FileSystem { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::Validation { .. } => "validation_error",
            ApiError::UnsupportedPlatform { .. } => "unsupported_platform",
            ApiError::UnknownRoute(_) => "unknown_route",
            ApiError::NotFound(_) => "not_found",
            ApiError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            ApiError::ChainExhausted(_) => "chain_exhausted",
            ApiError::FileSystem { .. } => "file_system_error",
            ApiError::Internal(_) => "internal_error",
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let mut body = ErrorBody {
            success: false,
            error: self.error_type(),
            message: self.to_string(),
            field: None,
            platform: None,
            supported_platforms: None,
            retry_after: None,
            diagnostics: Vec::new(),
        };

        match self {
            ApiError::Validation { field, .. } => body.field = Some(field.clone()),
            ApiError::UnsupportedPlatform { .. } | ApiError::UnknownRoute(_) => {
                body.supported_platforms =
                    Some(Platform::supported().iter().map(Platform::as_str).collect());
            }
            ApiError::RateLimitExceeded { retry_after } => body.retry_after = Some(*retry_after),
            ApiError::ChainExhausted(exhausted) => {
                body.platform = Some(exhausted.platform.to_string());
                body.diagnostics = exhausted.attempts.clone();
            }
            ApiError::FileSystem { diagnostics, .. } => body.diagnostics = diagnostics.clone(),
            ApiError::NotFound(_) | ApiError::Internal(_) => {}
        }

        body
    }
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Exhausted(exhausted) => Self::ChainExhausted(exhausted),
            ChainError::FileSystem { source, attempts } => Self::FileSystem {
                source,
                diagnostics: attempts,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = (status, Json(self.to_body())).into_response();

        if let ApiError::RateLimitExceeded { retry_after } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }

        response
    }
}
