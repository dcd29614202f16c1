// Failure diagnostics - turns tool stderr into a typed failure kind
//
// Patterns are checked in order of specificity: auth walls before generic
// 403s, throttling before bot detection, network trouble last.

use serde::{Deserialize, Serialize};

use crate::downloader::errors::{ExtractionError, ExtractionErrorKind};

/// Why an upstream refused or failed a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockingReason {
    /// DRM, purchase or premium-only content. Permanent.
    DrmProtected,

    /// Channel membership required
    MembersOnly,

    /// Login needed to confirm age
    AgeRestricted,

    /// Private post or video
    PrivateContent,

    /// Cookies or login required for any other reason
    LoginRequired,

    /// Deleted, removed or never existed
    Unavailable,

    /// Geographic restriction
    GeoBlocked,

    /// 429 or explicit throttling
    RateLimited,

    /// Captcha, unusual traffic, "confirm you're not a bot"
    BotDetection,

    /// HTTP 403 without a more specific cause
    Forbidden,

    /// Tool does not know how to handle this URL
    UnsupportedUrl,

    /// Socket timeout or unreachable network
    NetworkTimeout,

    Unknown,
}

impl BlockingReason {
    /// Failure kind recorded in the attempt diagnostics
    pub fn error_kind(&self) -> ExtractionErrorKind {
        match self {
            Self::DrmProtected
            | Self::MembersOnly
            | Self::AgeRestricted
            | Self::PrivateContent
            | Self::LoginRequired => ExtractionErrorKind::AuthRequired,
            Self::Unavailable | Self::GeoBlocked | Self::UnsupportedUrl => ExtractionErrorKind::NotFound,
            Self::RateLimited | Self::BotDetection | Self::Forbidden => ExtractionErrorKind::RateLimited,
            Self::NetworkTimeout => ExtractionErrorKind::Timeout,
            Self::Unknown => ExtractionErrorKind::ProcessFailure,
        }
    }

    /// Cookies supplied by the client could get past this
    pub fn cookies_might_help(&self) -> bool {
        matches!(
            self,
            Self::AgeRestricted
                | Self::PrivateContent
                | Self::LoginRequired
                | Self::MembersOnly
                | Self::BotDetection
                | Self::Forbidden
        )
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::DrmProtected => "DRM-protected content",
            Self::MembersOnly => "Members-only content",
            Self::AgeRestricted => "Age-restricted content",
            Self::PrivateContent => "Private content",
            Self::LoginRequired => "Login required",
            Self::Unavailable => "Content unavailable",
            Self::GeoBlocked => "Geographic restriction",
            Self::RateLimited => "Rate limited by upstream",
            Self::BotDetection => "Bot detection triggered",
            Self::Forbidden => "Access denied (HTTP 403)",
            Self::UnsupportedUrl => "URL not supported by tool",
            Self::NetworkTimeout => "Network timeout",
            Self::Unknown => "Unknown failure",
        }
    }
}

const DRM: &[&str] = &[
    "drm",
    "widevine",
    "playready",
    "fairplay",
    "requires purchase",
    "youtube premium",
    "this video requires payment",
];
const MEMBERS: &[&str] = &["members only", "members-only", "join this channel", "membership required"];
const AGE: &[&str] = &["age-restricted", "sign in to confirm your age", "age_verification"];
const PRIVATE: &[&str] = &[
    "private video",
    "video is private",
    "this account is private",
    "sign in if you've been granted access",
];
const LOGIN: &[&str] = &[
    "login required",
    "log in",
    "login to",
    "requires authentication",
    "use --cookies",
    "cookies-from-browser",
    "401",
    "unauthorized",
];
const UNAVAILABLE: &[&str] = &[
    "video unavailable",
    "has been removed",
    "no longer available",
    "is unavailable",
    "not found",
    "404",
    "does not exist",
    "no video formats found",
];
const GEO: &[&str] = &["not available in your country", "blocked in your country", "geo restrict", "geo-restrict"];
const THROTTLE: &[&str] = &["429", "rate limit", "rate-limit", "too many requests"];
const BOT: &[&str] = &["not a bot", "captcha", "unusual traffic", "bot detection", "automated"];
const FORBIDDEN: &[&str] = &["403", "forbidden"];
const UNSUPPORTED: &[&str] = &["unsupported url", "no suitable extractor"];
const NETWORK: &[&str] = &[
    "timed out",
    "timeout",
    "connection refused",
    "network is unreachable",
    "temporary failure in name resolution",
];

/// Ordered pattern table
const TABLE: &[(&[&str], BlockingReason)] = &[
    (DRM, BlockingReason::DrmProtected),
    (MEMBERS, BlockingReason::MembersOnly),
    (AGE, BlockingReason::AgeRestricted),
    (PRIVATE, BlockingReason::PrivateContent),
    (THROTTLE, BlockingReason::RateLimited),
    (BOT, BlockingReason::BotDetection),
    (LOGIN, BlockingReason::LoginRequired),
    (UNSUPPORTED, BlockingReason::UnsupportedUrl),
    (UNAVAILABLE, BlockingReason::Unavailable),
    (GEO, BlockingReason::GeoBlocked),
    (FORBIDDEN, BlockingReason::Forbidden),
    (NETWORK, BlockingReason::NetworkTimeout),
];

/// Analyze error output and return the blocking reason, if there is any output
pub fn diagnose_error(error: &str) -> Option<BlockingReason> {
    if error.trim().is_empty() {
        return None;
    }

    let lower = error.to_lowercase();
    let reason = TABLE
        .iter()
        .find(|(patterns, _)| patterns.iter().any(|p| lower.contains(p)))
        .map(|(_, reason)| *reason)
        .unwrap_or(BlockingReason::Unknown);

    Some(reason)
}

/// Failure kind for a tool's stderr
pub fn classify_stderr(stderr: &str) -> ExtractionErrorKind {
    diagnose_error(stderr)
        .map(|reason| reason.error_kind())
        .unwrap_or(ExtractionErrorKind::ProcessFailure)
}

/// Most useful single line of error output: first `ERROR:` line, else the last
/// non-empty one
pub fn context_line(error: &str) -> Option<String> {
    let mut lines = error.lines().map(str::trim).filter(|l| !l.is_empty());
    let first_error = error
        .lines()
        .map(str::trim)
        .find(|l| l.to_ascii_lowercase().starts_with("error:"));

    first_error
        .or_else(|| lines.next_back())
        .map(|l| l.chars().take(300).collect())
}

/// Build a typed error from a failed tool run
pub fn error_from_stderr(tool: &str, exit_code: Option<i32>, stderr: &str) -> ExtractionError {
    let kind = classify_stderr(stderr);
    let detail = context_line(stderr).unwrap_or_else(|| "no error output".to_string());
    let message = match exit_code {
        Some(code) => format!("{} exited with code {}: {}", tool, code, detail),
        None => format!("{} terminated by signal: {}", tool, detail),
    };
    ExtractionError::new(kind, message)
}
