// Helper functions shared by extraction tiers

use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::downloader::models::NetworkConfig;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:132.0) Gecko/20100101 Firefox/132.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:132.0) Gecko/20100101 Firefox/132.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1.1 Safari/605.1.15",
];

const ACCEPT_LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-US,en;q=0.8,es;q=0.7",
    "en-GB,en;q=0.9",
    "en-US,en;q=0.5",
    "en-US,en;q=0.9,fr;q=0.8",
];

const ACCEPT_ENCODINGS: &[&str] = &[
    "gzip, deflate, br",
    "gzip, deflate",
    "gzip, deflate, br, zstd",
    "br, gzip, deflate",
];

const SEC_CH_UA: &[&str] = &[
    r#""Google Chrome";v="131", "Chromium";v="131", "Not_A Brand";v="24""#,
    r#""Google Chrome";v="130", "Chromium";v="130", "Not_A Brand";v="99""#,
    r#""Chromium";v="131", "Microsoft Edge";v="131", "Not_A Brand";v="24""#,
    r#""Firefox";v="132", "Not_A Brand";v="24""#,
];

const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";

/// Randomized browser fingerprint, drawn fresh for every upstream call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserProfile {
    pub user_agent: &'static str,
    pub accept_language: &'static str,
    pub accept_encoding: &'static str,
    pub sec_ch_ua: &'static str,
    pub dnt: &'static str,
    pub cache_control: &'static str,
}

impl BrowserProfile {
    pub fn random() -> Self {
        Self::random_with(&mut rand::thread_rng())
    }

    pub fn random_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        // Every pool is non-empty so `choose` cannot return None
        let pick = |pool: &'static [&'static str], rng: &mut R| -> &'static str {
            pool.choose(rng).copied().unwrap_or(pool[0])
        };

        Self {
            user_agent: pick(USER_AGENTS, rng),
            accept_language: pick(ACCEPT_LANGUAGES, rng),
            accept_encoding: pick(ACCEPT_ENCODINGS, rng),
            sec_ch_ua: pick(SEC_CH_UA, rng),
            dnt: if rng.gen_bool(0.5) { "1" } else { "0" },
            cache_control: if rng.gen_bool(0.3) { "max-age=0" } else { "no-cache" },
        }
    }

    fn header_pairs(&self) -> Vec<(&'static str, &'static str)> {
        vec![
            ("Accept", ACCEPT),
            ("Accept-Language", self.accept_language),
            ("Accept-Encoding", self.accept_encoding),
            ("Sec-Ch-Ua", self.sec_ch_ua),
            ("Sec-Ch-Ua-Mobile", "?0"),
            ("Sec-Fetch-Dest", "document"),
            ("Sec-Fetch-Mode", "navigate"),
            ("Sec-Fetch-Site", "none"),
            ("Cache-Control", self.cache_control),
            ("DNT", self.dnt),
        ]
    }

    /// `--user-agent` and `--add-header` arguments for yt-dlp style tools
    pub fn tool_args(&self) -> Vec<String> {
        let mut args = vec!["--user-agent".to_string(), self.user_agent.to_string()];
        for (name, value) in self.header_pairs() {
            args.push("--add-header".to_string());
            args.push(format!("{}:{}", name, value));
        }
        args
    }

    /// The same fingerprint as HTTP request headers. Accept-Encoding is left to
    /// reqwest so responses are always decodable.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(ua) = HeaderValue::from_str(self.user_agent) {
            headers.insert(reqwest::header::USER_AGENT, ua);
        }
        for (name, value) in self.header_pairs() {
            if name == "Accept-Encoding" {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        headers
    }
}

/// Inject `user:password@` into a proxy URL that carries no credentials yet
pub fn proxy_with_credentials(
    proxy_url: &str,
    username: Option<&str>,
    password: Option<&str>,
) -> String {
    match (username, password) {
        (Some(user), Some(pass)) if !user.is_empty() => match proxy_url.split_once("://") {
            Some((scheme, rest)) if !rest.contains('@') => {
                format!("{}://{}:{}@{}", scheme, user, pass, rest)
            }
            _ => proxy_url.to_string(),
        },
        _ => proxy_url.to_string(),
    }
}

/// Proxy URL with its userinfo masked, for logs
pub fn redact_proxy(proxy_url: &str) -> String {
    let Ok(mut url) = reqwest::Url::parse(proxy_url) else {
        return "<unparseable proxy url>".to_string();
    };
    if !url.username().is_empty() || url.password().is_some() {
        // Only fails for URLs that cannot carry credentials at all
        let _ = url.set_password(None);
        let _ = url.set_username("***");
    }
    url.to_string()
}

/// Build proxy arguments for yt-dlp
pub fn get_proxy_args(config: &NetworkConfig) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(proxy) = &config.proxy {
        args.push("--proxy".to_string());
        args.push(proxy.clone());
    }

    args
}

/// Build timeout arguments for yt-dlp
pub fn get_timeout_args(config: &NetworkConfig) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(timeout) = config.timeout {
        args.push("--socket-timeout".to_string());
        args.push(timeout.to_string());
    }

    args
}

/// reqwest client honouring the egress proxy. An unusable proxy URL is logged
/// and the client falls back to a direct connection.
pub fn build_http_client(config: &NetworkConfig, request_timeout: Duration) -> reqwest::Client {
    let mut builder = reqwest::Client::builder().timeout(request_timeout);

    if let Some(proxy_url) = config.proxy.as_deref() {
        match reqwest::Proxy::all(proxy_url) {
            Ok(proxy) => builder = builder.proxy(proxy),
            Err(e) => warn!(proxy = %redact_proxy(proxy_url), error = %e, "invalid proxy URL, using direct connection"),
        }
    }

    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "failed to build HTTP client, using defaults");
        reqwest::Client::new()
    })
}

/// Client-supplied Netscape cookies, written to a private file for the
/// lifetime of one request and removed on drop
#[derive(Debug)]
pub struct CookieFile {
    path: PathBuf,
}

impl CookieFile {
    pub fn write(dir: &Path, contents: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let nonce: u64 = rand::thread_rng().gen();
        let path = dir.join(format!("cookies_{:016x}.txt", nonce));
        std::fs::write(&path, contents)?;
        debug!(path = %path.display(), "wrote request cookie file");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CookieFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove cookie file");
            }
        }
    }
}
