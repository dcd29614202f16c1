// Service configuration: defaults, then an optional TOML file, then the
// environment. CLI flags are applied on top in `main`.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::downloader::errors::TierSpecError;
use crate::downloader::extractors::{build_strategy, TierDeps, TierKind, TierSpec};
use crate::downloader::models::NetworkConfig;
use crate::downloader::orchestrator::{ChainRegistry, DegradedPolicy, FallbackChain};
use crate::downloader::platform::Platform;
use crate::downloader::process::CommandRunner;
use crate::downloader::tools::ToolCommand;
use crate::downloader::utils::{build_http_client, proxy_with_credentials};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: '{value}'")]
    InvalidEnv { key: String, value: String },

    #[error("platform '{0}' has no tiers")]
    EmptyChain(Platform),

    #[error(transparent)]
    Tier(#[from] TierSpecError),
}

/// Egress proxy settings, as configured
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub url: Option<String>,
    /// Used for youtube and youtube-music instead of `url` when set
    pub youtube_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Tier list and degraded behaviour for one platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub platform: Platform,
    pub tiers: Vec<TierSpec>,
    /// When set, exhausting every tier returns a text artifact with this note
    #[serde(default)]
    pub degraded_note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub storage_dir: PathBuf,
    /// Public prefix for download links ("https://api.example.com"); links are
    /// relative when unset
    pub public_url: Option<String>,
    pub cleanup_delay_secs: u64,
    pub rate_limit: u32,
    pub rate_limit_window_secs: u64,
    /// Wall-clock budget for one tier, including any download it performs
    pub tier_timeout_secs: u64,
    pub socket_timeout_secs: u32,
    pub ytdlp_binary: String,
    pub ytdlp_python: String,
    pub proxy: ProxySettings,
    /// Empty means the built-in chains
    pub platforms: Vec<PlatformConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            storage_dir: default_storage_dir(),
            public_url: None,
            cleanup_delay_secs: 3600,
            rate_limit: 100,
            rate_limit_window_secs: 3600,
            tier_timeout_secs: 300,
            socket_timeout_secs: 30,
            ytdlp_binary: "yt-dlp".to_string(),
            ytdlp_python: "python3".to_string(),
            proxy: ProxySettings::default(),
            platforms: Vec::new(),
        }
    }
}

fn default_storage_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("detach")
        .join("downloads")
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

impl Config {
    /// Defaults, then `path` if given, then the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("LISTEN_ADDR") {
            self.listen_addr = parse_env("LISTEN_ADDR", &v)?;
        }
        if let Some(v) = get("PORT") {
            self.listen_addr.set_port(parse_env("PORT", &v)?);
        }
        if let Some(v) = get("STORAGE_DIR") {
            self.storage_dir = PathBuf::from(v);
        }
        if let Some(v) = get("PUBLIC_URL") {
            self.public_url = Some(v);
        }
        if let Some(v) = get("CLEANUP_DELAY_SECS") {
            self.cleanup_delay_secs = parse_env("CLEANUP_DELAY_SECS", &v)?;
        }
        if let Some(v) = get("RATE_LIMIT") {
            self.rate_limit = parse_env("RATE_LIMIT", &v)?;
        }
        if let Some(v) = get("RATE_LIMIT_WINDOW_SECS") {
            self.rate_limit_window_secs = parse_env("RATE_LIMIT_WINDOW_SECS", &v)?;
        }
        if let Some(v) = get("TIER_TIMEOUT_SECS") {
            self.tier_timeout_secs = parse_env("TIER_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("YTDLP_PATH") {
            self.ytdlp_binary = v;
        }
        if let Some(v) = get("YTDLP_PYTHON") {
            self.ytdlp_python = v;
        }
        if let Some(v) = get("PROXY_URL") {
            self.proxy.url = Some(v);
        }
        if let Some(v) = get("YOUTUBE_PROXY_URL") {
            self.proxy.youtube_url = Some(v);
        }
        if let Some(v) = get("PROXY_USERNAME") {
            self.proxy.username = Some(v);
        }
        if let Some(v) = get("PROXY_PASSWORD") {
            self.proxy.password = Some(v);
        }
        Ok(())
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_secs(self.cleanup_delay_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn tier_timeout(&self) -> Duration {
        Duration::from_secs(self.tier_timeout_secs)
    }

    /// Egress settings for a platform, credentials injected
    pub fn network_for(&self, platform: Platform) -> NetworkConfig {
        let youtube = matches!(platform, Platform::Youtube | Platform::YoutubeMusic);
        let url = if youtube {
            self.proxy.youtube_url.as_ref().or(self.proxy.url.as_ref())
        } else {
            self.proxy.url.as_ref()
        };

        NetworkConfig {
            proxy: url.map(|u| {
                proxy_with_credentials(u, self.proxy.username.as_deref(), self.proxy.password.as_deref())
            }),
            timeout: Some(self.socket_timeout_secs),
        }
    }

    /// Egress settings for fetching media links, which may point anywhere
    pub fn fetch_network(&self) -> NetworkConfig {
        self.network_for(Platform::Unsupported)
    }

    /// Configured chains, or the built-in ones when none are configured
    pub fn platform_configs(&self) -> Vec<PlatformConfig> {
        if self.platforms.is_empty() {
            default_platforms(&self.ytdlp_binary, &self.ytdlp_python)
        } else {
            self.platforms.clone()
        }
    }

    /// Distinct tool commands across all chains
    pub fn tool_commands(&self) -> Vec<ToolCommand> {
        let mut tools: Vec<ToolCommand> = Vec::new();
        for spec in self.platform_configs().iter().flat_map(|p| p.tiers.iter()) {
            if spec.kind != TierKind::Tool {
                continue;
            }
            let Some(program) = spec.program.clone() else {
                continue;
            };
            let tool = ToolCommand {
                name: spec.label(),
                program,
                prefix_args: spec.args.clone(),
            };
            if !tools.contains(&tool) {
                tools.push(tool);
            }
        }
        tools
    }

    /// Build one fallback chain per configured platform
    pub fn build_registry(&self, runner: Arc<dyn CommandRunner>) -> Result<ChainRegistry, ConfigError> {
        let tier_timeout = self.tier_timeout();
        let mut registry = ChainRegistry::new();

        for platform_config in self.platform_configs() {
            let platform = platform_config.platform;
            if platform_config.tiers.is_empty() {
                return Err(ConfigError::EmptyChain(platform));
            }

            let network = self.network_for(platform);
            let deps = TierDeps {
                client: build_http_client(&network, tier_timeout),
                network,
                runner: runner.clone(),
                timeout: tier_timeout,
            };

            let mut chain = FallbackChain::new(platform, tier_timeout);
            for spec in &platform_config.tiers {
                chain = chain.with_tier(build_strategy(spec, &deps)?);
            }
            if let Some(note) = platform_config.degraded_note {
                chain = chain.with_degraded(DegradedPolicy { note });
            }
            registry.insert(chain);
        }

        Ok(registry)
    }
}

/// Built-in chains: the Python module first for YouTube (fewer bot checks),
/// the binary first elsewhere. Social platforms degrade to a link artifact.
fn default_platforms(binary: &str, python: &str) -> Vec<PlatformConfig> {
    let bin = || TierSpec::tool(binary, &[]).named("yt-dlp");
    let py = || TierSpec::tool(python, &["-m", "yt_dlp"]).named("yt-dlp (python)");

    let chain = |platform: Platform, tiers: Vec<TierSpec>, note: Option<&str>| PlatformConfig {
        platform,
        tiers,
        degraded_note: note.map(str::to_string),
    };

    vec![
        chain(Platform::YoutubeMusic, vec![py(), bin()], None),
        chain(Platform::Youtube, vec![py(), bin()], None),
        chain(
            Platform::Tiktok,
            vec![bin(), py()],
            Some("TikTok blocked automated download of this video; the link was saved instead."),
        ),
        chain(
            Platform::Instagram,
            vec![bin(), py()],
            Some("Instagram requires login for this post; the link was saved instead."),
        ),
        chain(
            Platform::Facebook,
            vec![bin(), py()],
            Some("Facebook content could not be downloaded; the link was saved instead."),
        ),
        chain(
            Platform::Twitter,
            vec![bin(), py()],
            Some("This post has no downloadable media or is protected; the link was saved instead."),
        ),
        chain(
            Platform::Linkedin,
            vec![bin(), py()],
            Some("LinkedIn content requires login; the link was saved instead."),
        ),
        chain(
            Platform::Pinterest,
            vec![bin(), py()],
            Some("Pinterest media could not be downloaded; the link was saved instead."),
        ),
        chain(
            Platform::Spotify,
            vec![bin()],
            Some("Spotify audio is DRM protected; the link was saved instead."),
        ),
        chain(Platform::Soundcloud, vec![bin(), py()], None),
        chain(Platform::Vimeo, vec![bin(), py()], None),
        chain(Platform::Podcast, vec![bin(), py()], None),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::process::TokioProcessRunner;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listen_addr.port(), 3000);
        assert_eq!(config.rate_limit, 100);
        assert_eq!(config.cleanup_delay(), Duration::from_secs(3600));
        assert!(config.storage_dir.ends_with("detach/downloads"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("PORT", "8080"),
                ("STORAGE_DIR", "/srv/downloads"),
                ("RATE_LIMIT", "5"),
                ("PROXY_URL", "http://proxy:3128"),
                ("PROXY_USERNAME", "bob"),
                ("PROXY_PASSWORD", "pw"),
                ("YOUTUBE_PROXY_URL", "socks5://yt-proxy:1080"),
            ]))
            .unwrap();

        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.storage_dir, PathBuf::from("/srv/downloads"));
        assert_eq!(config.rate_limit, 5);
        assert_eq!(
            config.network_for(Platform::Tiktok).proxy.as_deref(),
            Some("http://bob:pw@proxy:3128")
        );
        assert_eq!(
            config.network_for(Platform::YoutubeMusic).proxy.as_deref(),
            Some("socks5://bob:pw@yt-proxy:1080")
        );
    }

    #[test]
    fn test_invalid_env_is_rejected() {
        let mut config = Config::default();
        let err = config.apply_env(env(&[("RATE_LIMIT", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { ref key, .. } if key == "RATE_LIMIT"));
    }

    #[test]
    fn test_toml_platforms() {
        let config: Config = toml::from_str(
            r#"
            listen_addr = "127.0.0.1:4000"
            cleanup_delay_secs = 60

            [[platforms]]
            platform = "tiktok"
            degraded_note = "saved link"

            [[platforms.tiers]]
            kind = "tool"
            program = "yt-dlp"

            [[platforms.tiers]]
            kind = "relay"
            name = "relay:peer"
            endpoint = "https://peer.example/api/download"
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_addr.port(), 4000);
        assert_eq!(config.rate_limit, 100);
        assert_eq!(config.platforms.len(), 1);
        assert_eq!(config.platforms[0].tiers[1].kind, TierKind::Relay);

        let registry = config.build_registry(Arc::new(TokioProcessRunner)).unwrap();
        let chain = registry.get(Platform::Tiktok).unwrap();
        assert_eq!(chain.sources(), vec!["yt-dlp", "relay:peer"]);
        assert!(chain.degraded().is_some());
        assert!(registry.get(Platform::Youtube).is_none());
    }

    #[test]
    fn test_default_registry_covers_every_platform() {
        let registry = Config::default()
            .build_registry(Arc::new(TokioProcessRunner))
            .unwrap();
        for platform in Platform::supported() {
            assert!(registry.get(*platform).is_some(), "{}", platform);
        }
        assert_eq!(
            registry.get(Platform::Youtube).unwrap().sources(),
            vec!["yt-dlp (python)", "yt-dlp"]
        );
    }

    #[test]
    fn test_tool_commands_are_deduplicated() {
        let tools = Config::default().tool_commands();
        assert_eq!(tools.len(), 2);
        assert!(tools.iter().any(|t| t.program == "python3" && t.prefix_args == ["-m", "yt_dlp"]));
    }

    #[test]
    fn test_empty_chain_rejected() {
        let mut config = Config::default();
        config.platforms = vec![PlatformConfig {
            platform: Platform::Vimeo,
            tiers: Vec::new(),
            degraded_note: None,
        }];
        assert!(matches!(
            config.build_registry(Arc::new(TokioProcessRunner)),
            Err(ConfigError::EmptyChain(Platform::Vimeo))
        ));
    }
}
