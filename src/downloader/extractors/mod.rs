// Extraction tiers
//
// Three kinds of tier, all behind `ExtractionStrategy`:
// - Tool: yt-dlp compatible subprocess (binary or Python module)
// - Mirror: HTTP scrape of a third-party downloader page
// - Relay: JSON call to another deployment of a compatible backend

mod cli;
mod diagnostics;
mod mirror;
mod relay;
mod traits;

use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

pub use cli::ToolExtractor;
pub use diagnostics::{classify_stderr, diagnose_error, BlockingReason};
pub use mirror::MirrorScraper;
pub use relay::RelayBackend;
pub use traits::{ExtractionStrategy, MirrorMethod, TierKind, TierSpec};

use super::errors::TierSpecError;
use super::models::NetworkConfig;
use super::process::CommandRunner;

/// Shared resources every tier is built from
#[derive(Clone)]
pub struct TierDeps {
    pub network: NetworkConfig,
    pub runner: Arc<dyn CommandRunner>,
    pub client: reqwest::Client,
    /// Budget for a single upstream call inside a tier
    pub timeout: Duration,
}

fn compile(label: &str, what: &str, pattern: &str) -> Result<Regex, TierSpecError> {
    Regex::new(pattern).map_err(|e| TierSpecError {
        label: label.to_string(),
        reason: format!("bad {}: {}", what, e),
    })
}

fn require<'a>(label: &str, value: Option<&'a str>, field: &str) -> Result<&'a str, TierSpecError> {
    value.filter(|v| !v.trim().is_empty()).ok_or_else(|| TierSpecError {
        label: label.to_string(),
        reason: format!("missing '{}'", field),
    })
}

/// Build the strategy a tier spec describes
pub fn build_strategy(
    spec: &TierSpec,
    deps: &TierDeps,
) -> Result<Arc<dyn ExtractionStrategy>, TierSpecError> {
    let label = spec.label();

    let strategy: Arc<dyn ExtractionStrategy> = match spec.kind {
        TierKind::Tool => {
            let program = require(&label, spec.program.as_deref(), "program")?;
            Arc::new(ToolExtractor::new(
                label.clone(),
                program,
                spec.args.clone(),
                deps.network.clone(),
                deps.runner.clone(),
                deps.timeout,
            ))
        }
        TierKind::Mirror => {
            let endpoint = require(&label, spec.endpoint.as_deref(), "endpoint")?;
            let media = require(&label, spec.media_pattern.as_deref(), "media_pattern")?;
            let media_pattern = compile(&label, "media_pattern", media)?;
            let title_pattern = spec
                .title_pattern
                .as_deref()
                .map(|p| compile(&label, "title_pattern", p))
                .transpose()?;
            Arc::new(MirrorScraper::new(
                label.clone(),
                endpoint,
                spec.method,
                spec.url_field.clone(),
                media_pattern,
                title_pattern,
                deps.client.clone(),
            ))
        }
        TierKind::Relay => {
            let endpoint = require(&label, spec.endpoint.as_deref(), "endpoint")?;
            Arc::new(RelayBackend::new(label.clone(), endpoint, deps.client.clone()))
        }
    };

    Ok(strategy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::process::TokioProcessRunner;

    fn deps() -> TierDeps {
        TierDeps {
            network: NetworkConfig::default(),
            runner: Arc::new(TokioProcessRunner),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_build_tool_tier() {
        let spec = TierSpec::tool("python3", &["-m", "yt_dlp"]).named("yt-dlp (python)");
        let strategy = build_strategy(&spec, &deps()).unwrap();
        assert_eq!(strategy.source(), "yt-dlp (python)");
    }

    #[test]
    fn test_mirror_requires_pattern() {
        let mut spec = TierSpec::tool("unused", &[]);
        spec.kind = TierKind::Mirror;
        spec.endpoint = Some("https://mirror.example/api".to_string());
        let err = build_strategy(&spec, &deps()).err().unwrap();
        assert!(err.reason.contains("media_pattern"));

        spec.media_pattern = Some("([unclosed".to_string());
        let err = build_strategy(&spec, &deps()).err().unwrap();
        assert!(err.reason.starts_with("bad media_pattern"));
    }

    #[test]
    fn test_relay_requires_endpoint() {
        let mut spec = TierSpec::tool("unused", &[]);
        spec.kind = TierKind::Relay;
        spec.name = Some("relay:peer".to_string());
        let err = build_strategy(&spec, &deps()).err().unwrap();
        assert_eq!(err.label, "relay:peer");
    }
}
