// Orchestrator with fallback logic
//
// Tiers run strictly one after another in configured order. A tier only
// succeeds once its artifact is stored, so a dead media link fails that tier
// and the chain moves on. Every invoked tier leaves exactly one attempt
// record behind, success or not.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::time::{timeout, Instant};
use tracing::{error, info, warn};

use super::errors::{ChainError, ChainExhausted, ExtractionError, ExtractionErrorKind, MaterializeError};
use super::extractors::ExtractionStrategy;
use super::materializer::Materializer;
use super::models::{
    AcquisitionRequest, AttemptContext, ByteSource, ContentKind, ExtractionAttempt, ExtractionResult,
    ManagedFile,
};
use super::platform::Platform;

/// What to hand back when every tier failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradedPolicy {
    /// Explanation written into the fallback artifact and the response
    pub note: String,
}

/// How a chain run ended, short of total failure
#[derive(Debug, Clone)]
pub enum ChainOutcome {
    Extracted {
        result: ExtractionResult,
        file: ManagedFile,
        attempts: Vec<ExtractionAttempt>,
    },
    Degraded {
        result: ExtractionResult,
        file: ManagedFile,
        note: String,
        attempts: Vec<ExtractionAttempt>,
    },
}

impl ChainOutcome {
    pub fn result(&self) -> &ExtractionResult {
        match self {
            Self::Extracted { result, .. } | Self::Degraded { result, .. } => result,
        }
    }

    pub fn file(&self) -> &ManagedFile {
        match self {
            Self::Extracted { file, .. } | Self::Degraded { file, .. } => file,
        }
    }

    pub fn attempts(&self) -> &[ExtractionAttempt] {
        match self {
            Self::Extracted { attempts, .. } | Self::Degraded { attempts, .. } => attempts,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    pub fn into_parts(self) -> (ExtractionResult, ManagedFile, Vec<ExtractionAttempt>, Option<String>) {
        match self {
            Self::Extracted {
                result,
                file,
                attempts,
            } => (result, file, attempts, None),
            Self::Degraded {
                result,
                file,
                note,
                attempts,
            } => (result, file, attempts, Some(note)),
        }
    }
}

/// Why one tier produced no file
enum TierFailure {
    /// Counts against the tier; the chain moves on
    Extraction(ExtractionError),
    /// Storage itself is broken; the chain stops
    Storage(MaterializeError),
}

impl From<MaterializeError> for TierFailure {
    fn from(err: MaterializeError) -> Self {
        match err.as_tier_error() {
            Some(tier_err) => Self::Extraction(tier_err),
            None => Self::Storage(err),
        }
    }
}

/// Ordered tiers for one platform
pub struct FallbackChain {
    platform: Platform,
    tiers: Vec<Arc<dyn ExtractionStrategy>>,
    degraded: Option<DegradedPolicy>,
    tier_timeout: Duration,
}

impl FallbackChain {
    pub fn new(platform: Platform, tier_timeout: Duration) -> Self {
        Self {
            platform,
            tiers: Vec::new(),
            degraded: None,
            tier_timeout,
        }
    }

    pub fn with_tier(mut self, tier: Arc<dyn ExtractionStrategy>) -> Self {
        self.tiers.push(tier);
        self
    }

    pub fn with_degraded(mut self, policy: DegradedPolicy) -> Self {
        self.degraded = Some(policy);
        self
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn sources(&self) -> Vec<String> {
        self.tiers.iter().map(|t| t.source().to_string()).collect()
    }

    pub fn degraded(&self) -> Option<&DegradedPolicy> {
        self.degraded.as_ref()
    }

    /// Extract and store in one step, inside the tier budget
    async fn attempt_tier(
        tier: &dyn ExtractionStrategy,
        request: &AcquisitionRequest,
        ctx: &AttemptContext,
        materializer: &Materializer,
    ) -> Result<(ExtractionResult, ManagedFile), TierFailure> {
        let result = tier.attempt(request, ctx).await.map_err(TierFailure::Extraction)?;
        let file = materializer.materialize(&result, &ctx.work_dir).await?;
        Ok((result, file))
    }

    /// Run tiers in order until one produces a stored file
    pub async fn run(
        &self,
        request: &AcquisitionRequest,
        cookies_file: Option<&Path>,
        materializer: &Materializer,
    ) -> Result<ChainOutcome, ChainError> {
        let mut attempts = Vec::with_capacity(self.tiers.len());

        for (index, tier) in self.tiers.iter().enumerate() {
            let tier_no = index + 1;
            let source = tier.source();

            // Removed at the end of the iteration, whatever the tier left in it
            let workspace = match materializer.workspace().await {
                Ok(workspace) => workspace,
                Err(err) => return Err(ChainError::FileSystem { source: err, attempts }),
            };
            let ctx = AttemptContext {
                work_dir: workspace.path().to_path_buf(),
                cookies_file: cookies_file.map(Path::to_path_buf),
            };
            let started = Instant::now();

            info!(platform = %self.platform, tier = tier_no, source, "Extracting");

            // Dropping the attempt future on timeout kills any child process
            let outcome = match timeout(
                self.tier_timeout,
                Self::attempt_tier(tier.as_ref(), request, &ctx, materializer),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(TierFailure::Extraction(ExtractionError::timeout(format!(
                    "{} exceeded the {}s tier budget",
                    source,
                    self.tier_timeout.as_secs()
                )))),
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok((result, file)) => {
                    info!(platform = %self.platform, tier = tier_no, source, elapsed_ms, "Succeeded");
                    attempts.push(ExtractionAttempt::succeeded(tier_no, source, elapsed_ms));
                    return Ok(ChainOutcome::Extracted {
                        result,
                        file,
                        attempts,
                    });
                }
                Err(TierFailure::Extraction(e)) => {
                    warn!(
                        platform = %self.platform,
                        tier = tier_no,
                        source,
                        kind = %e.kind,
                        elapsed_ms,
                        "Tier failed: {}",
                        e.message
                    );
                    attempts.push(ExtractionAttempt::failed(tier_no, source, &e, elapsed_ms));
                }
                Err(TierFailure::Storage(e)) => {
                    error!(platform = %self.platform, tier = tier_no, source, error = %e, "Storage failed");
                    let recorded = ExtractionError::new(ExtractionErrorKind::ProcessFailure, e.to_string());
                    attempts.push(ExtractionAttempt::failed(tier_no, source, &recorded, elapsed_ms));
                    return Err(ChainError::FileSystem { source: e, attempts });
                }
            }
        }

        let Some(policy) = &self.degraded else {
            warn!(platform = %self.platform, tiers = attempts.len(), "Failed");
            return Err(ChainExhausted {
                platform: self.platform,
                attempts,
            }
            .into());
        };

        info!(platform = %self.platform, tiers = attempts.len(), "DegradedFallback");
        let result = degraded_artifact(self.platform, &request.url, &policy.note, &attempts);
        let stored = match materializer.workspace().await {
            Ok(workspace) => materializer.materialize(&result, workspace.path()).await,
            Err(e) => Err(e),
        };
        match stored {
            Ok(file) => Ok(ChainOutcome::Degraded {
                result,
                file,
                note: policy.note.clone(),
                attempts,
            }),
            Err(source) => Err(ChainError::FileSystem { source, attempts }),
        }
    }
}

/// Plain-text stand-in for content no tier could fetch
fn degraded_artifact(
    platform: Platform,
    url: &str,
    note: &str,
    attempts: &[ExtractionAttempt],
) -> ExtractionResult {
    let generated = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string());

    let mut body = String::new();
    body.push_str(&format!("{} content could not be downloaded.\n\n", platform));
    body.push_str(&format!("URL: {}\n", url));
    body.push_str(&format!("Status: {}\n\n", note));
    body.push_str("Attempts:\n");
    for attempt in attempts {
        body.push_str(&format!(
            "  {}. {}: {} {}\n",
            attempt.tier,
            attempt.source,
            attempt.error.map(|k| k.as_str()).unwrap_or("Unknown"),
            attempt.message.as_deref().unwrap_or("")
        ));
    }
    body.push_str(&format!("\nGenerated: {}\n", generated));

    ExtractionResult {
        title: format!("{} content", platform),
        duration: None,
        uploader: None,
        content_type: ContentKind::Text,
        source: ByteSource::Inline(body.into_bytes()),
        declared_ext: Some("txt".to_string()),
    }
}

/// Explicit platform → chain lookup
#[derive(Default)]
pub struct ChainRegistry {
    chains: HashMap<Platform, FallbackChain>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, chain: FallbackChain) {
        self.chains.insert(chain.platform(), chain);
    }

    pub fn get(&self, platform: Platform) -> Option<&FallbackChain> {
        self.chains.get(&platform)
    }

    /// Tier sources per platform, for health reporting
    pub fn tier_sources(&self) -> BTreeMap<String, Vec<String>> {
        self.chains
            .iter()
            .map(|(platform, chain)| (platform.to_string(), chain.sources()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::materializer::ATTEMPT_DIR_PREFIX;
    use crate::downloader::models::MediaFormat;
    use async_trait::async_trait;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    enum Behaviour {
        Fail(ExtractionErrorKind),
        Succeed(&'static str),
        /// Hands back a direct link that still has to be fetched
        Link(String),
        /// Writes a partial download into the work dir, then fails
        Partial,
        Hang,
    }

    struct FakeTier {
        name: &'static str,
        behaviour: Behaviour,
        calls: Arc<AtomicUsize>,
    }

    impl FakeTier {
        fn new(name: &'static str, behaviour: Behaviour) -> (Arc<Self>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Arc::new(Self {
                    name,
                    behaviour,
                    calls: calls.clone(),
                }),
                calls,
            )
        }
    }

    #[async_trait]
    impl ExtractionStrategy for FakeTier {
        fn source(&self) -> &str {
            self.name
        }

        async fn attempt(
            &self,
            request: &AcquisitionRequest,
            ctx: &AttemptContext,
        ) -> Result<ExtractionResult, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = |title: &str, source: ByteSource| ExtractionResult {
                title: title.to_string(),
                duration: None,
                uploader: None,
                content_type: ContentKind::from(request.format),
                source,
                declared_ext: None,
            };
            match &self.behaviour {
                Behaviour::Fail(kind) => Err(ExtractionError::new(*kind, format!("{} failed", self.name))),
                Behaviour::Succeed(title) => Ok(result(title, ByteSource::Inline(b"bytes".to_vec()))),
                Behaviour::Link(url) => Ok(result("Linked", ByteSource::Remote(url.clone()))),
                Behaviour::Partial => {
                    std::fs::write(ctx.work_dir.join("dl_1_abc.mp4.part"), b"half a video").unwrap();
                    Err(ExtractionError::process("connection reset mid-download"))
                }
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(ExtractionError::process("unreachable"))
                }
            }
        }
    }

    fn storage() -> (TempDir, Materializer) {
        let dir = tempfile::tempdir().unwrap();
        let materializer = Materializer::new(dir.path(), reqwest::Client::new());
        (dir, materializer)
    }

    fn entries(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    /// Media host whose every link is dead
    async fn dead_links() -> String {
        let app = Router::new().route("/media/:id", get(|| async { axum::http::StatusCode::NOT_FOUND }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/media/clip.mp4", addr)
    }

    fn request() -> AcquisitionRequest {
        AcquisitionRequest::new("https://www.tiktok.com/@a/video/1", MediaFormat::Video)
    }

    #[tokio::test]
    async fn test_stops_at_first_success() {
        let (dir, materializer) = storage();
        let (t1, c1) = FakeTier::new("one", Behaviour::Fail(ExtractionErrorKind::RateLimited));
        let (t2, c2) = FakeTier::new("two", Behaviour::Succeed("Clip"));
        let (t3, c3) = FakeTier::new("three", Behaviour::Succeed("Never"));
        let chain = FallbackChain::new(Platform::Tiktok, Duration::from_secs(5))
            .with_tier(t1)
            .with_tier(t2)
            .with_tier(t3);

        let outcome = chain.run(&request(), None, &materializer).await.unwrap();
        assert!(!outcome.is_degraded());
        assert_eq!(outcome.result().title, "Clip");
        assert!(outcome.file().filename.starts_with("Clip_"));
        assert_eq!(std::fs::read(&outcome.file().path).unwrap(), b"bytes");

        let attempts = outcome.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!((attempts[0].tier, attempts[0].success), (1, false));
        assert_eq!(attempts[0].error, Some(ExtractionErrorKind::RateLimited));
        assert_eq!((attempts[1].tier, attempts[1].success), (2, true));
        assert_eq!(attempts[1].source, "two");

        assert_eq!(c1.load(Ordering::SeqCst), 1);
        assert_eq!(c2.load(Ordering::SeqCst), 1);
        assert_eq!(c3.load(Ordering::SeqCst), 0);
        assert_eq!(entries(dir.path()), vec![outcome.file().filename.clone()]);
    }

    #[tokio::test]
    async fn test_exhausted_records_every_tier() {
        let (_dir, materializer) = storage();
        let kinds = [
            ExtractionErrorKind::Timeout,
            ExtractionErrorKind::AuthRequired,
            ExtractionErrorKind::EmptyResult,
        ];
        let mut chain = FallbackChain::new(Platform::Youtube, Duration::from_secs(5));
        for (i, kind) in kinds.iter().enumerate() {
            let name = ["a", "b", "c"][i];
            chain = chain.with_tier(FakeTier::new(name, Behaviour::Fail(*kind)).0);
        }

        let err = chain.run(&request(), None, &materializer).await.unwrap_err();
        let ChainError::Exhausted(err) = err else {
            panic!("expected the chain to be exhausted");
        };
        assert_eq!(err.platform, Platform::Youtube);
        assert_eq!(err.attempts.len(), 3);
        for (i, attempt) in err.attempts.iter().enumerate() {
            assert_eq!(attempt.tier, i + 1);
            assert!(!attempt.success);
            assert_eq!(attempt.error, Some(kinds[i]));
        }
    }

    #[tokio::test]
    async fn test_dead_link_falls_through_to_next_tier() {
        let (dir, materializer) = storage();
        let (mirror, _) = FakeTier::new("mirror", Behaviour::Link(dead_links().await));
        let (relay, relay_calls) = FakeTier::new("relay", Behaviour::Succeed("Clip"));
        let chain = FallbackChain::new(Platform::Tiktok, Duration::from_secs(5))
            .with_tier(mirror)
            .with_tier(relay);

        let outcome = chain.run(&request(), None, &materializer).await.unwrap();
        assert!(!outcome.is_degraded());
        assert_eq!(relay_calls.load(Ordering::SeqCst), 1);

        let attempts = outcome.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].error, Some(ExtractionErrorKind::NotFound));
        assert!(attempts[0].message.as_deref().unwrap_or("").contains("404"));
        assert!(attempts[1].success);
        assert_eq!(entries(dir.path()), vec![outcome.file().filename.clone()]);
    }

    #[tokio::test]
    async fn test_dead_link_still_reaches_degraded_fallback() {
        let (_dir, materializer) = storage();
        let (mirror, _) = FakeTier::new("mirror", Behaviour::Link(dead_links().await));
        let chain = FallbackChain::new(Platform::Twitter, Duration::from_secs(5))
            .with_tier(mirror)
            .with_degraded(DegradedPolicy {
                note: "Twitter media is unavailable".to_string(),
            });

        let outcome = chain.run(&request(), None, &materializer).await.unwrap();
        assert!(outcome.is_degraded());
        assert_eq!(outcome.attempts()[0].error, Some(ExtractionErrorKind::NotFound));
        assert_eq!(outcome.file().content_type, ContentKind::Text);
        assert!(outcome.file().filename.ends_with(".txt"));
    }

    #[tokio::test]
    async fn test_failed_tier_leaves_nothing_in_storage() {
        let (dir, materializer) = storage();
        let (tool, _) = FakeTier::new("yt-dlp", Behaviour::Partial);
        let chain = FallbackChain::new(Platform::Vimeo, Duration::from_secs(5)).with_tier(tool);

        let err = chain.run(&request(), None, &materializer).await.unwrap_err();
        assert!(matches!(err, ChainError::Exhausted(_)));
        assert!(entries(dir.path()).is_empty(), "{:?}", entries(dir.path()));
    }

    #[tokio::test]
    async fn test_unusable_storage_stops_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("downloads");
        std::fs::write(&not_a_dir, b"").unwrap();
        let materializer = Materializer::new(&not_a_dir, reqwest::Client::new());

        let (tier, calls) = FakeTier::new("yt-dlp", Behaviour::Succeed("Clip"));
        let chain = FallbackChain::new(Platform::Vimeo, Duration::from_secs(5))
            .with_tier(tier)
            .with_degraded(DegradedPolicy {
                note: "unused".to_string(),
            });

        let err = chain.run(&request(), None, &materializer).await.unwrap_err();
        assert!(matches!(err, ChainError::FileSystem { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_degraded_fallback_writes_text_artifact() {
        let (_dir, materializer) = storage();
        let (t1, _) = FakeTier::new("yt-dlp", Behaviour::Fail(ExtractionErrorKind::AuthRequired));
        let chain = FallbackChain::new(Platform::Instagram, Duration::from_secs(5))
            .with_tier(t1)
            .with_degraded(DegradedPolicy {
                note: "Instagram requires login for this post".to_string(),
            });

        let req = AcquisitionRequest::new("https://www.instagram.com/p/abc/", MediaFormat::Video);
        let outcome = chain.run(&req, None, &materializer).await.unwrap();
        assert!(outcome.is_degraded());
        assert_eq!(outcome.attempts().len(), 1);

        let result = outcome.result();
        assert_eq!(result.content_type, ContentKind::Text);
        assert_eq!(result.declared_ext.as_deref(), Some("txt"));
        assert_eq!(outcome.file().mime, "text/plain");

        let text = std::fs::read_to_string(&outcome.file().path).unwrap();
        assert!(text.contains("https://www.instagram.com/p/abc/"));
        assert!(text.contains("requires login"));
        assert!(text.contains("1. yt-dlp: AuthRequired"));
        assert!(text.contains("Generated: "));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tier_timeout_moves_on() {
        let (dir, materializer) = storage();
        let (slow, _) = FakeTier::new("slow", Behaviour::Hang);
        let (fast, _) = FakeTier::new("fast", Behaviour::Succeed("Done"));
        let chain = FallbackChain::new(Platform::Vimeo, Duration::from_secs(30))
            .with_tier(slow)
            .with_tier(fast);

        let outcome = chain.run(&request(), None, &materializer).await.unwrap();
        let attempts = outcome.attempts();
        assert_eq!(attempts[0].error, Some(ExtractionErrorKind::Timeout));
        assert!(attempts[0].elapsed_ms >= 30_000);
        assert!(attempts[1].success);
        assert!(!entries(dir.path()).iter().any(|e| e.starts_with(ATTEMPT_DIR_PREFIX)));
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ChainRegistry::new();
        registry.insert(
            FallbackChain::new(Platform::Soundcloud, Duration::from_secs(5))
                .with_tier(FakeTier::new("yt-dlp", Behaviour::Succeed("x")).0),
        );
        assert!(registry.get(Platform::Soundcloud).is_some());
        assert!(registry.get(Platform::Spotify).is_none());
        assert_eq!(registry.tier_sources()["soundcloud"], vec!["yt-dlp".to_string()]);
    }
}
