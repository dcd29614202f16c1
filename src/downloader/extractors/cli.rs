// Tool tier - runs a yt-dlp compatible extractor as a subprocess
//
// Works with the native binary (`yt-dlp`) and the Python module
// (`python3 -m yt_dlp`); the program and its leading arguments come from
// configuration. Two phases:
// 1. `--dump-json --skip-download` for metadata, parsed strictly
// 2. the real download, reporting the final path via `--print after_move:filepath`

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::diagnostics::error_from_stderr;
use super::traits::ExtractionStrategy;
use crate::downloader::errors::ExtractionError;
use crate::downloader::format_selector::FormatSelector;
use crate::downloader::models::{
    AcquisitionRequest, AttemptContext, ByteSource, ContentKind, ExtractionResult, NetworkConfig,
};
use crate::downloader::process::{CommandRunner, Invocation, ProcessOutcome, ProcessRun};
use crate::downloader::utils::{get_proxy_args, get_timeout_args, BrowserProfile};

/// Fields we rely on from `--dump-json`. Anything that does not fit is
/// treated as an empty result rather than guessed at.
#[derive(Debug, Deserialize)]
struct ToolMetadata {
    title: String,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    ext: Option<String>,
}

pub struct ToolExtractor {
    label: String,
    program: String,
    prefix_args: Vec<String>,
    network: NetworkConfig,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl ToolExtractor {
    pub fn new(
        label: impl Into<String>,
        program: impl Into<String>,
        prefix_args: Vec<String>,
        network: NetworkConfig,
        runner: Arc<dyn CommandRunner>,
        timeout: Duration,
    ) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            prefix_args,
            network,
            runner,
            timeout,
        }
    }

    /// Arguments shared by both phases
    fn common_args(&self, ctx: &AttemptContext) -> Vec<String> {
        let mut args = self.prefix_args.clone();
        args.extend(
            ["--no-playlist", "--no-warnings", "--no-progress", "--retries", "2"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.extend(BrowserProfile::random().tool_args());
        args.extend(get_proxy_args(&self.network));
        args.extend(get_timeout_args(&self.network));

        if let Some(cookies) = &ctx.cookies_file {
            args.push("--cookies".to_string());
            args.push(cookies.display().to_string());
        }

        args
    }

    /// Build metadata command arguments
    fn build_metadata_args(&self, url: &str, ctx: &AttemptContext) -> Vec<String> {
        let mut args = self.common_args(ctx);
        args.push("--dump-json".to_string());
        args.push("--skip-download".to_string());
        args.push(url.to_string());
        args
    }

    /// Build download command arguments
    fn build_download_args(&self, request: &AcquisitionRequest, ctx: &AttemptContext) -> Vec<String> {
        let nonce: u32 = rand::thread_rng().gen();
        let template = ctx
            .work_dir
            .join(format!("dl_{:08x}_%(id)s.%(ext)s", nonce));

        let mut args = self.common_args(ctx);
        args.push("-f".to_string());
        args.push(FormatSelector::get_format_spec(request.format, &request.quality));
        args.extend(FormatSelector::container_args(request.format));
        args.push("-o".to_string());
        args.push(template.display().to_string());
        args.push("--print".to_string());
        args.push("after_move:filepath".to_string());
        args.push(request.url.clone());
        args
    }

    /// Map a finished run to an error unless it succeeded
    fn check_run(&self, run: &ProcessRun, phase: &str) -> Result<(), ExtractionError> {
        match run.outcome {
            ProcessOutcome::Success => Ok(()),
            ProcessOutcome::Timeout => Err(ExtractionError::timeout(format!(
                "{} {} timed out after {}s",
                self.label,
                phase,
                run.elapsed.as_secs()
            ))),
            ProcessOutcome::EmptyOutput => Err(ExtractionError::empty(format!(
                "{} {} produced no output",
                self.label, phase
            ))),
            ProcessOutcome::NonZeroExit => Err(error_from_stderr(&self.label, run.exit_code, &run.stderr)),
        }
    }

    /// Parse JSON output. `--dump-json` prints one object per line; only the
    /// last one matters for single items.
    fn parse_metadata(stdout: &str) -> Result<ToolMetadata, ExtractionError> {
        let line = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .ok_or_else(|| ExtractionError::empty("metadata output was empty"))?;

        let meta: ToolMetadata = serde_json::from_str(line)
            .map_err(|e| ExtractionError::empty(format!("unusable metadata: {}", e)))?;

        if meta.title.trim().is_empty() {
            return Err(ExtractionError::empty("metadata has an empty title"));
        }
        Ok(meta)
    }

    async fn fetch_metadata(
        &self,
        url: &str,
        ctx: &AttemptContext,
    ) -> Result<ToolMetadata, ExtractionError> {
        let invocation = Invocation::new(&self.program).args(self.build_metadata_args(url, ctx));
        let run = self.runner.run(&invocation, self.timeout).await?;
        self.check_run(&run, "metadata")?;
        Self::parse_metadata(&run.stdout)
    }

    async fn download(
        &self,
        request: &AcquisitionRequest,
        ctx: &AttemptContext,
    ) -> Result<PathBuf, ExtractionError> {
        let invocation = Invocation::new(&self.program).args(self.build_download_args(request, ctx));
        let run = self.runner.run(&invocation, self.timeout).await?;
        self.check_run(&run, "download")?;

        // The printed path is the only thing we trust; no directory scans
        let printed = run
            .last_line()
            .ok_or_else(|| ExtractionError::empty(format!("{} did not report a file", self.label)))?;
        let path = PathBuf::from(printed);

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(path),
            Ok(_) => Err(ExtractionError::empty(format!(
                "{} reported {} but it is empty",
                self.label,
                path.display()
            ))),
            Err(e) => Err(ExtractionError::empty(format!(
                "{} reported {} but it is missing: {}",
                self.label,
                path.display(),
                e
            ))),
        }
    }
}

#[async_trait]
impl ExtractionStrategy for ToolExtractor {
    fn source(&self) -> &str {
        &self.label
    }

    async fn attempt(
        &self,
        request: &AcquisitionRequest,
        ctx: &AttemptContext,
    ) -> Result<ExtractionResult, ExtractionError> {
        debug!(tool = %self.label, url = %request.url, "fetching metadata");
        let meta = self.fetch_metadata(&request.url, ctx).await?;

        info!(tool = %self.label, title = %meta.title, "metadata ok, downloading");
        let path = match self.download(request, ctx).await {
            Ok(path) => path,
            Err(e) => {
                warn!(tool = %self.label, error = %e, "download phase failed");
                return Err(e);
            }
        };

        let declared_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .or(meta.ext);

        let content_type = ContentKind::resolve(declared_ext.as_deref(), request.format);

        Ok(ExtractionResult {
            title: meta.title,
            duration: meta.duration,
            uploader: meta.uploader,
            content_type,
            source: ByteSource::LocalFile(path),
            declared_ext,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::errors::ExtractionErrorKind;
    use crate::downloader::models::MediaFormat;
    use std::sync::Mutex;

    /// Replays canned runs in order and records every invocation
    struct ScriptedRunner {
        runs: Mutex<Vec<ProcessRun>>,
        seen: Mutex<Vec<Invocation>>,
    }

    impl ScriptedRunner {
        fn new(mut runs: Vec<ProcessRun>) -> Arc<Self> {
            runs.reverse();
            Arc::new(Self {
                runs: Mutex::new(runs),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, invocation: &Invocation, _: Duration) -> Result<ProcessRun, ExtractionError> {
            self.seen.lock().unwrap().push(invocation.clone());
            self.runs
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| ExtractionError::process("no more scripted runs"))
        }
    }

    fn run(outcome: ProcessOutcome, stdout: &str, stderr: &str) -> ProcessRun {
        ProcessRun {
            outcome,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code: match outcome {
                ProcessOutcome::NonZeroExit => Some(1),
                ProcessOutcome::Timeout => None,
                _ => Some(0),
            },
            elapsed: Duration::from_millis(5),
        }
    }

    fn extractor(runner: Arc<ScriptedRunner>) -> ToolExtractor {
        ToolExtractor::new(
            "yt-dlp",
            "python3",
            vec!["-m".to_string(), "yt_dlp".to_string()],
            NetworkConfig {
                proxy: Some("http://proxy.local:3128".to_string()),
                timeout: Some(20),
            },
            runner,
            Duration::from_secs(30),
        )
    }

    fn ctx(dir: &std::path::Path) -> AttemptContext {
        AttemptContext {
            work_dir: dir.to_path_buf(),
            cookies_file: None,
        }
    }

    #[tokio::test]
    async fn test_two_phase_success() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("dl_1_abc.m4a");
        std::fs::write(&media, b"audio bytes").unwrap();

        let runner = ScriptedRunner::new(vec![
            run(
                ProcessOutcome::Success,
                r#"{"title":"Sample Track","duration":212.5,"uploader":"Artist","ext":"webm"}"#,
                "",
            ),
            run(ProcessOutcome::Success, &format!("{}\n", media.display()), ""),
        ]);
        let tool = extractor(runner.clone());
        let request = AcquisitionRequest::new("https://music.youtube.com/watch?v=1", MediaFormat::Audio);

        let result = tool.attempt(&request, &ctx(dir.path())).await.unwrap();
        assert_eq!(result.title, "Sample Track");
        assert_eq!(result.duration, Some(212.5));
        assert_eq!(result.content_type, ContentKind::Audio);
        assert_eq!(result.declared_ext.as_deref(), Some("m4a"));
        assert_eq!(result.source, ByteSource::LocalFile(media));

        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].program, "python3");
        assert_eq!(&seen[0].args[..2], &["-m".to_string(), "yt_dlp".to_string()]);
        assert!(seen[0].args.contains(&"--dump-json".to_string()));
        assert!(seen[0].args.contains(&"http://proxy.local:3128".to_string()));
        assert!(seen[1].args.contains(&"after_move:filepath".to_string()));
        assert!(seen[1].args.contains(&"ba[ext=m4a]/ba/b".to_string()));
    }

    #[tokio::test]
    async fn test_audio_in_webm_container_stays_audio() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("dl_2_abc.webm");
        std::fs::write(&media, b"opus in webm").unwrap();

        let runner = ScriptedRunner::new(vec![
            run(ProcessOutcome::Success, r#"{"title":"Podcast","ext":"webm"}"#, ""),
            run(ProcessOutcome::Success, &format!("{}\n", media.display()), ""),
        ]);
        let request = AcquisitionRequest::new("https://www.youtube.com/watch?v=2", MediaFormat::Audio);

        let result = extractor(runner).attempt(&request, &ctx(dir.path())).await.unwrap();
        assert_eq!(result.declared_ext.as_deref(), Some("webm"));
        assert_eq!(result.content_type, ContentKind::Audio);
    }

    #[tokio::test]
    async fn test_metadata_without_title_is_empty_result() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new(vec![run(ProcessOutcome::Success, r#"{"id":"x"}"#, "")]);
        let err = extractor(runner.clone())
            .attempt(&AcquisitionRequest::new("https://youtu.be/x", MediaFormat::Video), &ctx(dir.path()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ExtractionErrorKind::EmptyResult);
        // no download was attempted
        assert_eq!(runner.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_printed_file_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new(vec![
            run(ProcessOutcome::Success, r#"{"title":"Clip"}"#, ""),
            run(ProcessOutcome::Success, "/nonexistent/dl_clip.mp4\n", ""),
        ]);
        let err = extractor(runner)
            .attempt(&AcquisitionRequest::new("https://youtu.be/x", MediaFormat::Video), &ctx(dir.path()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ExtractionErrorKind::EmptyResult);
    }

    #[tokio::test]
    async fn test_stderr_is_classified() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new(vec![run(
            ProcessOutcome::NonZeroExit,
            "",
            "ERROR: [Instagram] abc: login required to view this post",
        )]);
        let err = extractor(runner)
            .attempt(
                &AcquisitionRequest::new("https://www.instagram.com/p/abc/", MediaFormat::Video),
                &ctx(dir.path()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ExtractionErrorKind::AuthRequired);
    }

    #[tokio::test]
    async fn test_process_timeout_maps_to_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new(vec![run(ProcessOutcome::Timeout, "", "")]);
        let err = extractor(runner)
            .attempt(&AcquisitionRequest::new("https://youtu.be/x", MediaFormat::Video), &ctx(dir.path()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ExtractionErrorKind::Timeout);
    }

    #[test]
    fn test_cookies_passed_to_tool() {
        let runner = ScriptedRunner::new(Vec::new());
        let tool = extractor(runner);
        let ctx = AttemptContext {
            work_dir: PathBuf::from("/tmp/store"),
            cookies_file: Some(PathBuf::from("/tmp/store/cookies_1.txt")),
        };
        let args = tool.build_metadata_args("https://youtu.be/x", &ctx);
        let pos = args.iter().position(|a| a == "--cookies").unwrap();
        assert_eq!(args[pos + 1], "/tmp/store/cookies_1.txt");
        assert_eq!(args.last().map(String::as_str), Some("https://youtu.be/x"));
    }
}
