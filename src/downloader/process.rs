// Process runner - spawns extraction tools with a hard wall-clock timeout
//
// stdout and stderr are drained concurrently so a chatty tool can never
// block on a full pipe. On timeout the child is killed before we return, and
// `kill_on_drop` covers the case where the whole request future is dropped.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::errors::ExtractionError;

/// One external command to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

/// Classified result of a finished (or killed) process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Exit code 0 and something on stdout
    Success,
    /// Killed after exceeding the timeout
    Timeout,
    /// Exited with a non-zero code or was terminated by a signal
    NonZeroExit,
    /// Exit code 0 but stdout was blank
    EmptyOutput,
}

#[derive(Debug, Clone)]
pub struct ProcessRun {
    pub outcome: ProcessOutcome,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

impl ProcessRun {
    pub fn is_success(&self) -> bool {
        self.outcome == ProcessOutcome::Success
    }

    /// Last non-empty stdout line, trimmed
    pub fn last_line(&self) -> Option<&str> {
        self.stdout.lines().map(str::trim).filter(|l| !l.is_empty()).last()
    }
}

/// Classify exit status and captured output
pub fn classify(exit_code: Option<i32>, stdout: &str) -> ProcessOutcome {
    match exit_code {
        Some(0) if stdout.trim().is_empty() => ProcessOutcome::EmptyOutput,
        Some(0) => ProcessOutcome::Success,
        _ => ProcessOutcome::NonZeroExit,
    }
}

/// Seam between extraction tiers and the operating system
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        invocation: &Invocation,
        timeout_after: Duration,
    ) -> Result<ProcessRun, ExtractionError>;
}

/// Runs commands with `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

#[async_trait]
impl CommandRunner for TokioProcessRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        timeout_after: Duration,
    ) -> Result<ProcessRun, ExtractionError> {
        run_output_with_timeout(invocation, timeout_after).await
    }
}

/// Run command with timeout (shared utility)
pub async fn run_output_with_timeout(
    invocation: &Invocation,
    timeout_after: Duration,
) -> Result<ProcessRun, ExtractionError> {
    let program = invocation.program.as_str();
    let started = Instant::now();

    debug!(program, args = ?invocation.args, "spawning process");

    let mut child = TokioCommand::new(program)
        .args(&invocation.args)
        .envs(invocation.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExtractionError::process(format!("Failed to start {}: {}", program, e)))?;

    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| ExtractionError::process(format!("Failed to capture stdout from {}", program)))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| ExtractionError::process(format!("Failed to capture stderr from {}", program)))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });

    match timeout(timeout_after, child.wait()).await {
        Ok(status_res) => {
            let status = status_res
                .map_err(|e| ExtractionError::process(format!("Failed to wait for {}: {}", program, e)))?;
            let stdout = collect(stdout_task, "stdout").await?;
            let stderr = collect(stderr_task, "stderr").await?;
            let exit_code = status.code();

            Ok(ProcessRun {
                outcome: classify(exit_code, &stdout),
                stdout,
                stderr,
                exit_code,
                elapsed: started.elapsed(),
            })
        }
        Err(_) => {
            warn!(program, timeout_secs = timeout_after.as_secs_f64(), "process timed out, killing");
            if let Err(e) = child.kill().await {
                warn!(program, error = %e, "failed to kill timed out process");
            }
            stdout_task.abort();
            stderr_task.abort();

            Ok(ProcessRun {
                outcome: ProcessOutcome::Timeout,
                stdout: String::new(),
                stderr: format!("Timed out after {}s", timeout_after.as_secs_f64()),
                exit_code: None,
                elapsed: started.elapsed(),
            })
        }
    }
}

async fn collect(
    task: tokio::task::JoinHandle<std::io::Result<Vec<u8>>>,
    stream: &str,
) -> Result<String, ExtractionError> {
    let bytes = task
        .await
        .map_err(|e| ExtractionError::process(format!("{} task failed: {}", stream, e)))?
        .map_err(|e| ExtractionError::process(format!("Failed to read {}: {}", stream, e)))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
