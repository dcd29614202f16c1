use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::process::{CommandRunner, Invocation};

/// One external tool used by tool tiers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolCommand {
    pub name: String,
    pub program: String,
    pub prefix_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    pub program: String,
    pub version: Option<String>,
    pub is_available: bool,
}

/// Probes tool availability and caches the answer, since `--version` on the
/// Python module costs an interpreter start
pub struct ToolManager {
    runner: Arc<dyn CommandRunner>,
    tools: Vec<ToolCommand>,
    cache: RwLock<Option<Vec<ToolInfo>>>,
    probe_timeout: Duration,
}

impl ToolManager {
    pub fn new(runner: Arc<dyn CommandRunner>, tools: Vec<ToolCommand>) -> Self {
        Self {
            runner,
            tools,
            cache: RwLock::new(None),
            probe_timeout: Duration::from_secs(10),
        }
    }

    /// Status of every tool, probed once and then served from cache
    pub async fn get_all_tools(&self) -> Vec<ToolInfo> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            return cached.clone();
        }
        self.refresh().await
    }

    /// Probe every tool again
    pub async fn refresh(&self) -> Vec<ToolInfo> {
        let mut infos = Vec::with_capacity(self.tools.len());
        for tool in &self.tools {
            infos.push(self.get_tool_info(tool).await);
        }
        *self.cache.write().await = Some(infos.clone());
        infos
    }

    async fn get_tool_info(&self, tool: &ToolCommand) -> ToolInfo {
        let invocation = Invocation::new(&tool.program)
            .args(tool.prefix_args.iter().cloned())
            .arg("--version");

        let version = match self.runner.run(&invocation, self.probe_timeout).await {
            Ok(run) if run.is_success() => run.last_line().map(str::to_string),
            Ok(run) => {
                debug!(tool = %tool.name, outcome = ?run.outcome, "version probe failed");
                None
            }
            Err(e) => {
                debug!(tool = %tool.name, error = %e, "version probe failed");
                None
            }
        };

        info!(tool = %tool.name, version = ?version, "probed tool");

        ToolInfo {
            name: tool.name.clone(),
            program: tool.program.clone(),
            is_available: version.is_some(),
            version,
        }
    }
}
