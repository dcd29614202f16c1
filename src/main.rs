use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use detach_backend_lib::config::Config;
use detach_backend_lib::downloader::utils::build_http_client;
use detach_backend_lib::downloader::{
    CleanupScheduler, CommandRunner, Materializer, RateLimiter, TokioProcessRunner, ToolManager,
};
use detach_backend_lib::gateway::{self, AppState};

#[derive(Parser)]
#[command(name = "detach-backend")]
#[command(about = "Media acquisition gateway with tiered extraction fallback")]
#[command(version)]
struct Cli {
    /// TOML config file
    #[arg(short, long, env = "DETACH_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the config file
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Directory for downloaded files
    #[arg(long)]
    storage_dir: Option<PathBuf>,
}

fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let runner: Arc<dyn CommandRunner> = Arc::new(TokioProcessRunner);

    let registry = config
        .build_registry(runner.clone())
        .context("failed to build extraction chains")?;

    let client = build_http_client(&config.fetch_network(), config.tier_timeout());

    Ok(AppState {
        registry: Arc::new(registry),
        materializer: Arc::new(Materializer::new(&config.storage_dir, client)),
        cleanup: CleanupScheduler::new(&config.storage_dir, config.cleanup_delay()),
        limiter: Arc::new(RateLimiter::new(config.rate_limit, config.rate_limit_window())),
        tools: Arc::new(ToolManager::new(runner, config.tool_commands())),
        scratch_dir: std::env::temp_dir().join("detach-cookies"),
        public_url: config.public_url.clone(),
        started: Instant::now(),
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(dir) = cli.storage_dir {
        config.storage_dir = dir;
    }

    info!("Starting detach-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(storage = %config.storage_dir.display(), "Storage directory");

    let state = build_state(&config)?;

    state
        .cleanup
        .sweep()
        .await
        .with_context(|| format!("failed to prepare {}", config.storage_dir.display()))?;

    for (platform, sources) in state.registry.tier_sources() {
        info!(platform = %platform, tiers = ?sources, "chain ready");
    }

    // Forget clients whose window has lapsed
    let limiter = state.limiter.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(limiter.window_length().max(Duration::from_secs(1)));
        loop {
            ticker.tick().await;
            limiter.prune();
        }
    });

    let tools = state.tools.clone();
    tokio::spawn(async move {
        for tool in tools.get_all_tools().await {
            if !tool.is_available {
                warn!(tool = %tool.name, program = %tool.program, "tool not available");
            }
        }
    });

    let app = gateway::router(state);
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    info!("Listening on {}", config.listen_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}
