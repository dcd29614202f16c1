// HTTP gateway - request validation, rate limiting and response shaping

pub mod errors;
pub mod handlers;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::downloader::{ChainRegistry, CleanupScheduler, Materializer, RateLimiter, ToolManager};

pub use errors::ApiError;

/// Everything a request handler needs, built once at startup
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ChainRegistry>,
    pub materializer: Arc<Materializer>,
    pub cleanup: CleanupScheduler,
    pub limiter: Arc<RateLimiter>,
    pub tools: Arc<ToolManager>,
    /// Where request-scoped cookie files are written
    pub scratch_dir: PathBuf,
    /// Prefix for `downloadUrl`; relative links when unset
    pub public_url: Option<String>,
    pub started: Instant,
}

impl AppState {
    pub fn storage_dir(&self) -> &std::path::Path {
        self.materializer.storage_dir()
    }
}

/// Identity used for rate limiting, attached by the middleware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId(pub String);

/// First `X-Forwarded-For` hop, else the peer address, else "unknown"
pub fn client_id(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match (forwarded, peer) {
        (Some(hop), _) => hop.to_string(),
        (None, Some(addr)) => addr.ip().to_string(),
        (None, None) => "unknown".to_string(),
    }
}

async fn rate_limit(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_id(request.headers(), peer);

    if !state.limiter.allow(&client) {
        let retry_after = state.limiter.retry_after(&client);
        warn!(client = %client, retry_after, "rate limit exceeded");
        return ApiError::RateLimitExceeded { retry_after }.into_response();
    }

    request.extensions_mut().insert(ClientId(client));
    next.run(request).await
}

fn routes(state: &AppState) -> Router<AppState> {
    let acquisition = Router::new()
        .route("/download", post(handlers::download))
        .route("/:platform", post(handlers::download_for_platform))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/file/:filename", get(handlers::get_file))
        .route("/health", get(handlers::health))
        .merge(acquisition)
}

/// Routes are served both at the root and under `/api`
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes(&state))
        .nest("/api", routes(&state))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
