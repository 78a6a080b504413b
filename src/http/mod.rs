//! HTTP front end: routing plus the middleware every request passes through.

mod handlers;
mod middleware;
mod server;

use std::sync::Arc;

use axum::error_handling::HandleErrorLayer;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::Router;
use tower::timeout::TimeoutLayer;
use tower::ServiceBuilder;
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::Level;

pub use middleware::{client_key, rate_limited, RATE_LIMITED_MESSAGE, REQUEST_ID_HEADER};
pub use server::HttpServer;

use crate::config::ServerConfig;
use crate::ratelimit::RateLimiter;

/// State shared by handlers and middleware.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The admission limiter every request goes through
    pub limiter: Arc<RateLimiter>,
    /// Whether proxy headers may name the client
    pub trust_proxy_headers: bool,
}

impl AppState {
    /// Create the shared state.
    pub fn new(limiter: Arc<RateLimiter>, trust_proxy_headers: bool) -> Self {
        Self {
            limiter,
            trust_proxy_headers,
        }
    }
}

/// Build the application router.
///
/// Layers run outermost first: request id, security headers, access log,
/// body limit, timeout, then admission control, so even rejected requests
/// carry an id and the security headers.
pub fn router(state: AppState, config: &ServerConfig) -> Router {
    let routes = Router::new()
        .route("/", get(handlers::home))
        .route("/healthz", get(handlers::healthz))
        .fallback(handlers::not_found)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit,
        ));

    request_limits(routes, config)
        .layer(
            TraceLayer::new_for_http().on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(axum::middleware::from_fn(middleware::security_headers))
        .layer(axum::middleware::from_fn(middleware::request_id))
        .with_state(state)
}

/// Wrap `router` in the request timeout and body size limits.
fn request_limits<S>(router: Router<S>, config: &ServerConfig) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(middleware::handle_middleware_error))
                .layer(TimeoutLayer::new(config.request_timeout())),
        )
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(axum::middleware::from_fn_with_state(
            config.max_body_bytes,
            middleware::body_limit,
        ))
}
