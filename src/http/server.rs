//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with all handlers
//! - Wire up middleware (correlation, tracing, limits, rate limit signaling)
//! - Bind server to listener with connect info for per-client limiting
//! - Prune expired rate limit windows in the background
//! - Graceful shutdown on OS signal or [`Shutdown`](crate::lifecycle::Shutdown)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    http::Request,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::LifecycleConfig;
use crate::http::request::{CorrelationExt, CorrelationLayer};
use crate::http::response::{signal_middleware, RateLimitSignaler};
use crate::lifecycle::{shutdown, shutdown_signal};
use crate::observability::metrics;
use crate::security::rate_limit::{rate_limit_middleware, FixedWindowLimiter};

/// HTTP server wrapping the request-lifecycle middleware stack.
pub struct HttpServer {
    router: Router,
    config: LifecycleConfig,
    limiter: Option<Arc<FixedWindowLimiter>>,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: LifecycleConfig) -> Self {
        Self::with_routes(config, Router::new())
    }

    /// Like [`new`](Self::new), with extra application routes mounted
    /// beneath the same middleware stack.
    pub fn with_routes(config: LifecycleConfig, routes: Router) -> Self {
        let limiter = config
            .rate_limit
            .enabled
            .then(|| Arc::new(FixedWindowLimiter::from_config(&config.rate_limit)));
        let signaler = Arc::new(RateLimitSignaler::from_config(&config.signaling));

        let router = Self::build_router(&config, routes, limiter.clone(), signaler);
        Self {
            router,
            config,
            limiter,
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(
        config: &LifecycleConfig,
        routes: Router,
        limiter: Option<Arc<FixedWindowLimiter>>,
        signaler: Arc<RateLimitSignaler>,
    ) -> Router {
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/api/echo", any(echo_handler))
            .merge(routes);

        if let Some(limiter) = limiter {
            router = router.layer(middleware::from_fn_with_state(limiter, rate_limit_middleware));
        }

        router
            .layer(RequestBodyLimitLayer::new(config.security.max_body_size))
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(middleware::from_fn_with_state(signaler, signal_middleware))
            .layer(middleware::from_fn(track_requests))
            .layer(TraceLayer::new_for_http())
            .layer(CorrelationLayer)
    }

    /// The fully layered router, e.g. for driving with `tower::ServiceExt`.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Run the server until an OS signal or `shutdown_rx` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            rate_limit = self.limiter.is_some(),
            "HTTP server starting"
        );

        if let Some(limiter) = self.limiter.clone() {
            tokio::spawn(prune_windows(limiter, shutdown_rx.resubscribe()));
        }

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown_signal() => {},
                    _ = shutdown::wait(shutdown_rx) => {},
                }
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn prune_windows(limiter: Arc<FixedWindowLimiter>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(limiter.window().max(Duration::from_secs(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let pruned = limiter.prune_expired();
                if pruned > 0 {
                    tracing::debug!(pruned, remaining = limiter.tracked_clients(), "Pruned rate limit windows");
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

async fn track_requests(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let response = next.run(request).await;
    metrics::record_request(&method, response.status().as_u16(), start);
    response
}

async fn health_handler() -> impl IntoResponse {
    "ok"
}

#[derive(Debug, Serialize)]
struct EchoResponse {
    correlation_id: String,
    elapsed_ms: u64,
    method: String,
    path: String,
}

/// Reports what the lifecycle layer attached to the request.
async fn echo_handler(request: Request<Body>) -> Json<EchoResponse> {
    tracing::debug!("Echoing request");
    Json(EchoResponse {
        correlation_id: request.correlation_id().to_string(),
        elapsed_ms: request.elapsed_millis(),
        method: request.method().to_string(),
        path: request.uri().path().to_string(),
    })
}
