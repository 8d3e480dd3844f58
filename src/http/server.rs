//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router: stats endpoints plus the catch-all proxy
//! - Build the shared upstream client into the application state
//! - Wire up middleware (tracing, request deadline, request metrics)
//! - Serve on a pre-bound listener with graceful shutdown

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::ProxyConfig;
use crate::http::client::{self, HostLimiter, HttpClient};
use crate::lifecycle::Shutdown;
use crate::proxy;
use crate::stats::runtime::RuntimeStats;
use crate::stats::{Metrics, StatsError};
use crate::upstream::Upstream;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid stats configuration: {0}")]
    Stats(#[from] StatsError),

    #[error("failed to build upstream client: {0}")]
    Client(#[from] std::io::Error),

    #[error("version string is not a valid header value")]
    InvalidVersion,
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub client: HttpClient,
    pub upstream: Option<Arc<Upstream>>,
    pub limiter: Arc<HostLimiter>,
    pub metrics: Arc<Metrics>,
    pub version: String,
    pub version_header: HeaderValue,
    pub proxy_read_timeout: Duration,
    pub started_at: Instant,
}

/// HTTP server for the proxy.
pub struct HttpServer {
    router: Router,
    shutdown_timeout: Duration,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration. `upstream`
    /// enables fixed-upstream routing when present.
    pub fn new(config: &ProxyConfig, upstream: Option<Arc<Upstream>>) -> Result<Self, ServerError> {
        let metrics = Arc::new(Metrics::with_capacity(
            config.stats.bufsize,
            config.stats.spfactor,
        )?);
        let client = client::build(&config.client)?;
        let version_header =
            HeaderValue::from_str(&config.version).map_err(|_| ServerError::InvalidVersion)?;

        let state = AppState {
            client,
            upstream,
            limiter: Arc::new(HostLimiter::new(config.client.max_conns_per_host)),
            metrics,
            version: config.version.clone(),
            version_header,
            proxy_read_timeout: Duration::from_secs(config.timeouts.proxy_read_secs),
            started_at: Instant::now(),
        };

        Ok(Self {
            router: Self::build_router(config, state),
            shutdown_timeout: Duration::from_secs(config.timeouts.shutdown_secs),
        })
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(config: &ProxyConfig, state: AppState) -> Router {
        Router::new()
            .route("/.api/stats", get(runtime_stats))
            .route("/.api/http-stats", get(http_stats))
            .fallback(proxy::proxy)
            .with_state(state.clone())
            .layer(middleware::from_fn_with_state(state, track_requests))
            .layer(TimeoutLayer::new(Duration::from_secs(
                config.timeouts.write_secs,
            )))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve on the given pre-bound listener until shutdown is triggered,
    /// then drain in-flight connections up to the shutdown deadline.
    pub async fn run(self, listener: TcpListener, shutdown: Arc<Shutdown>) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let mut graceful_rx = shutdown.subscribe();
        let serve = axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = graceful_rx.recv().await;
            });

        let mut deadline_rx = shutdown.subscribe();
        let deadline = self.shutdown_timeout;
        let result = tokio::select! {
            result = serve => result,
            _ = async {
                let _ = deadline_rx.recv().await;
                tokio::time::sleep(deadline).await;
            } => {
                tracing::warn!("shutdown deadline reached with connections still open");
                Ok(())
            }
        };

        tracing::info!("HTTP server stopped");
        result
    }
}

/// Record count and response time for every proxied request. The stats
/// endpoints themselves are not measured.
async fn track_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.uri().path().starts_with("/.api/") {
        return next.run(request).await;
    }

    let start = Instant::now();
    let response = next.run(request).await;
    state
        .metrics
        .record(response.status().as_u16(), start.elapsed().as_secs_f64());
    response
}

/// `GET /.api/http-stats`: snapshot of the request metrics.
async fn http_stats(State(state): State<AppState>) -> Response {
    Json(state.metrics.snapshot()).into_response()
}

/// `GET /.api/stats`: process-level runtime statistics.
async fn runtime_stats(State(state): State<AppState>) -> Response {
    Json(RuntimeStats::collect(&state.version, state.started_at)).into_response()
}
