//! # HTTP Server Module
//!
//! Assembles the edge service: admin routes, health and metrics endpoints,
//! and a fallback that forwards everything else to the CRUD API. Request
//! flow through the middleware stack, outermost first:
//!
//! 1. tracing, request metrics, timeout and body limit
//! 2. identity extraction from trusted headers
//! 3. rate limiting
//! 4. HTTP response cache
//!
//! Shutdown on ctrl-c or SIGTERM stops the warming scheduler before the
//! process exits.

use crate::caching::{http_cache_middleware, CacheAdminRouter, CacheAdminState, HttpCacheState};
use crate::core::config::UpstreamConfig;
use crate::core::context::AppContext;
use crate::core::error::{EdgeError, EdgeResult};
use crate::core::identity::identity_middleware;
use crate::observability::{install_recorder, track_http_metrics};
use crate::rate_limiting::{rate_limit_middleware, RateLimitAdminRouter, RateLimitAdminState, RateLimitState};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

/// Headers that describe a single hop and are never forwarded
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

fn is_forwardable(name: &str) -> bool {
    !HOP_BY_HOP.contains(&name) && name != "content-length"
}

/// Forwards unmatched requests to the CRUD API
#[derive(Clone)]
pub struct UpstreamProxy {
    client: reqwest::Client,
    base_url: Arc<str>,
    max_body_bytes: usize,
}

impl UpstreamProxy {
    pub fn new(config: &UpstreamConfig, max_body_bytes: usize) -> EdgeResult<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            base_url: Arc::from(config.url.trim_end_matches('/')),
            max_body_bytes,
        })
    }

    pub async fn forward(&self, request: Request) -> EdgeResult<Response> {
        let (parts, body) = request.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.base_url, path);

        let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
            .map_err(|e| EdgeError::validation("method", e.to_string()))?;
        let body = axum::body::to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|e| EdgeError::validation("body", e.to_string()))?;

        let mut upstream = self.client.request(method, &url).body(body);
        for (name, value) in &parts.headers {
            if is_forwardable(name.as_str()) {
                upstream = upstream.header(name.as_str(), value.as_bytes());
            }
        }

        let reply = upstream.send().await?;
        let status = StatusCode::from_u16(reply.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let headers: Vec<(String, Vec<u8>)> = reply
            .headers()
            .iter()
            .filter(|(name, _)| is_forwardable(name.as_str()))
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();
        let bytes = reply.bytes().await?;

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        for (name, value) in headers {
            if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_bytes(&value)) {
                response.headers_mut().append(name, value);
            }
        }
        Ok(response)
    }
}

async fn proxy_fallback(State(proxy): State<Option<UpstreamProxy>>, request: Request) -> Response {
    match proxy {
        Some(proxy) => match proxy.forward(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Upstream request failed");
                e.into_response()
            }
        },
        None => EdgeError::not_found(request.uri().path().to_string()).into_response(),
    }
}

/// Liveness probe
pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

/// Readiness probe: the store must answer
async fn readiness_check(State(context): State<AppContext>) -> impl IntoResponse {
    let store = context.cache.health_check().await;
    let status = if store.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if store.healthy { "ready" } else { "degraded" },
            "timestamp": context.clock.now().to_rfc3339(),
            "store": store,
        })),
    )
}

async fn metrics_handler(State(handle): State<Option<PrometheusHandle>>) -> Response {
    match handle {
        Some(handle) => handle.render().into_response(),
        None => EdgeError::service_unavailable("metrics", "recorder not installed").into_response(),
    }
}

/// The edge HTTP server
pub struct EdgeServer {
    context: AppContext,
    app: Router,
}

impl EdgeServer {
    pub fn new(context: AppContext) -> EdgeResult<Self> {
        let metrics = match install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Prometheus recorder unavailable, /metrics disabled");
                None
            }
        };
        let app = Self::build_router(&context, metrics)?;
        Ok(Self { context, app })
    }

    /// Full application router, middleware included
    pub fn build_router(context: &AppContext, metrics: Option<PrometheusHandle>) -> EdgeResult<Router> {
        let config = &context.config;
        let admin_role: Arc<str> = Arc::from(config.identity.admin_role.as_str());

        let proxy = config
            .upstream
            .as_ref()
            .map(|upstream| UpstreamProxy::new(upstream, config.server.max_request_size))
            .transpose()?;

        let cache_admin = CacheAdminRouter::create_router(CacheAdminState {
            cache: context.cache.clone(),
            warmer: context.warmer.clone(),
            admin_role: admin_role.clone(),
        });
        let rate_limit_admin = RateLimitAdminRouter::create_router(RateLimitAdminState {
            limiter: context.rate_limiter.clone(),
            policies: context.policies.clone(),
            token_bucket: context.token_bucket.clone(),
            email_quota: context.email_quota.clone(),
            admin_role,
        });

        let http_cache = HttpCacheState::new(context.cache.clone(), config.http_cache.clone());
        let rate_limit = RateLimitState {
            limiter: context.rate_limiter.clone(),
            policies: context.policies.clone(),
            config: Arc::new(config.rate_limit.clone()),
        };
        let identity = Arc::new(config.identity.clone());

        let app = Router::new()
            .route("/health", get(health_check))
            .merge(Router::new().route("/ready", get(readiness_check)).with_state(context.clone()))
            .merge(Router::new().route("/metrics", get(metrics_handler)).with_state(metrics))
            .merge(cache_admin)
            .merge(rate_limit_admin)
            .fallback_service(Router::new().fallback(proxy_fallback).with_state(proxy))
            .layer(middleware::from_fn_with_state(http_cache, http_cache_middleware))
            .layer(middleware::from_fn_with_state(rate_limit, rate_limit_middleware))
            .layer(middleware::from_fn_with_state(identity, identity_middleware))
            .layer(RequestBodyLimitLayer::new(config.server.max_request_size))
            .layer(TimeoutLayer::new(config.server.request_timeout))
            .layer(middleware::from_fn(track_http_metrics))
            .layer(TraceLayer::new_for_http());

        Ok(app)
    }

    pub fn router(&self) -> Router {
        self.app.clone()
    }

    pub fn context(&self) -> &AppContext {
        &self.context
    }

    /// Bind the configured address and serve until ctrl-c or SIGTERM
    pub async fn run(self) -> EdgeResult<()> {
        let addr = format!(
            "{}:{}",
            self.context.config.server.bind_address, self.context.config.server.port
        );
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| EdgeError::internal(format!("Failed to bind {}: {}", addr, e)))?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an existing listener until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> EdgeResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener
            .local_addr()
            .map_err(|e| EdgeError::internal(format!("Listener has no local address: {}", e)))?;

        if self.context.config.warming.enabled {
            self.context.warmer.start();
        }

        info!(address = %local_addr, backend = self.context.store.backend_name(), "Edge server listening");
        let result = axum::serve(listener, self.app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await;

        self.context.warmer.stop().await;
        info!("Edge server stopped");
        result.map_err(|e| EdgeError::internal(format!("Server error: {}", e)))
    }
}

/// Resolves on ctrl-c, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
