//! # HTTP Cache Middleware
//!
//! Response cache in front of the CRUD API. For a cacheable GET the request
//! is keyed by tenant, path, sorted query and `Accept` header; a hit is
//! answered from the `api_responses` namespace without calling downstream,
//! and a miss is forwarded and its `200` JSON body stored.
//!
//! Every response on a cacheable path carries `X-Cache` and `X-Cache-Key`.
//! Non-GET requests and excluded or non-cacheable paths pass straight
//! through untouched. A store outage turns every lookup into a miss; the
//! request itself never fails because of the cache.

use super::key_generator::HttpCacheKey;
use super::{CacheManager, CacheNamespace};
use crate::core::config::HttpCacheConfig;
use crate::core::identity::AuthIdentity;
use crate::observability::metrics as metric_names;
use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use metrics::counter;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
pub const X_CACHE_KEY: HeaderName = HeaderName::from_static("x-cache-key");

/// Response headers kept alongside a cached body
const STORED_HEADERS: [HeaderName; 5] = [
    header::CONTENT_TYPE,
    header::CACHE_CONTROL,
    header::ETAG,
    header::LAST_MODIFIED,
    header::VARY,
];

/// A cached downstream response. `body` holds the downstream JSON text
/// exactly as it was sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedHttpResponse {
    pub status_code: u16,
    pub body: String,
    pub headers: BTreeMap<String, String>,
    pub cached_at: DateTime<Utc>,
}

impl CachedHttpResponse {
    fn into_response(self, cache_key: &str) -> Response {
        let status = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::OK);
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        if !headers.contains_key(header::CONTENT_TYPE) {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        mark(headers, "HIT", cache_key);
        response
    }
}

/// State shared by every invocation of the middleware
#[derive(Clone)]
pub struct HttpCacheState {
    pub cache: Arc<CacheManager>,
    pub config: Arc<HttpCacheConfig>,
    anonymous_warned: Arc<AtomicBool>,
}

impl HttpCacheState {
    pub fn new(cache: Arc<CacheManager>, config: HttpCacheConfig) -> Self {
        Self {
            cache,
            config: Arc::new(config),
            anonymous_warned: Arc::new(AtomicBool::new(false)),
        }
    }
}

fn mark(headers: &mut HeaderMap, result: &'static str, cache_key: &str) {
    headers.insert(X_CACHE, HeaderValue::from_static(result));
    if let Ok(value) = HeaderValue::from_str(cache_key) {
        headers.insert(X_CACHE_KEY, value);
    }
}

/// TTL implied by the response's `Cache-Control`. `no-cache`/`no-store`
/// give zero, `max-age=N` gives N seconds, anything else the default.
pub fn ttl_from_cache_control(headers: &HeaderMap, default_ttl: Duration) -> Duration {
    let Some(value) = headers.get(header::CACHE_CONTROL).and_then(|v| v.to_str().ok()) else {
        return default_ttl;
    };

    let directives: Vec<String> = value
        .split(',')
        .map(|d| d.trim().to_ascii_lowercase())
        .collect();

    if directives.iter().any(|d| d == "no-cache" || d == "no-store") {
        return Duration::ZERO;
    }

    directives
        .iter()
        .find_map(|d| d.strip_prefix("max-age="))
        .and_then(|secs| secs.trim_matches('"').parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default_ttl)
}

fn stored_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    STORED_HEADERS
        .iter()
        .filter_map(|name| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// A downstream body read up to a size limit
enum BufferedBody {
    Complete(Bytes),

    /// Over the limit or failed mid-read; forwarded as a stream
    Passthrough(Body),
}

/// Buffer `body` while it stays within `limit` bytes. Past the limit the
/// bytes read so far are replayed ahead of the rest of the stream, and a read
/// error is handed on to the client as the body's own error.
async fn buffer_within(body: Body, limit: usize) -> BufferedBody {
    let mut data = body.into_data_stream();
    let mut buffered: Vec<u8> = Vec::new();

    while let Some(chunk) = data.next().await {
        match chunk {
            Ok(chunk) if buffered.len() + chunk.len() > limit => {
                let head = stream::iter([Ok::<_, axum::Error>(Bytes::from(buffered)), Ok(chunk)]);
                return BufferedBody::Passthrough(Body::from_stream(head.chain(data)));
            }
            Ok(chunk) => buffered.extend_from_slice(&chunk),
            Err(e) => {
                warn!(error = %e, "Failed to read downstream response body");
                let head = stream::iter([Ok(Bytes::from(buffered)), Err(e)]);
                return BufferedBody::Passthrough(Body::from_stream(head));
            }
        }
    }
    BufferedBody::Complete(Bytes::from(buffered))
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// HTTP cache middleware, mounted with `axum::middleware::from_fn_with_state`
pub async fn http_cache_middleware(
    State(state): State<HttpCacheState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    if !state.config.enabled || request.method() != Method::GET || !state.config.is_cacheable(&path) {
        counter!(metric_names::HTTP_CACHE_RESPONSES_TOTAL, "result" => "bypass").increment(1);
        return next.run(request).await;
    }

    let tenant = request
        .extensions()
        .get::<AuthIdentity>()
        .and_then(|identity| identity.workspace_id.clone());
    let key = HttpCacheKey::from_request(tenant.as_deref(), request.uri(), request.headers());
    let cache_key = key.digest();

    if let Some(cached) = state
        .cache
        .get::<CachedHttpResponse>(&cache_key, CacheNamespace::ApiResponses)
        .await
    {
        counter!(metric_names::HTTP_CACHE_RESPONSES_TOTAL, "result" => "hit").increment(1);
        debug!(path = %path, cache_key = %cache_key, "HTTP cache hit");
        return cached.into_response(&cache_key);
    }

    counter!(metric_names::HTTP_CACHE_RESPONSES_TOTAL, "result" => "miss").increment(1);
    let response = next.run(request).await;
    let (mut parts, body) = response.into_parts();
    mark(&mut parts.headers, "MISS", &cache_key);

    if parts.status != StatusCode::OK {
        return Response::from_parts(parts, body);
    }

    let ttl = ttl_from_cache_control(&parts.headers, state.config.default_ttl);
    if ttl.is_zero() {
        debug!(path = %path, "Response forbids caching");
        return Response::from_parts(parts, body);
    }

    if declared_length(&parts.headers).map_or(false, |len| len > state.config.max_body_bytes) {
        debug!(path = %path, "Response too large to cache");
        return Response::from_parts(parts, body);
    }

    let bytes = match buffer_within(body, state.config.max_body_bytes).await {
        BufferedBody::Complete(bytes) => bytes,
        BufferedBody::Passthrough(body) => {
            debug!(path = %path, "Response body not cacheable, streamed through");
            return Response::from_parts(parts, body);
        }
    };

    let json = match std::str::from_utf8(&bytes) {
        Ok(text) if serde_json::from_str::<IgnoredAny>(text).is_ok() => text.to_string(),
        _ => {
            debug!(path = %path, "Non-JSON response passed through uncached");
            return Response::from_parts(parts, Body::from(bytes));
        }
    };

    let entry = CachedHttpResponse {
        status_code: parts.status.as_u16(),
        body: json,
        headers: stored_headers(&parts.headers),
        cached_at: state.cache.clock().now(),
    };

    match state
        .cache
        .set(&cache_key, &entry, Some(ttl), CacheNamespace::ApiResponses)
        .await
    {
        Ok(true) => {
            debug!(path = %path, cache_key = %cache_key, ttl_secs = ttl.as_secs(), "HTTP response cached");
            if key.is_anonymous()
                && !state.config.is_tenant_independent(&path)
                && !state.anonymous_warned.swap(true, Ordering::Relaxed)
            {
                warn!(
                    path = %path,
                    "Cached an anonymous response on a tenant-sensitive path under the shared 'unknown' tenant"
                );
            }
        }
        Ok(false) => {}
        Err(e) => warn!(path = %path, error = %e, "Could not cache HTTP response"),
    }

    Response::from_parts(parts, Body::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_control(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_cache_control_ttl() {
        let default = Duration::from_secs(300);
        assert_eq!(ttl_from_cache_control(&HeaderMap::new(), default), default);
        assert_eq!(ttl_from_cache_control(&cache_control("public, max-age=60"), default), Duration::from_secs(60));
        assert_eq!(ttl_from_cache_control(&cache_control("no-store"), default), Duration::ZERO);
        assert_eq!(ttl_from_cache_control(&cache_control("max-age=60, No-Cache"), default), Duration::ZERO);
        assert_eq!(ttl_from_cache_control(&cache_control("max-age=0"), default), Duration::ZERO);
        assert_eq!(ttl_from_cache_control(&cache_control("public"), default), default);
    }

    #[test]
    fn test_only_selected_headers_are_stored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::SET_COOKIE, HeaderValue::from_static("session=abc"));
        let stored = stored_headers(&headers);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored["content-type"], "application/json");
    }

    #[test]
    fn test_cached_response_rebuild() {
        let cached = CachedHttpResponse {
            status_code: 200,
            body: r#"{"id":1}"#.to_string(),
            headers: BTreeMap::new(),
            cached_at: Utc::now(),
        };
        let response = cached.into_response("abc");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[&X_CACHE], "HIT");
        assert_eq!(response.headers()[&X_CACHE_KEY], "abc");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    }

    #[tokio::test]
    async fn test_body_within_limit_is_buffered() {
        let BufferedBody::Complete(bytes) = buffer_within(Body::from("{\"a\":1}"), 64).await else {
            panic!("small body should be buffered");
        };
        assert_eq!(&bytes[..], b"{\"a\":1}");
    }

    #[tokio::test]
    async fn test_streamed_body_over_limit_is_forwarded_whole() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = (0..8).map(|_| Ok(Bytes::from(vec![b'x'; 16]))).collect();
        let body = Body::from_stream(stream::iter(chunks));

        let BufferedBody::Passthrough(body) = buffer_within(body, 40).await else {
            panic!("oversized body should stream through");
        };
        let forwarded = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(forwarded.len(), 128);
    }
}
