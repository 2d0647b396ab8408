//! Rate limiting middleware
//!
//! Resolves the policy for each request, counts it against both windows and
//! either forwards it or answers `429`. Every limited response, allowed or
//! denied, carries the `X-RateLimit-*` headers for both windows. Exempt paths
//! skip the limiter entirely.

use super::client_ip::client_ip;
use super::limiter::{RateLimitDecision, RateLimiter, WindowCheck};
use super::policy::PolicyTable;
use crate::core::config::RateLimitConfig;
use crate::core::error::EdgeError;
use crate::core::identity::AuthIdentity;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::debug;

pub const X_RATELIMIT_LIMIT_MINUTE: HeaderName = HeaderName::from_static("x-ratelimit-limit-minute");
pub const X_RATELIMIT_LIMIT_HOUR: HeaderName = HeaderName::from_static("x-ratelimit-limit-hour");
pub const X_RATELIMIT_REMAINING_MINUTE: HeaderName = HeaderName::from_static("x-ratelimit-remaining-minute");
pub const X_RATELIMIT_REMAINING_HOUR: HeaderName = HeaderName::from_static("x-ratelimit-remaining-hour");
pub const X_RATELIMIT_RESET_MINUTE: HeaderName = HeaderName::from_static("x-ratelimit-reset-minute");
pub const X_RATELIMIT_RESET_HOUR: HeaderName = HeaderName::from_static("x-ratelimit-reset-hour");

#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub policies: Arc<PolicyTable>,
    pub config: Arc<RateLimitConfig>,
}

fn insert_window(headers: &mut HeaderMap, window: &WindowCheck, names: [HeaderName; 3]) {
    let [limit, remaining, reset] = names;
    headers.insert(limit, HeaderValue::from(window.limit));
    headers.insert(remaining, HeaderValue::from(window.remaining));
    if let Ok(value) = HeaderValue::from_str(&window.reset_time.to_rfc3339()) {
        headers.insert(reset, value);
    }
}

/// Add the limit/remaining/reset headers for both windows
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    if let Some(minute) = &decision.minute {
        insert_window(
            headers,
            minute,
            [X_RATELIMIT_LIMIT_MINUTE, X_RATELIMIT_REMAINING_MINUTE, X_RATELIMIT_RESET_MINUTE],
        );
    }
    if let Some(hour) = &decision.hour {
        insert_window(
            headers,
            hour,
            [X_RATELIMIT_LIMIT_HOUR, X_RATELIMIT_REMAINING_HOUR, X_RATELIMIT_RESET_HOUR],
        );
    }
}

fn denied_response(decision: &RateLimitDecision) -> Response {
    let retry_after = decision.retry_after.unwrap_or(60);
    let exceeded = if retry_after >= 3600 {
        decision.hour.as_ref()
    } else {
        decision.minute.as_ref()
    };

    let error = EdgeError::RateLimitExceeded {
        limit: exceeded.map_or(0, |w| w.limit),
        window: if retry_after >= 3600 { "hour" } else { "minute" }.to_string(),
    };

    let mut response = error.into_response();
    let headers = response.headers_mut();
    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    apply_rate_limit_headers(headers, decision);
    response
}

/// Rate limit middleware, mounted with `axum::middleware::from_fn_with_state`
pub async fn rate_limit_middleware(State(state): State<RateLimitState>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    if !state.config.enabled || state.config.is_exempt(&path) {
        return next.run(request).await;
    }

    let ip = client_ip(request.headers(), request.extensions());
    let resolved = state.policies.resolve(
        request.method().as_str(),
        &path,
        request.extensions().get::<AuthIdentity>(),
        &ip,
    );

    let decision = state.limiter.check_resolved(&resolved).await;
    if !decision.allowed {
        debug!(identifier = %decision.identifier, path = %path, "Request rejected by rate limiter");
        return denied_response(&decision);
    }

    let mut response = next.run(request).await;
    apply_rate_limit_headers(response.headers_mut(), &decision);
    response
}
