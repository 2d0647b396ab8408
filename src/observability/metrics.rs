//! # Metrics
//!
//! Metric names used across the crate and the process-wide Prometheus
//! recorder. Counters are emitted through the `metrics` macros at the call
//! site; nothing here holds metric state.

use crate::core::error::{EdgeError, EdgeResult};
use axum::{extract::Request, middleware::Next, response::Response};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use parking_lot::Mutex;
use std::time::Instant;

/// Cache reads served from the store (label `namespace`)
pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";

/// Cache reads that found nothing usable (label `namespace`)
pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";

/// Store failures swallowed by the cache manager (label `namespace`)
pub const CACHE_STORE_ERRORS_TOTAL: &str = "cache_store_errors_total";

/// HTTP cache outcomes (label `result` = hit|miss|bypass)
pub const HTTP_CACHE_RESPONSES_TOTAL: &str = "http_cache_responses_total";

/// Rate limiter decisions (label `outcome` = allowed|denied|fail_open)
pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "rate_limit_decisions_total";

pub const CACHE_WARMING_RUNS_TOTAL: &str = "cache_warming_runs_total";
pub const CACHE_WARMING_FAILURES_TOTAL: &str = "cache_warming_failures_total";

/// Requests handled by the edge (labels `method`, `status`)
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

static HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

/// Install the Prometheus recorder, or return the one already installed
pub fn install_recorder() -> EdgeResult<PrometheusHandle> {
    let mut installed = HANDLE.lock();
    if let Some(handle) = installed.as_ref() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            LATENCY_BUCKETS,
        )
        .map_err(|e| EdgeError::internal(format!("Failed to set histogram buckets: {}", e)))?
        .install_recorder()
        .map_err(|e| EdgeError::internal(format!("Failed to install metrics recorder: {}", e)))?;

    *installed = Some(handle.clone());
    Ok(handle)
}

/// Count and time every request passing through the edge
pub async fn track_http_metrics(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method).record(started.elapsed().as_secs_f64());
    response
}
