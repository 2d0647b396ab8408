//! Dual fixed-window rate limiter
//!
//! Windows are aligned to absolute time: the minute window containing `t`
//! starts at `t - t % 60`. Each window has its own counter key,
//! `{prefix}:rate_limit:{identifier}:{minute|hour}:{window_start}`, created by
//! the store's atomic increment with a TTL equal to the window size.
//!
//! Both counters are incremented before the limits are compared, so a denied
//! request still consumes budget in both windows. Nothing is rolled back.

use super::policy::{PolicyKey, RateLimitPolicy, ResolvedPolicy};
use super::RateLimitResult;
use crate::core::clock::Clock;
use crate::observability::metrics as metric_names;
use crate::store::{KvStore, StoreOp, StoreReply};
use chrono::{DateTime, TimeZone, Utc};
use metrics::counter;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const MINUTE_WINDOW: Duration = Duration::from_secs(60);
pub const HOUR_WINDOW: Duration = Duration::from_secs(3600);

/// One of the two fixed windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Window {
    Minute,
    Hour,
}

impl Window {
    fn label(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
        }
    }

    fn size(self) -> Duration {
        match self {
            Self::Minute => MINUTE_WINDOW,
            Self::Hour => HOUR_WINDOW,
        }
    }

    fn start(self, now_secs: i64) -> i64 {
        let size = self.size().as_secs() as i64;
        now_secs - now_secs.rem_euclid(size)
    }
}

/// Result of checking one window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowCheck {
    pub allowed: bool,
    pub current_usage: u64,
    pub limit: u64,
    pub remaining: u64,

    /// End of the fixed window: `window_start + window_size`
    pub reset_time: DateTime<Utc>,
    pub window_secs: u64,
}

impl WindowCheck {
    fn new(usage: i64, limit: u64, window_start: i64, window: Window) -> Self {
        let current_usage = usage.max(0) as u64;
        let size = window.size().as_secs();
        Self {
            allowed: current_usage <= limit,
            current_usage,
            limit,
            remaining: limit.saturating_sub(current_usage),
            reset_time: to_datetime(window_start + size as i64),
            window_secs: size,
        }
    }
}

fn to_datetime(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Admission decision for one request
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub identifier: String,
    pub policy_key: Option<PolicyKey>,

    /// Absent when the limiter failed open
    pub minute: Option<WindowCheck>,
    pub hour: Option<WindowCheck>,

    /// Seconds to wait: 60 or 3600, set only on denial
    pub retry_after: Option<u64>,

    /// The store could not be consulted and the request was let through
    pub fail_open: bool,
}

impl RateLimitDecision {
    fn fail_open(identifier: &str, policy_key: Option<PolicyKey>) -> Self {
        Self {
            allowed: true,
            identifier: identifier.to_string(),
            policy_key,
            minute: None,
            hour: None,
            retry_after: None,
            fail_open: true,
        }
    }
}

/// Current window usage for an identifier, without incrementing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowUsage {
    pub identifier: String,
    pub minute: u64,
    pub hour: u64,
    pub minute_reset: DateTime<Utc>,
    pub hour_reset: DateTime<Utc>,
}

/// Snapshot of limiter counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub requests_allowed: u64,
    pub requests_denied: u64,
    pub fail_open: u64,
    pub total_requests: u64,
    pub denial_rate: f64,
}

#[derive(Debug, Default)]
struct RateLimitMetrics {
    allowed: AtomicU64,
    denied: AtomicU64,
    fail_open: AtomicU64,
}

/// Fixed-window limiter over the shared store
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    metrics: RateLimitMetrics,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, key_prefix: &str) -> Self {
        Self {
            store,
            clock,
            key_prefix: key_prefix.to_string(),
            metrics: RateLimitMetrics::default(),
        }
    }

    fn window_key(&self, identifier: &str, window: Window, window_start: i64) -> String {
        format!(
            "{}:rate_limit:{}:{}:{}",
            self.key_prefix,
            identifier,
            window.label(),
            window_start
        )
    }

    /// Check a request resolved by the policy table
    pub async fn check_resolved(&self, resolved: &ResolvedPolicy) -> RateLimitDecision {
        self.check_with_key(&resolved.identifier, &resolved.policy, Some(resolved.key.clone()))
            .await
    }

    /// Count one request against both windows and decide. Never fails:
    /// a store error lets the request through.
    pub async fn check(&self, identifier: &str, policy: &RateLimitPolicy) -> RateLimitDecision {
        self.check_with_key(identifier, policy, None).await
    }

    async fn check_with_key(
        &self,
        identifier: &str,
        policy: &RateLimitPolicy,
        policy_key: Option<PolicyKey>,
    ) -> RateLimitDecision {
        match self.try_check(identifier, policy).await {
            Ok((minute, hour)) => {
                let retry_after = if !hour.allowed {
                    Some(hour.window_secs)
                } else if !minute.allowed {
                    Some(minute.window_secs)
                } else {
                    None
                };
                let allowed = retry_after.is_none();

                if allowed {
                    self.metrics.allowed.fetch_add(1, Ordering::Relaxed);
                    counter!(metric_names::RATE_LIMIT_DECISIONS_TOTAL, "outcome" => "allowed").increment(1);
                } else {
                    self.metrics.denied.fetch_add(1, Ordering::Relaxed);
                    counter!(metric_names::RATE_LIMIT_DECISIONS_TOTAL, "outcome" => "denied").increment(1);
                    debug!(
                        identifier,
                        minute_usage = minute.current_usage,
                        hour_usage = hour.current_usage,
                        "Rate limit exceeded"
                    );
                }

                RateLimitDecision {
                    allowed,
                    identifier: identifier.to_string(),
                    policy_key,
                    minute: Some(minute),
                    hour: Some(hour),
                    retry_after,
                    fail_open: false,
                }
            }
            Err(e) => {
                self.metrics.fail_open.fetch_add(1, Ordering::Relaxed);
                counter!(metric_names::RATE_LIMIT_DECISIONS_TOTAL, "outcome" => "fail_open").increment(1);
                warn!(identifier, error = %e, "Rate limiter failing open");
                RateLimitDecision::fail_open(identifier, policy_key)
            }
        }
    }

    async fn try_check(&self, identifier: &str, policy: &RateLimitPolicy) -> RateLimitResult<(WindowCheck, WindowCheck)> {
        let now = self.clock.now_secs();
        let minute_start = Window::Minute.start(now);
        let hour_start = Window::Hour.start(now);

        // One round-trip, one atomic increment per window
        let replies = self
            .store
            .pipeline(vec![
                StoreOp::Increment {
                    key: self.window_key(identifier, Window::Minute, minute_start),
                    amount: 1,
                    ttl_if_new: MINUTE_WINDOW,
                },
                StoreOp::Increment {
                    key: self.window_key(identifier, Window::Hour, hour_start),
                    amount: 1,
                    ttl_if_new: HOUR_WINDOW,
                },
            ])
            .await?;

        let count = |reply: Option<&StoreReply>| match reply {
            Some(StoreReply::Integer(n)) => *n,
            _ => 0,
        };

        Ok((
            WindowCheck::new(count(replies.first()), policy.requests_per_minute, minute_start, Window::Minute),
            WindowCheck::new(count(replies.get(1)), policy.requests_per_hour, hour_start, Window::Hour),
        ))
    }

    async fn read_counter(&self, key: &str) -> RateLimitResult<u64> {
        Ok(self
            .store
            .get(key)
            .await?
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0))
    }

    /// Usage in the current windows
    pub async fn usage(&self, identifier: &str) -> RateLimitResult<WindowUsage> {
        let now = self.clock.now_secs();
        let minute_start = Window::Minute.start(now);
        let hour_start = Window::Hour.start(now);

        Ok(WindowUsage {
            identifier: identifier.to_string(),
            minute: self
                .read_counter(&self.window_key(identifier, Window::Minute, minute_start))
                .await?,
            hour: self
                .read_counter(&self.window_key(identifier, Window::Hour, hour_start))
                .await?,
            minute_reset: to_datetime(minute_start + MINUTE_WINDOW.as_secs() as i64),
            hour_reset: to_datetime(hour_start + HOUR_WINDOW.as_secs() as i64),
        })
    }

    /// Drop every window counter under `identifier`, including the
    /// endpoint-scoped counters nested beneath it
    pub async fn reset(&self, identifier: &str) -> RateLimitResult<u64> {
        let pattern = format!("{}:rate_limit:{}:*", self.key_prefix, identifier);
        let keys = self.store.scan(&pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let ops = keys.into_iter().map(|key| StoreOp::Delete { key }).collect();
        let removed = self
            .store
            .pipeline(ops)
            .await?
            .iter()
            .filter(|reply| reply.removed())
            .count() as u64;

        info!(identifier, removed, "Rate limit counters reset");
        Ok(removed)
    }

    pub fn get_metrics(&self) -> RateLimitMetricsSnapshot {
        let allowed = self.metrics.allowed.load(Ordering::Relaxed);
        let denied = self.metrics.denied.load(Ordering::Relaxed);
        let fail_open = self.metrics.fail_open.load(Ordering::Relaxed);
        let total = allowed + denied + fail_open;

        RateLimitMetricsSnapshot {
            requests_allowed: allowed,
            requests_denied: denied,
            fail_open,
            total_requests: total,
            denial_rate: if total == 0 { 0.0 } else { denied as f64 / total as f64 },
        }
    }
}
