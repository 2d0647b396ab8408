//! # Rate Limiting
//!
//! Request admission for the edge:
//!
//! - **Dual fixed window** ([`RateLimiter`]): a minute and an hour counter per
//!   identifier, both incremented atomically in the store on every request.
//!   A request passes only when both are within their limit.
//! - **Policy resolution** ([`PolicyTable`]): endpoint override, then the
//!   caller's plan tier or the authenticated default, then the client IP.
//! - **Token bucket** ([`TokenBucketLimiter`]): burst-tolerant quota with
//!   whole-period refills.
//! - **Daily quota** ([`DailyQuota`]): all-or-nothing per-workspace email
//!   allowance for the current calendar day.
//!
//! ## Failure behavior
//! The limiter must never become an outage of its own. Any store failure
//! while checking a request lets the request through and is logged and
//! counted as `fail_open`.

pub mod admin;
pub mod client_ip;
pub mod daily_quota;
pub mod limiter;
pub mod middleware;
pub mod policy;
pub mod token_bucket;

pub use admin::{RateLimitAdminRouter, RateLimitAdminState};
pub use client_ip::client_ip;
pub use daily_quota::{DailyQuota, QuotaDecision};
pub use limiter::{RateLimitDecision, RateLimitMetricsSnapshot, RateLimiter, WindowCheck, WindowUsage};
pub use middleware::{rate_limit_middleware, RateLimitState};
pub use policy::{PolicyEntry, PolicyKey, PolicyTable, RateLimitPolicy, ResolvedPolicy};
pub use token_bucket::{BucketDecision, BucketState, TokenBucketLimiter};

use crate::store::StoreError;
use thiserror::Error;

/// Errors that can occur during rate limiting operations
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("No rate limit policy for {key}")]
    PolicyNotFound { key: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Invalid {field}: {reason}")]
    InvalidRequest { field: String, reason: String },
}

pub type RateLimitResult<T> = Result<T, RateLimitError>;
