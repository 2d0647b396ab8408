//! # Outreach Edge
//!
//! Caching and rate limiting layer that sits in front of the outreach CRUD
//! API. It owns:
//!
//! - a namespaced, tag-indexed cache over a key-value store ([`caching`])
//! - an HTTP response cache keyed by tenant, path, query and `Accept`
//! - dual fixed-window rate limiting with endpoint, plan and IP policies,
//!   plus a token bucket and a daily email quota ([`rate_limiting`])
//! - a background cache warming scheduler
//! - admin endpoints for all of the above
//!
//! Cache and limiter outages degrade to "uncached and unlimited"; they never
//! turn into client-facing errors.

/// Errors, configuration, clock, identity and the application context
pub mod core;

/// Key-value store adapter and its Redis and in-memory backends
pub mod store;

/// Cache manager, HTTP cache middleware, warming and cache admin
pub mod caching;

/// Rate limiters, policy resolution, quotas and rate limit admin
pub mod rate_limiting;

/// Logging and metrics setup
pub mod observability;

/// Router assembly and the server loop
pub mod server;

pub use crate::core::config::EdgeConfig;
pub use crate::core::context::AppContext;
pub use crate::core::error::{EdgeError, EdgeResult};
pub use server::EdgeServer;
