//! # Key-Value Store Adapter
//!
//! Abstraction over the durable key-value store that backs the cache and the
//! rate limiters. Two implementations ship with the crate: [`RedisStore`]
//! for production and [`InMemoryStore`] for single-node deployments and tests.
//!
//! The adapter never retries. Every failure surfaces as a [`StoreError`] and
//! the caller decides whether to fail open (rate limiter), treat it as a miss
//! (cache reads) or report it (admin endpoints).

pub mod memory;
pub mod redis_store;

pub use memory::InMemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Store failures
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    /// Connection refused, reset, or any other I/O failure
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    /// The bounded operation timeout elapsed
    #[error("Store operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Operation applied to a key holding a different kind of value
    #[error("Wrong value type at key '{key}'")]
    WrongType { key: String },
}

impl StoreError {
    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Whether this error belongs to the "store unavailable" class
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.to_string().contains("WRONGTYPE") {
            return Self::WrongType {
                key: String::new(),
            };
        }
        if err.is_timeout() {
            return Self::Timeout { timeout_ms: 0 };
        }
        Self::Unavailable {
            message: err.to_string(),
        }
    }
}

/// A single operation in a pipelined batch
#[derive(Debug, Clone)]
pub enum StoreOp {
    Get { key: String },
    Set { key: String, value: Vec<u8>, ttl: Duration },
    Delete { key: String },
    Increment { key: String, amount: i64, ttl_if_new: Duration },
    SetAdd { key: String, member: String, ttl: Duration },
    SetRemove { key: String, member: String },
}

impl StoreOp {
    pub fn key(&self) -> &str {
        match self {
            Self::Get { key }
            | Self::Set { key, .. }
            | Self::Delete { key }
            | Self::Increment { key, .. }
            | Self::SetAdd { key, .. }
            | Self::SetRemove { key, .. } => key,
        }
    }
}

/// Reply to a pipelined operation, in the same position as its [`StoreOp`]
#[derive(Debug, Clone, PartialEq)]
pub enum StoreReply {
    Value(Option<Vec<u8>>),
    Done,
    Removed(bool),
    Integer(i64),
}

impl StoreReply {
    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            Self::Value(value) => value,
            _ => None,
        }
    }

    pub fn removed(&self) -> bool {
        matches!(self, Self::Removed(true))
    }
}

/// Memory figures reported by the store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryInfo {
    /// Backend that produced the report
    pub backend: String,

    /// Bytes currently in use
    pub used_memory_bytes: u64,

    /// Human readable form of `used_memory_bytes`
    pub used_memory_human: String,

    /// Peak bytes in use since start
    pub peak_memory_bytes: u64,

    /// Allocator fragmentation ratio, when reported
    pub fragmentation_ratio: Option<f64>,

    /// Number of live keys, when cheaply known
    pub key_count: Option<u64>,
}

/// Durable key-value store contract
///
/// A TTL of zero means "no expiry" for `set`, `increment` and `set_add`.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch raw bytes
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Write raw bytes with a TTL
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()>;

    /// Remove a key, reporting whether it existed
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Atomically add `amount`. An absent key is created at `amount` with
    /// `ttl_if_new`; an existing key keeps its TTL.
    async fn increment(&self, key: &str, amount: i64, ttl_if_new: Duration) -> StoreResult<i64>;

    /// Incrementally scan the keyspace for keys matching a glob pattern
    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Run a batch of operations in one round-trip
    async fn pipeline(&self, ops: Vec<StoreOp>) -> StoreResult<Vec<StoreReply>>;

    /// Add a member to a set, extending the set's expiry to at least `ttl`
    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> StoreResult<()>;

    /// All members of a set (empty when the set does not exist)
    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Remove a member from a set
    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Memory usage as reported by the backend
    async fn memory_info(&self) -> StoreResult<MemoryInfo>;

    /// Connectivity probe
    async fn ping(&self) -> StoreResult<()>;

    /// Short backend name for logs and health output
    fn backend_name(&self) -> &'static str;
}

/// Translate a store glob (`*`, `?`) into an anchored regular expression
pub(crate) fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    regex
}

/// Render a byte count the way the store's INFO output does
pub(crate) fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "K", "M", "G"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", bytes, UNITS[0])
    } else {
        format!("{:.2}{}", value, UNITS[unit])
    }
}
