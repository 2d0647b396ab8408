//! # Caching
//!
//! Namespaced, tag-indexed, optionally compressed cache over the
//! [`KvStore`](crate::store::KvStore) adapter, plus everything that sits on
//! top of it:
//!
//! 1. **Cache Manager**: namespaced get/set, bulk operations, tag and pattern
//!    invalidation, statistics
//! 2. **Key derivation**: deterministic HTTP response keys
//! 3. **Wrappers**: [`Cached`] read-through and [`InvalidateAfter`] helpers
//! 4. **Middleware**: the HTTP response cache in front of the CRUD API
//! 5. **Warming**: background population of hot keys
//! 6. **Admin**: `/cache` management endpoints
//!
//! Cache outages never fail a request. Reads degrade to misses and writes to
//! no-ops; only caller mistakes (unknown namespace, unserializable value)
//! surface as errors.

pub mod admin;
pub mod cache_manager;
pub mod cached;
pub mod codec;
pub mod key_generator;
pub mod middleware;
pub mod namespace;
pub mod warming;

pub use admin::{CacheAdminRouter, CacheAdminState};
pub use cache_manager::{CacheHealth, CacheManager, CacheStats, CompressMode, NamespaceStats, SetOptions};
pub use cached::{Cached, InvalidateAfter};
pub use key_generator::HttpCacheKey;
pub use middleware::{http_cache_middleware, CachedHttpResponse, HttpCacheState};
pub use namespace::CacheNamespace;
pub use warming::{CacheWarmer, StaticWarmSource, WarmReport, WarmSource};

use crate::store::StoreError;

/// Cache operation result
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific error types
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression error: {message}")]
    Compression { message: String },

    #[error("Unknown cache namespace '{name}'")]
    InvalidNamespace { name: String },

    #[error("Cache configuration error: {message}")]
    Configuration { message: String },
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Compression {
            message: err.to_string(),
        }
    }
}
