//! # Application Context
//!
//! Every shared component is built once at startup and owned here: the store
//! connection pool, the cache manager, the limiters and the warming
//! scheduler. Handlers and middleware receive the pieces they need through
//! axum state, so there is no global mutable state and tests can inject their
//! own store and clock.

use crate::caching::{CacheManager, CacheNamespace, CacheWarmer, StaticWarmSource, WarmSource};
use crate::core::clock::{Clock, SystemClock};
use crate::core::config::{EdgeConfig, StoreBackend};
use crate::core::error::{EdgeError, EdgeResult};
use crate::rate_limiting::{DailyQuota, PolicyTable, RateLimiter, TokenBucketLimiter};
use crate::store::{InMemoryStore, KvStore, RedisStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Sweep interval for the in-memory backend
const MEMORY_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Shared components of a running edge service
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<EdgeConfig>,
    pub store: Arc<dyn KvStore>,
    pub clock: Arc<dyn Clock>,
    pub cache: Arc<CacheManager>,
    pub policies: Arc<PolicyTable>,
    pub rate_limiter: Arc<RateLimiter>,
    pub token_bucket: Arc<TokenBucketLimiter>,
    pub email_quota: Arc<DailyQuota>,
    pub warmer: Arc<CacheWarmer>,
}

impl AppContext {
    /// Connect to the configured store and assemble every component
    pub async fn build(config: EdgeConfig) -> EdgeResult<Self> {
        let store: Arc<dyn KvStore> = match config.store.backend {
            StoreBackend::Redis => Arc::new(
                RedisStore::connect(
                    &config.store.url,
                    config.store.pool_size,
                    config.store.operation_timeout,
                )
                .await?,
            ),
            StoreBackend::Memory => Arc::new(InMemoryStore::with_cleanup(MEMORY_CLEANUP_INTERVAL)),
        };
        info!(backend = store.backend_name(), "Key-value store ready");

        Self::with_store(config, store, Arc::new(SystemClock))
    }

    /// Assemble components around an existing store and clock, warming from config
    pub fn with_store(config: EdgeConfig, store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> EdgeResult<Self> {
        let source = Arc::new(StaticWarmSource::from_config(&config.warming));
        Self::with_parts(config, store, clock, source)
    }

    /// Fully injected constructor
    pub fn with_parts(
        config: EdgeConfig,
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        warm_source: Arc<dyn WarmSource>,
    ) -> EdgeResult<Self> {
        let prefix = config.store.key_prefix.as_str();

        let cache = CacheNamespace::ALL.iter().fold(
            CacheManager::new(store.clone(), clock.clone())
                .with_key_prefix(prefix)
                .with_compression_threshold(config.cache.compression_threshold),
            |cache, ns| cache.with_namespace_ttl(*ns, config.cache.ttl_for(*ns)),
        );
        let cache = Arc::new(cache);

        let policies = PolicyTable::from_config(&config.rate_limit).map_err(EdgeError::from)?;
        let rate_limiter = RateLimiter::new(store.clone(), clock.clone(), prefix);
        let token_bucket = TokenBucketLimiter::new(
            store.clone(),
            clock.clone(),
            prefix,
            config.rate_limit.token_bucket.clone(),
        );
        let email_quota = DailyQuota::new(
            store.clone(),
            clock.clone(),
            prefix,
            config.rate_limit.email_quota.clone(),
        );
        let warmer = CacheWarmer::new(cache.clone(), warm_source, config.warming.interval);

        Ok(Self {
            config: Arc::new(config),
            store,
            clock,
            cache,
            policies: Arc::new(policies),
            rate_limiter: Arc::new(rate_limiter),
            token_bucket: Arc::new(token_bucket),
            email_quota: Arc::new(email_quota),
            warmer: Arc::new(warmer),
        })
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("backend", &self.store.backend_name())
            .field("cache", &self.cache)
            .finish()
    }
}
