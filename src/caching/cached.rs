//! # Caching Wrappers
//!
//! Higher-order helpers that add caching around an existing async operation
//! without touching it: [`Cached`] reads through the cache, and
//! [`InvalidateAfter`] runs the operation then drops the cache entries it
//! made stale.

use super::{CacheError, CacheManager, CacheNamespace};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Read-through cache around an async operation
///
/// ```ignore
/// let lookup = Cached::new(cache, CacheNamespace::LeadEnrichment, |email: &String| email.clone(), enrich_lead)
///     .with_ttl(Duration::from_secs(3600));
/// let lead = lookup.call("ceo@example.com".to_string()).await?;
/// ```
pub struct Cached<K, F> {
    cache: Arc<CacheManager>,
    namespace: CacheNamespace,
    ttl: Option<Duration>,
    key_fn: K,
    operation: F,
}

impl<K, F> Cached<K, F> {
    pub fn new(cache: Arc<CacheManager>, namespace: CacheNamespace, key_fn: K, operation: F) -> Self {
        Self {
            cache,
            namespace,
            ttl: None,
            key_fn,
            operation,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Return the cached result for `arg`, or run the operation and cache its
    /// successful result. Errors from the operation are never cached.
    pub async fn call<A, T, E, Fut>(&self, arg: A) -> Result<T, E>
    where
        K: Fn(&A) -> String,
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
    {
        let key = (self.key_fn)(&arg);
        if let Some(hit) = self.cache.get::<T>(&key, self.namespace).await {
            return Ok(hit);
        }

        let value = (self.operation)(arg).await?;
        self.cache
            .set(&key, &value, self.ttl, self.namespace)
            .await
            .map_err(E::from)?;
        debug!(namespace = self.namespace.as_str(), key = %key, "Cached operation result");
        Ok(value)
    }
}

/// Runs an operation, then deletes the cache patterns derived from its argument
pub struct InvalidateAfter<P, F> {
    cache: Arc<CacheManager>,
    namespace: CacheNamespace,
    patterns: P,
    operation: F,
}

impl<P, F> InvalidateAfter<P, F> {
    pub fn new(cache: Arc<CacheManager>, namespace: CacheNamespace, patterns: P, operation: F) -> Self {
        Self {
            cache,
            namespace,
            patterns,
            operation,
        }
    }

    /// Invalidation only happens when the operation succeeds; a failed
    /// invalidation is logged and does not change the result.
    pub async fn call<A, T, E, Fut>(&self, arg: A) -> Result<T, E>
    where
        P: Fn(&A) -> Vec<String>,
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let patterns = (self.patterns)(&arg);
        let result = (self.operation)(arg).await?;

        for pattern in patterns {
            match self.cache.delete_pattern(&pattern, self.namespace).await {
                Ok(removed) => debug!(namespace = self.namespace.as_str(), pattern = %pattern, removed, "Invalidated after write"),
                Err(e) => warn!(namespace = self.namespace.as_str(), pattern = %pattern, error = %e, "Post-write invalidation failed"),
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::SystemClock;
    use crate::store::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> Arc<CacheManager> {
        Arc::new(CacheManager::new(Arc::new(InMemoryStore::new()), Arc::new(SystemClock)))
    }

    #[tokio::test]
    async fn test_cached_runs_operation_once() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let lookup = Cached::new(
            cache,
            CacheNamespace::LeadEnrichment,
            |id: &u32| format!("lead:{}", id),
            move |id: u32| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, CacheError>(format!("lead-{}", id))
                }
            },
        );

        assert_eq!(lookup.call(7).await.unwrap(), "lead-7");
        assert_eq!(lookup.call(7).await.unwrap(), "lead-7");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_does_not_store_errors() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let failing = Cached::new(
            cache,
            CacheNamespace::AiResponses,
            |prompt: &String| prompt.clone(),
            move |_prompt: String| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<String, CacheError>(CacheError::Configuration {
                        message: "model offline".to_string(),
                    })
                }
            },
        );

        assert!(failing.call("hello".to_string()).await.is_err());
        assert!(failing.call("hello".to_string()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_after_success() {
        let cache = cache();
        cache
            .set("ws-1:summary", &"stale", None, CacheNamespace::Analytics)
            .await
            .unwrap();

        let update = InvalidateAfter::new(
            cache.clone(),
            CacheNamespace::Analytics,
            |ws: &String| vec![format!("{}:*", ws)],
            |_ws: String| async { Ok::<_, CacheError>(()) },
        );
        update.call("ws-1".to_string()).await.unwrap();

        assert_eq!(cache.get::<String>("ws-1:summary", CacheNamespace::Analytics).await, None);
    }
}
