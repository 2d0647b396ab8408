//! # Cache Manager
//!
//! Namespaced cache over a [`KvStore`]. Values are serialized as JSON inside a
//! small envelope that records the absolute expiry and the entry's tags, then
//! gzip-compressed when large. Physical keys have the form
//! `{prefix}:{namespace}:{key}`; tag index sets live at `{prefix}:tags:{tag}`.
//!
//! Reads never fail: store errors, decode failures and envelopes past their
//! expiry are all misses. Writes swallow store errors and report `false`, but
//! serialization errors propagate because they indicate a caller bug.

use super::codec;
use super::{CacheError, CacheNamespace, CacheResult};
use crate::core::clock::Clock;
use crate::observability::metrics as metric_names;
use crate::store::{KvStore, MemoryInfo, StoreOp};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Default payload size above which `CompressMode::Auto` compresses
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

const ENVELOPE_VERSION: u8 = 1;
const BATCH_SIZE: usize = 500;

/// Compression choice for a single write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressMode {
    /// Compress when the serialized entry exceeds the configured threshold
    #[default]
    Auto,
    Always,
    Never,
}

/// Options for [`CacheManager::set_with`]
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// `None` uses the namespace TTL; zero means "do not cache"
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    pub compress: CompressMode,
}

impl SetOptions {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn compress(mut self, mode: CompressMode) -> Self {
        self.compress = mode;
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEnvelope {
    v: u8,
    value: Value,
    /// Absolute expiry, unix milliseconds
    expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
}

#[derive(Debug, Default)]
struct NamespaceCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    store_errors: AtomicU64,
}

/// Per-namespace statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamespaceStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub sets: u64,
    pub store_errors: u64,

    /// Live keys found by scanning the namespace; absent if the scan failed
    pub key_count: Option<u64>,
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub sets: u64,
    pub store_errors: u64,
    pub namespaces: BTreeMap<String, NamespaceStats>,
    pub started_at: DateTime<Utc>,
}

/// Result of a store connectivity probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheHealth {
    pub healthy: bool,
    pub backend: String,
    pub latency_ms: f64,
    pub error: Option<String>,
}

fn ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Namespaced cache manager
pub struct CacheManager {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    compression_threshold: usize,
    namespace_ttls: HashMap<CacheNamespace, Duration>,
    counters: [NamespaceCounters; 8],
    started_at: DateTime<Utc>,
}

impl CacheManager {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now();
        Self {
            store,
            clock,
            key_prefix: "edge".to_string(),
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            namespace_ttls: HashMap::new(),
            counters: Default::default(),
            started_at,
        }
    }

    pub fn with_key_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Override the TTL used for `namespace` when a caller passes none
    pub fn with_namespace_ttl(mut self, namespace: CacheNamespace, ttl: Duration) -> Self {
        self.namespace_ttls.insert(namespace, ttl);
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn namespace_ttl(&self, namespace: CacheNamespace) -> Duration {
        self.namespace_ttls
            .get(&namespace)
            .copied()
            .unwrap_or_else(|| namespace.default_ttl())
    }

    /// Physical store key for a logical key
    pub fn physical_key(&self, namespace: CacheNamespace, key: &str) -> String {
        format!("{}:{}:{}", self.key_prefix, namespace.as_str(), key)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}:tags:{}", self.key_prefix, tag)
    }

    fn counters(&self, namespace: CacheNamespace) -> &NamespaceCounters {
        &self.counters[namespace.index()]
    }

    fn record_hit(&self, namespace: CacheNamespace) {
        self.counters(namespace).hits.fetch_add(1, Ordering::Relaxed);
        counter!(metric_names::CACHE_HITS_TOTAL, "namespace" => namespace.as_str()).increment(1);
    }

    fn record_miss(&self, namespace: CacheNamespace) {
        self.counters(namespace).misses.fetch_add(1, Ordering::Relaxed);
        counter!(metric_names::CACHE_MISSES_TOTAL, "namespace" => namespace.as_str()).increment(1);
    }

    fn record_store_error(&self, namespace: CacheNamespace) {
        self.counters(namespace).store_errors.fetch_add(1, Ordering::Relaxed);
        counter!(metric_names::CACHE_STORE_ERRORS_TOTAL, "namespace" => namespace.as_str()).increment(1);
    }

    fn decode_envelope(bytes: &[u8]) -> CacheResult<CacheEnvelope> {
        let raw = codec::decompress(bytes)?;
        match serde_json::from_slice::<CacheEnvelope>(&raw) {
            Ok(envelope) if envelope.v == ENVELOPE_VERSION => Ok(envelope),
            // Counters written through `increment` are bare JSON numbers
            _ => Ok(CacheEnvelope {
                v: ENVELOPE_VERSION,
                value: serde_json::from_slice(&raw)?,
                expires_at: None,
                tags: Vec::new(),
            }),
        }
    }

    fn encode_envelope(&self, envelope: &CacheEnvelope, compress: CompressMode) -> CacheResult<Vec<u8>> {
        let bytes = serde_json::to_vec(envelope)?;
        let should_compress = match compress {
            CompressMode::Always => true,
            CompressMode::Never => false,
            CompressMode::Auto => bytes.len() > self.compression_threshold,
        };
        if should_compress {
            codec::compress(&bytes)
        } else {
            Ok(bytes)
        }
    }

    /// Turn raw bytes into a value, treating every failure as a miss
    fn read_value<T: DeserializeOwned>(
        &self,
        namespace: CacheNamespace,
        key: &str,
        bytes: Option<Vec<u8>>,
    ) -> Option<T> {
        let Some(bytes) = bytes else {
            self.record_miss(namespace);
            debug!(namespace = namespace.as_str(), key, "Cache miss");
            return None;
        };

        let envelope = match Self::decode_envelope(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(namespace = namespace.as_str(), key, error = %e, "Undecodable cache entry treated as miss");
                self.record_miss(namespace);
                return None;
            }
        };

        if let Some(expires_at) = envelope.expires_at {
            if expires_at <= self.clock.now_millis() {
                debug!(namespace = namespace.as_str(), key, "Cache entry past expiry treated as miss");
                self.record_miss(namespace);
                return None;
            }
        }

        match serde_json::from_value::<T>(envelope.value) {
            Ok(value) => {
                self.record_hit(namespace);
                debug!(namespace = namespace.as_str(), key, "Cache hit");
                Some(value)
            }
            Err(e) => {
                warn!(namespace = namespace.as_str(), key, error = %e, "Cache entry has unexpected shape, treated as miss");
                self.record_miss(namespace);
                None
            }
        }
    }

    /// Fetch a value. Misses, store failures and decode failures all return `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str, namespace: CacheNamespace) -> Option<T> {
        let physical = self.physical_key(namespace, key);
        match self.store.get(&physical).await {
            Ok(bytes) => self.read_value(namespace, key, bytes),
            Err(e) => {
                error!(namespace = namespace.as_str(), key, error = %e, "Cache read failed, treating as miss");
                self.record_store_error(namespace);
                self.record_miss(namespace);
                None
            }
        }
    }

    /// Store a value with the namespace defaults for tags and compression
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        namespace: CacheNamespace,
    ) -> CacheResult<bool> {
        self.set_with(
            key,
            value,
            namespace,
            SetOptions {
                ttl,
                ..Default::default()
            },
        )
        .await
    }

    /// Store a value. Returns `Ok(false)` when nothing was written, either
    /// because the TTL is zero or because the store is unavailable.
    pub async fn set_with<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        namespace: CacheNamespace,
        options: SetOptions,
    ) -> CacheResult<bool> {
        let ttl = options.ttl.unwrap_or_else(|| self.namespace_ttl(namespace));
        if ttl.is_zero() {
            debug!(namespace = namespace.as_str(), key, "Zero TTL, not caching");
            return Ok(false);
        }

        let envelope = CacheEnvelope {
            v: ENVELOPE_VERSION,
            value: serde_json::to_value(value)?,
            expires_at: Some(self.clock.now_millis() + ttl.as_millis() as i64),
            tags: options.tags,
        };
        let bytes = self.encode_envelope(&envelope, options.compress)?;
        let physical = self.physical_key(namespace, key);

        let written = if envelope.tags.is_empty() {
            self.store.set(&physical, &bytes, ttl).await
        } else {
            let mut ops = Vec::with_capacity(envelope.tags.len() + 1);
            ops.push(StoreOp::Set {
                key: physical.clone(),
                value: bytes,
                ttl,
            });
            for tag in &envelope.tags {
                ops.push(StoreOp::SetAdd {
                    key: self.tag_key(tag),
                    member: physical.clone(),
                    ttl,
                });
            }
            self.store.pipeline(ops).await.map(|_| ())
        };

        match written {
            Ok(()) => {
                self.counters(namespace).sets.fetch_add(1, Ordering::Relaxed);
                debug!(namespace = namespace.as_str(), key, ttl_secs = ttl.as_secs(), "Cache set");
                Ok(true)
            }
            Err(e) => {
                error!(namespace = namespace.as_str(), key, error = %e, "Cache write failed, value not cached");
                self.record_store_error(namespace);
                Ok(false)
            }
        }
    }

    /// Fetch several keys in one round-trip
    pub async fn get_many<T: DeserializeOwned>(
        &self,
        keys: &[&str],
        namespace: CacheNamespace,
    ) -> HashMap<String, Option<T>> {
        let mut results = HashMap::with_capacity(keys.len());
        if keys.is_empty() {
            return results;
        }

        let ops = keys
            .iter()
            .map(|key| StoreOp::Get {
                key: self.physical_key(namespace, key),
            })
            .collect();

        match self.store.pipeline(ops).await {
            Ok(replies) => {
                for (key, reply) in keys.iter().zip(replies) {
                    let value = self.read_value(namespace, key, reply.into_value());
                    results.insert(key.to_string(), value);
                }
            }
            Err(e) => {
                error!(namespace = namespace.as_str(), count = keys.len(), error = %e, "Cache bulk read failed, treating as misses");
                self.record_store_error(namespace);
                for key in keys {
                    self.record_miss(namespace);
                    results.insert(key.to_string(), None);
                }
            }
        }
        results
    }

    /// Store several values with one TTL in one round-trip
    pub async fn set_many<T: Serialize>(
        &self,
        entries: &HashMap<String, T>,
        ttl: Option<Duration>,
        namespace: CacheNamespace,
    ) -> CacheResult<bool> {
        let ttl = ttl.unwrap_or_else(|| self.namespace_ttl(namespace));
        if ttl.is_zero() || entries.is_empty() {
            return Ok(false);
        }

        let expires_at = Some(self.clock.now_millis() + ttl.as_millis() as i64);
        let mut ops = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let envelope = CacheEnvelope {
                v: ENVELOPE_VERSION,
                value: serde_json::to_value(value)?,
                expires_at,
                tags: Vec::new(),
            };
            ops.push(StoreOp::Set {
                key: self.physical_key(namespace, key),
                value: self.encode_envelope(&envelope, CompressMode::Auto)?,
                ttl,
            });
        }

        match self.store.pipeline(ops).await {
            Ok(_) => {
                self.counters(namespace)
                    .sets
                    .fetch_add(entries.len() as u64, Ordering::Relaxed);
                Ok(true)
            }
            Err(e) => {
                error!(namespace = namespace.as_str(), count = entries.len(), error = %e, "Cache bulk write failed");
                self.record_store_error(namespace);
                Ok(false)
            }
        }
    }

    /// Atomically add `by` to a counter. `ttl` applies only when the counter
    /// is created; `None` uses the namespace TTL.
    pub async fn increment(
        &self,
        key: &str,
        namespace: CacheNamespace,
        by: i64,
        ttl: Option<Duration>,
    ) -> CacheResult<i64> {
        let ttl = ttl.unwrap_or_else(|| self.namespace_ttl(namespace));
        let physical = self.physical_key(namespace, key);
        self.store.increment(&physical, by, ttl).await.map_err(|e| {
            self.record_store_error(namespace);
            CacheError::from(e)
        })
    }

    /// Remove one entry and its tag memberships
    pub async fn delete(&self, key: &str, namespace: CacheNamespace) -> CacheResult<bool> {
        let removed = self.delete_physical(vec![self.physical_key(namespace, key)], None).await?;
        Ok(removed > 0)
    }

    /// Remove every entry in `namespace` whose logical key matches `pattern`
    pub async fn delete_pattern(&self, pattern: &str, namespace: CacheNamespace) -> CacheResult<u64> {
        let keys = self.store.scan(&self.physical_key(namespace, pattern)).await?;
        let removed = self.delete_physical(keys, None).await?;
        info!(namespace = namespace.as_str(), pattern, removed, "Deleted cache entries by pattern");
        Ok(removed)
    }

    /// Remove every entry carrying `tag`, then the tag index itself.
    /// Members that already expired, or were rewritten without the tag, are
    /// skipped.
    pub async fn delete_by_tag(&self, tag: &str) -> CacheResult<u64> {
        let tag_key = self.tag_key(tag);
        let members = self.store.set_members(&tag_key).await?;
        let removed = self.delete_physical(members, Some(tag)).await?;
        self.store.delete(&tag_key).await?;
        info!(tag, removed, "Deleted cache entries by tag");
        Ok(removed)
    }

    /// Remove every entry in a namespace
    pub async fn clear_namespace(&self, namespace: CacheNamespace) -> CacheResult<u64> {
        self.delete_pattern("*", namespace).await
    }

    /// Delete physical keys in batches: one round-trip to learn their tags,
    /// one to delete them together with their tag memberships. With
    /// `required_tag`, entries whose envelope lacks that tag are left alone.
    async fn delete_physical(&self, keys: Vec<String>, required_tag: Option<&str>) -> CacheResult<u64> {
        let mut removed = 0;
        for chunk in keys.chunks(BATCH_SIZE) {
            let reads = chunk.iter().map(|key| StoreOp::Get { key: key.clone() }).collect();
            let replies = self.store.pipeline(reads).await?;

            let mut ops = Vec::with_capacity(chunk.len());
            for (key, reply) in chunk.iter().zip(replies) {
                let tags = reply
                    .into_value()
                    .and_then(|bytes| Self::decode_envelope(&bytes).ok())
                    .map(|envelope| envelope.tags)
                    .unwrap_or_default();
                if let Some(required) = required_tag {
                    if !tags.iter().any(|tag| tag == required) {
                        continue;
                    }
                }

                ops.push(StoreOp::Delete { key: key.clone() });
                for tag in tags {
                    ops.push(StoreOp::SetRemove {
                        key: self.tag_key(&tag),
                        member: key.clone(),
                    });
                }
            }

            let replies = self.store.pipeline(ops.clone()).await?;
            removed += ops
                .iter()
                .zip(replies.iter())
                .filter(|(op, reply)| matches!(op, StoreOp::Delete { .. }) && reply.removed())
                .count() as u64;
        }
        Ok(removed)
    }

    /// Hit/miss statistics, optionally limited to one namespace. Key counts
    /// come from a scan and are omitted when the store is unreachable.
    pub async fn get_stats(&self, namespace: Option<CacheNamespace>) -> CacheStats {
        let selected: Vec<CacheNamespace> = match namespace {
            Some(ns) => vec![ns],
            None => CacheNamespace::ALL.to_vec(),
        };

        let mut stats = CacheStats {
            hits: 0,
            misses: 0,
            hit_ratio: 0.0,
            sets: 0,
            store_errors: 0,
            namespaces: BTreeMap::new(),
            started_at: self.started_at,
        };

        for ns in selected {
            let counters = self.counters(ns);
            let hits = counters.hits.load(Ordering::Relaxed);
            let misses = counters.misses.load(Ordering::Relaxed);
            let sets = counters.sets.load(Ordering::Relaxed);
            let store_errors = counters.store_errors.load(Ordering::Relaxed);

            let key_count = match self.store.scan(&self.physical_key(ns, "*")).await {
                Ok(keys) => Some(keys.len() as u64),
                Err(e) => {
                    warn!(namespace = ns.as_str(), error = %e, "Could not count cache keys");
                    None
                }
            };

            stats.hits += hits;
            stats.misses += misses;
            stats.sets += sets;
            stats.store_errors += store_errors;
            stats.namespaces.insert(
                ns.as_str().to_string(),
                NamespaceStats {
                    hits,
                    misses,
                    hit_ratio: ratio(hits, misses),
                    sets,
                    store_errors,
                    key_count,
                },
            );
        }

        stats.hit_ratio = ratio(stats.hits, stats.misses);
        stats
    }

    /// Memory figures reported by the store
    pub async fn get_memory_usage(&self) -> CacheResult<MemoryInfo> {
        Ok(self.store.memory_info().await?)
    }

    /// Ping the store and time the round-trip
    pub async fn health_check(&self) -> CacheHealth {
        let started = Instant::now();
        let result = self.store.ping().await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(()) => CacheHealth {
                healthy: true,
                backend: self.store.backend_name().to_string(),
                latency_ms,
                error: None,
            },
            Err(e) => {
                warn!(error = %e, "Cache store health check failed");
                CacheHealth {
                    healthy: false,
                    backend: self.store.backend_name().to_string(),
                    latency_ms,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("backend", &self.store.backend_name())
            .field("key_prefix", &self.key_prefix)
            .field("compression_threshold", &self.compression_threshold)
            .finish()
    }
}
