//! # In-Memory Store
//!
//! Process-local [`KvStore`] built on `DashMap`. Expiry is enforced lazily on
//! access and, optionally, by a background sweeper. Increments run under the
//! shard lock of the entry API, so concurrent increments never lose updates.

use super::{glob_to_regex, human_bytes, KvStore, MemoryInfo, StoreError, StoreOp, StoreReply, StoreResult};
use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::debug;

#[derive(Debug, Clone)]
enum StoredValue {
    Bytes(Vec<u8>),
    Set(HashSet<String>),
}

impl StoredValue {
    fn size(&self) -> usize {
        match self {
            Self::Bytes(bytes) => bytes.len(),
            Self::Set(members) => members.iter().map(|m| m.len()).sum(),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn new(value: StoredValue, ttl: Duration, now: Instant) -> Self {
        Self {
            value,
            expires_at: expiry_from(ttl, now),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

fn expiry_from(ttl: Duration, now: Instant) -> Option<Instant> {
    if ttl.is_zero() {
        None
    } else {
        Some(now + ttl)
    }
}

fn entry_size(key: &str, entry: &StoredEntry) -> u64 {
    (key.len() + entry.value.size()) as u64
}

/// In-memory key-value store
pub struct InMemoryStore {
    entries: Arc<DashMap<String, StoredEntry>>,

    /// Key and value bytes currently held, expired-but-unswept entries included
    used_bytes: Arc<AtomicU64>,
    peak_bytes: AtomicU64,
    _cleanup_task: Option<tokio::task::JoinHandle<()>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create a store that expires entries lazily on access
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            used_bytes: Arc::new(AtomicU64::new(0)),
            peak_bytes: AtomicU64::new(0),
            _cleanup_task: None,
        }
    }

    /// Create a store with a background sweeper. Must be called inside a Tokio runtime.
    pub fn with_cleanup(cleanup_interval: Duration) -> Self {
        let entries: Arc<DashMap<String, StoredEntry>> = Arc::new(DashMap::new());
        let used_bytes = Arc::new(AtomicU64::new(0));

        let cleanup_task = {
            let entries = entries.clone();
            let used_bytes = used_bytes.clone();
            tokio::spawn(async move {
                let mut ticker = interval(cleanup_interval);
                loop {
                    ticker.tick().await;
                    let now = Instant::now();
                    let mut removed = 0usize;
                    entries.retain(|key, entry| {
                        if !entry.is_expired(now) {
                            return true;
                        }
                        release(&used_bytes, entry_size(key, entry));
                        removed += 1;
                        false
                    });
                    if removed > 0 {
                        debug!("Swept {} expired in-memory store entries", removed);
                    }
                }
            })
        };

        Self {
            entries,
            used_bytes,
            peak_bytes: AtomicU64::new(0),
            _cleanup_task: Some(cleanup_task),
        }
    }

    /// Number of live (unexpired) keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.value().is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }

    fn reserve(&self, bytes: u64) {
        let used = self.used_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak_bytes.fetch_max(used, Ordering::Relaxed);
    }

    fn resize(&self, before: u64, after: u64) {
        if after >= before {
            self.reserve(after - before);
        } else {
            release(&self.used_bytes, before - after);
        }
    }

    fn remove_expired(&self, key: &str, now: Instant) {
        if let Some((key, entry)) = self.entries.remove_if(key, |_, entry| entry.is_expired(now)) {
            release(&self.used_bytes, entry_size(&key, &entry));
        }
    }

    fn get_sync(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                return match &entry.value {
                    StoredValue::Bytes(bytes) => Ok(Some(bytes.clone())),
                    StoredValue::Set(_) => Err(StoreError::WrongType {
                        key: key.to_string(),
                    }),
                }
            }
        };
        if expired {
            self.remove_expired(key, now);
        }
        Ok(None)
    }

    fn set_sync(&self, key: &str, value: &[u8], ttl: Duration) {
        let entry = StoredEntry::new(StoredValue::Bytes(value.to_vec()), ttl, Instant::now());
        let size = entry_size(key, &entry);
        let previous = self.entries.insert(key.to_string(), entry);
        self.resize(previous.map_or(0, |previous| entry_size(key, &previous)), size);
    }

    fn delete_sync(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.entries.remove(key) {
            Some((key, entry)) => {
                release(&self.used_bytes, entry_size(&key, &entry));
                !entry.is_expired(now)
            }
            None => false,
        }
    }

    fn increment_sync(&self, key: &str, amount: i64, ttl_if_new: Duration) -> StoreResult<i64> {
        let now = Instant::now();
        let mut created = false;
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| {
            created = true;
            StoredEntry::new(StoredValue::Bytes(b"0".to_vec()), ttl_if_new, now)
        });
        let before = if created { 0 } else { entry_size(key, &entry) };

        if entry.is_expired(now) {
            *entry = StoredEntry::new(StoredValue::Bytes(b"0".to_vec()), ttl_if_new, now);
        }

        let result = match &mut entry.value {
            StoredValue::Bytes(bytes) => {
                match std::str::from_utf8(bytes).ok().and_then(|s| s.trim().parse::<i64>().ok()) {
                    Some(current) => {
                        let next = current.saturating_add(amount);
                        *bytes = next.to_string().into_bytes();
                        Ok(next)
                    }
                    None => Err(StoreError::WrongType {
                        key: key.to_string(),
                    }),
                }
            }
            StoredValue::Set(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
        };

        let after = entry_size(key, &entry);
        drop(entry);
        self.resize(before, after);
        result
    }

    fn set_add_sync(&self, key: &str, member: &str, ttl: Duration) -> StoreResult<()> {
        let now = Instant::now();
        let mut created = false;
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| {
            created = true;
            StoredEntry::new(StoredValue::Set(HashSet::new()), ttl, now)
        });

        if created {
            self.reserve(key.len() as u64);
        } else if entry.is_expired(now) {
            release(&self.used_bytes, entry_size(key, &entry));
            *entry = StoredEntry::new(StoredValue::Set(HashSet::new()), ttl, now);
            self.reserve(key.len() as u64);
        }

        // Expiry only ever moves later so the index outlives what it indexes
        if let (Some(current), Some(wanted)) = (entry.expires_at, expiry_from(ttl, now)) {
            if wanted > current {
                entry.expires_at = Some(wanted);
            }
        }

        match &mut entry.value {
            StoredValue::Set(members) => {
                if members.insert(member.to_string()) {
                    self.reserve(member.len() as u64);
                }
                Ok(())
            }
            StoredValue::Bytes(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    fn set_remove_sync(&self, key: &str, member: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut remove_key = false;
        let removed = match self.entries.get_mut(key) {
            None => false,
            Some(entry) if entry.is_expired(now) => false,
            Some(mut entry) => match &mut entry.value {
                StoredValue::Set(members) => {
                    let removed = members.remove(member);
                    if removed {
                        release(&self.used_bytes, member.len() as u64);
                    }
                    remove_key = members.is_empty();
                    removed
                }
                StoredValue::Bytes(_) => {
                    return Err(StoreError::WrongType {
                        key: key.to_string(),
                    })
                }
            },
        };
        if remove_key {
            let emptied = self.entries.remove_if(key, |_, entry| {
                matches!(&entry.value, StoredValue::Set(members) if members.is_empty())
            });
            if let Some((key, entry)) = emptied {
                release(&self.used_bytes, entry_size(&key, &entry));
            }
        }
        Ok(removed)
    }
}

fn release(used_bytes: &AtomicU64, bytes: u64) {
    let _ = used_bytes.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
        Some(used.saturating_sub(bytes))
    });
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.get_sync(key)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        self.set_sync(key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.delete_sync(key))
    }

    async fn increment(&self, key: &str, amount: i64, ttl_if_new: Duration) -> StoreResult<i64> {
        self.increment_sync(key, amount, ttl_if_new)
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let matcher = Regex::new(&glob_to_regex(pattern))
            .map_err(|e| StoreError::unavailable(format!("invalid scan pattern: {}", e)))?;
        let now = Instant::now();

        Ok(self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired(now) && matcher.is_match(e.key()))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn pipeline(&self, ops: Vec<StoreOp>) -> StoreResult<Vec<StoreReply>> {
        let mut replies = Vec::with_capacity(ops.len());
        for op in ops {
            let reply = match op {
                StoreOp::Get { key } => StoreReply::Value(self.get_sync(&key)?),
                StoreOp::Set { key, value, ttl } => {
                    self.set_sync(&key, &value, ttl);
                    StoreReply::Done
                }
                StoreOp::Delete { key } => StoreReply::Removed(self.delete_sync(&key)),
                StoreOp::Increment {
                    key,
                    amount,
                    ttl_if_new,
                } => StoreReply::Integer(self.increment_sync(&key, amount, ttl_if_new)?),
                StoreOp::SetAdd { key, member, ttl } => {
                    self.set_add_sync(&key, &member, ttl)?;
                    StoreReply::Done
                }
                StoreOp::SetRemove { key, member } => {
                    StoreReply::Removed(self.set_remove_sync(&key, &member)?)
                }
            };
            replies.push(reply);
        }
        Ok(replies)
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> StoreResult<()> {
        self.set_add_sync(key, member, ttl)
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        match self.entries.get(key) {
            None => Ok(Vec::new()),
            Some(entry) if entry.is_expired(now) => Ok(Vec::new()),
            Some(entry) => match &entry.value {
                StoredValue::Set(members) => Ok(members.iter().cloned().collect()),
                StoredValue::Bytes(_) => Err(StoreError::WrongType {
                    key: key.to_string(),
                }),
            },
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.set_remove_sync(key, member)
    }

    async fn memory_info(&self) -> StoreResult<MemoryInfo> {
        let used = self.used_bytes();
        Ok(MemoryInfo {
            backend: self.backend_name().to_string(),
            used_memory_bytes: used,
            used_memory_human: human_bytes(used),
            peak_memory_bytes: self.peak_bytes.load(Ordering::Relaxed).max(used),
            fragmentation_ratio: None,
            key_count: Some(self.len() as u64),
        })
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_basic_operations() {
        let store = InMemoryStore::new();

        store.set("k1", b"v1", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k1").await.unwrap(), Some(b"v1".to_vec()));

        assert!(store.delete("k1").await.unwrap());
        assert!(!store.delete("k1").await.unwrap());
        assert_eq!(store.get("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiration() {
        let store = InMemoryStore::new();
        store.set("short", b"v", Duration::from_millis(50)).await.unwrap();
        assert!(store.get("short").await.unwrap().is_some());

        sleep(Duration::from_millis(80)).await;
        assert_eq!(store.get("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_increment_creates_then_adds() {
        let store = InMemoryStore::new();
        assert_eq!(store.increment("c", 3, Duration::from_secs(60)).await.unwrap(), 3);
        assert_eq!(store.increment("c", 2, Duration::from_secs(1)).await.unwrap(), 5);
        assert_eq!(store.increment("c", -5, Duration::from_secs(1)).await.unwrap(), 0);
        assert_eq!(store.get("c").await.unwrap(), Some(b"0".to_vec()));
    }

    #[tokio::test]
    async fn test_increment_restarts_after_expiry() {
        let store = InMemoryStore::new();
        store.increment("c", 1, Duration::from_millis(30)).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(store.increment("c", 1, Duration::from_secs(60)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(InMemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.increment("shared", 1, Duration::from_secs(60)).await.unwrap()
            }));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results.sort_unstable();
        assert_eq!(results, (1..=50).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_increment_on_non_integer_is_wrong_type() {
        let store = InMemoryStore::new();
        store.set("text", b"hello", Duration::from_secs(60)).await.unwrap();
        let err = store.increment("text", 1, Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, StoreError::WrongType { .. }));
    }

    #[tokio::test]
    async fn test_scan_matches_glob() {
        let store = InMemoryStore::new();
        store.set("edge:a:1", b"x", Duration::from_secs(60)).await.unwrap();
        store.set("edge:a:2", b"x", Duration::from_secs(60)).await.unwrap();
        store.set("edge:b:1", b"x", Duration::from_secs(60)).await.unwrap();

        let mut keys = store.scan("edge:a:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["edge:a:1".to_string(), "edge:a:2".to_string()]);
    }

    #[tokio::test]
    async fn test_sets() {
        let store = InMemoryStore::new();
        store.set_add("tags:t", "k1", Duration::from_secs(60)).await.unwrap();
        store.set_add("tags:t", "k2", Duration::from_secs(60)).await.unwrap();

        let mut members = store.set_members("tags:t").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["k1".to_string(), "k2".to_string()]);

        assert!(store.set_remove("tags:t", "k1").await.unwrap());
        assert!(!store.set_remove("tags:t", "k1").await.unwrap());
        assert!(store.set_remove("tags:t", "k2").await.unwrap());
        assert!(store.set_members("tags:t").await.unwrap().is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_replies_in_order() {
        let store = InMemoryStore::new();
        let replies = store
            .pipeline(vec![
                StoreOp::Set {
                    key: "a".into(),
                    value: b"1".to_vec(),
                    ttl: Duration::from_secs(60),
                },
                StoreOp::Get { key: "a".into() },
                StoreOp::Get { key: "missing".into() },
                StoreOp::Increment {
                    key: "a".into(),
                    amount: 4,
                    ttl_if_new: Duration::from_secs(60),
                },
                StoreOp::Delete { key: "a".into() },
            ])
            .await
            .unwrap();

        assert_eq!(
            replies,
            vec![
                StoreReply::Done,
                StoreReply::Value(Some(b"1".to_vec())),
                StoreReply::Value(None),
                StoreReply::Integer(5),
                StoreReply::Removed(true),
            ]
        );
    }

    #[tokio::test]
    async fn test_memory_info() {
        let store = InMemoryStore::new();
        store.set("key", b"value", Duration::from_secs(60)).await.unwrap();
        let info = store.memory_info().await.unwrap();
        assert_eq!(info.backend, "memory");
        assert_eq!(info.key_count, Some(1));
        assert_eq!(info.used_memory_bytes, 8);
    }

    #[tokio::test]
    async fn test_memory_accounting_follows_writes_and_removals() {
        let store = InMemoryStore::new();
        store.set("k1", b"0123456789", Duration::from_secs(60)).await.unwrap();
        store.set("k2", b"abc", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.memory_info().await.unwrap().used_memory_bytes, 12 + 5);

        // Overwrite with a shorter value
        store.set("k1", b"x", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.memory_info().await.unwrap().used_memory_bytes, 3 + 5);

        store.increment("n", 100, Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.memory_info().await.unwrap().used_memory_bytes, 3 + 5 + 4);

        store.set_add("tags", "k1", Duration::from_secs(60)).await.unwrap();
        store.set_add("tags", "k1", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.memory_info().await.unwrap().used_memory_bytes, 3 + 5 + 4 + 6);

        store.set_remove("tags", "k1").await.unwrap();
        store.delete("k1").await.unwrap();
        store.delete("k2").await.unwrap();
        store.delete("n").await.unwrap();

        let info = store.memory_info().await.unwrap();
        assert_eq!(info.used_memory_bytes, 0);
        // Highest point: k1 shortened, counter and tag set added
        assert_eq!(info.peak_memory_bytes, 18);
    }

    #[tokio::test]
    async fn test_expired_entries_release_memory() {
        let store = InMemoryStore::new();
        store.set("short", b"value", Duration::from_millis(20)).await.unwrap();
        sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("short").await.unwrap(), None);
        assert_eq!(store.memory_info().await.unwrap().used_memory_bytes, 0);
    }
}
