//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use outreach_edge::core::clock::ManualClock;
use outreach_edge::store::{KvStore, MemoryInfo, StoreError, StoreOp, StoreReply, StoreResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A minute boundary: 2023-11-14T22:14:00Z
pub const MINUTE_BOUNDARY: i64 = 1_700_000_040;

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::at_unix(MINUTE_BOUNDARY))
}

/// Store whose every operation fails as if the backend were down
#[derive(Debug, Default)]
pub struct UnreachableStore {
    pub calls: AtomicU64,
}

impl UnreachableStore {
    fn fail<T>(&self) -> StoreResult<T> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Err(StoreError::unavailable("connection refused"))
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl KvStore for UnreachableStore {
    async fn get(&self, _key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.fail()
    }

    async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> StoreResult<()> {
        self.fail()
    }

    async fn delete(&self, _key: &str) -> StoreResult<bool> {
        self.fail()
    }

    async fn increment(&self, _key: &str, _amount: i64, _ttl_if_new: Duration) -> StoreResult<i64> {
        self.fail()
    }

    async fn scan(&self, _pattern: &str) -> StoreResult<Vec<String>> {
        self.fail()
    }

    async fn pipeline(&self, _ops: Vec<StoreOp>) -> StoreResult<Vec<StoreReply>> {
        self.fail()
    }

    async fn set_add(&self, _key: &str, _member: &str, _ttl: Duration) -> StoreResult<()> {
        self.fail()
    }

    async fn set_members(&self, _key: &str) -> StoreResult<Vec<String>> {
        self.fail()
    }

    async fn set_remove(&self, _key: &str, _member: &str) -> StoreResult<bool> {
        self.fail()
    }

    async fn memory_info(&self) -> StoreResult<MemoryInfo> {
        self.fail()
    }

    async fn ping(&self) -> StoreResult<()> {
        self.fail()
    }

    fn backend_name(&self) -> &'static str {
        "unreachable"
    }
}
