//! Per-workspace daily email quota
//!
//! One counter per workspace and UTC calendar day, stored under
//! `{prefix}:email_quota:{workspace}:{YYYY-MM-DD}` with a 24 hour TTL. A batch
//! is admitted whole or not at all: the counter is incremented by the batch
//! size and, if that overshoots the plan limit, decremented again.

use super::RateLimitResult;
use crate::core::clock::Clock;
use crate::core::config::EmailQuotaConfig;
use crate::store::KvStore;
use chrono::{DateTime, Days, NaiveTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const QUOTA_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub requested: u64,

    /// Emails counted today after this call
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,

    /// Next UTC midnight
    pub resets_at: DateTime<Utc>,
}

pub struct DailyQuota {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    config: EmailQuotaConfig,
}

impl DailyQuota {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, key_prefix: &str, config: EmailQuotaConfig) -> Self {
        Self {
            store,
            clock,
            key_prefix: key_prefix.to_string(),
            config,
        }
    }

    pub fn limit_for(&self, plan: &str) -> u64 {
        self.config.limit_for(&plan.to_ascii_lowercase())
    }

    fn day_key(&self, workspace_id: &str, now: DateTime<Utc>) -> String {
        format!(
            "{}:email_quota:{}:{}",
            self.key_prefix,
            workspace_id,
            now.format("%Y-%m-%d")
        )
    }

    fn next_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
        now.date_naive()
            .checked_add_days(Days::new(1))
            .map(|day| day.and_time(NaiveTime::MIN).and_utc())
            .unwrap_or(now)
    }

    fn decision(allowed: bool, requested: u64, used: u64, limit: u64, now: DateTime<Utc>) -> QuotaDecision {
        QuotaDecision {
            allowed,
            requested,
            used,
            limit,
            remaining: limit.saturating_sub(used),
            resets_at: Self::next_midnight(now),
        }
    }

    /// Admit `count` emails for today or none of them
    pub async fn check_and_consume(&self, workspace_id: &str, plan: &str, count: u64) -> RateLimitResult<QuotaDecision> {
        let now = self.clock.now();
        let limit = self.limit_for(plan);
        let key = self.day_key(workspace_id, now);

        if count == 0 {
            let used = self.read(&key).await?;
            return Ok(Self::decision(true, 0, used, limit, now));
        }

        // A batch larger than the whole allowance can never fit
        let amount = match i64::try_from(count) {
            Ok(amount) if count <= limit => amount,
            _ => {
                let used = self.read(&key).await?;
                info!(workspace_id, requested = count, used, limit, "Email batch exceeds daily limit");
                return Ok(Self::decision(false, count, used, limit, now));
            }
        };
        let total = self.store.increment(&key, amount, QUOTA_TTL).await?.max(0) as u64;
        if total <= limit {
            debug!(workspace_id, used = total, limit, "Email quota consumed");
            return Ok(Self::decision(true, count, total, limit, now));
        }

        // Overshoot: hand the batch back
        let used = self.store.increment(&key, -amount, QUOTA_TTL).await?.max(0) as u64;
        info!(workspace_id, requested = count, used, limit, "Email batch rejected by daily quota");
        Ok(Self::decision(false, count, used, limit, now))
    }

    async fn read(&self, key: &str) -> RateLimitResult<u64> {
        Ok(self
            .store
            .get(key)
            .await?
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|s| s.trim().parse::<i64>().ok())
            .map(|n| n.max(0) as u64)
            .unwrap_or(0))
    }

    /// Emails counted today for a workspace
    pub async fn usage(&self, workspace_id: &str) -> RateLimitResult<u64> {
        let now = self.clock.now();
        self.read(&self.day_key(workspace_id, now)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::store::InMemoryStore;
    use chrono::TimeZone;

    fn quota() -> (DailyQuota, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 14, 23, 0, 0).single().unwrap(),
        ));
        let mut config = EmailQuotaConfig::default();
        config.plan_daily_limits.insert("free".to_string(), 10);
        let quota = DailyQuota::new(Arc::new(InMemoryStore::new()), clock.clone(), "test", config);
        (quota, clock)
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let (quota, _clock) = quota();

        let first = quota.check_and_consume("ws-1", "free", 7).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 3);

        let rejected = quota.check_and_consume("ws-1", "free", 4).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.used, 7);
        assert_eq!(quota.usage("ws-1").await.unwrap(), 7);

        assert!(quota.check_and_consume("ws-1", "FREE", 3).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_new_day_starts_fresh() {
        let (quota, clock) = quota();
        quota.check_and_consume("ws-1", "free", 10).await.unwrap();

        let denied = quota.check_and_consume("ws-1", "free", 1).await.unwrap();
        assert_eq!(
            denied.resets_at,
            Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).single().unwrap()
        );

        clock.advance(Duration::from_secs(3600));
        assert_eq!(quota.usage("ws-1").await.unwrap(), 0);
        assert!(quota.check_and_consume("ws-1", "free", 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_oversized_batch_leaves_counter_untouched() {
        let (quota, _clock) = quota();
        quota.check_and_consume("ws-1", "free", 4).await.unwrap();

        for count in [11, i64::MAX as u64, i64::MAX as u64 + 1, u64::MAX - 999, u64::MAX] {
            let denied = quota.check_and_consume("ws-1", "free", count).await.unwrap();
            assert!(!denied.allowed, "batch of {} admitted", count);
            assert_eq!(denied.used, 4);
        }

        assert_eq!(quota.usage("ws-1").await.unwrap(), 4);
        assert!(!quota.check_and_consume("ws-1", "free", 7).await.unwrap().allowed);
        assert!(quota.check_and_consume("ws-1", "free", 6).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_unknown_plan_uses_default_limit() {
        let (quota, _clock) = quota();
        assert_eq!(quota.limit_for("platinum"), 50);
    }
}
