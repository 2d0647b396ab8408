//! # Rate Limiting Integration Tests
//!
//! Fixed-window accounting, policy precedence, reset, token bucket and daily
//! quota behavior against the in-memory store with a manual clock.

mod common;

use common::{manual_clock, UnreachableStore, MINUTE_BOUNDARY};
use outreach_edge::core::clock::ManualClock;
use outreach_edge::core::config::{EmailQuotaConfig, TokenBucketConfig};
use outreach_edge::core::identity::AuthIdentity;
use outreach_edge::rate_limiting::{
    DailyQuota, PolicyKey, PolicyTable, RateLimitError, RateLimitPolicy, RateLimiter, TokenBucketLimiter,
};
use outreach_edge::store::{InMemoryStore, KvStore};
use std::sync::Arc;
use std::time::Duration;

fn create_limiter() -> (Arc<RateLimiter>, Arc<ManualClock>) {
    let clock = manual_clock();
    let limiter = RateLimiter::new(Arc::new(InMemoryStore::new()), clock.clone(), "test");
    (Arc::new(limiter), clock)
}

fn small_policy() -> RateLimitPolicy {
    RateLimitPolicy::new(5, 60, "small")
}

#[tokio::test]
async fn test_five_per_minute_then_next_window() {
    let (limiter, clock) = create_limiter();
    let policy = small_policy();

    for expected in 1..=5u64 {
        let decision = limiter.check("u1", &policy).await;
        assert!(decision.allowed);
        assert!(!decision.fail_open);
        assert_eq!(decision.minute.as_ref().unwrap().current_usage, expected);
        assert_eq!(decision.hour.as_ref().unwrap().current_usage, expected);
    }

    clock.advance(Duration::from_secs(60));
    let decision = limiter.check("u1", &policy).await;
    assert!(decision.allowed);
    assert_eq!(decision.minute.unwrap().current_usage, 1);
    assert_eq!(decision.hour.unwrap().current_usage, 6);
}

#[tokio::test]
async fn test_sixth_request_in_window_is_denied() {
    let (limiter, clock) = create_limiter();
    let policy = small_policy();

    for _ in 0..5 {
        assert!(limiter.check("u1", &policy).await.allowed);
    }

    let denied = limiter.check("u1", &policy).await;
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after, Some(60));
    let minute = denied.minute.unwrap();
    assert_eq!(minute.current_usage, 6);
    assert_eq!(minute.remaining, 0);

    // The denied attempt still counted against both windows
    let usage = limiter.usage("u1").await.unwrap();
    assert_eq!(usage.minute, 6);
    assert_eq!(usage.hour, 6);

    clock.advance(Duration::from_secs(60));
    let decision = limiter.check("u1", &policy).await;
    assert!(decision.allowed);
    assert_eq!(decision.hour.unwrap().current_usage, 7);
}

#[tokio::test]
async fn test_hour_window_denial_waits_an_hour() {
    let (limiter, clock) = create_limiter();
    let policy = RateLimitPolicy::new(100, 3, "hourly");

    for _ in 0..3 {
        assert!(limiter.check("u2", &policy).await.allowed);
        clock.advance(Duration::from_secs(60));
    }

    let denied = limiter.check("u2", &policy).await;
    assert!(!denied.allowed);
    assert!(denied.minute.as_ref().unwrap().allowed);
    assert_eq!(denied.retry_after, Some(3600));
}

#[tokio::test]
async fn test_concurrent_checks_agree_on_reset_time() {
    let (limiter, _) = create_limiter();
    let policy = RateLimitPolicy::new(1_000, 10_000, "wide");

    let (a, b) = tokio::join!(limiter.check("u3", &policy), limiter.check("u3", &policy));
    let (a_minute, b_minute) = (a.minute.unwrap(), b.minute.unwrap());
    assert_eq!(a_minute.reset_time, b_minute.reset_time);
    assert_eq!(a_minute.reset_time.timestamp(), MINUTE_BOUNDARY + 60);
    assert_eq!(a.hour.unwrap().reset_time, b.hour.unwrap().reset_time);

    // Both increments landed
    let mut usages = vec![a_minute.current_usage, b_minute.current_usage];
    usages.sort_unstable();
    assert_eq!(usages, vec![1, 2]);
}

#[tokio::test]
async fn test_concurrent_requests_never_overshoot() {
    let (limiter, _) = create_limiter();
    let policy = small_policy();

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let limiter = limiter.clone();
            let policy = policy.clone();
            tokio::spawn(async move { limiter.check("burst", &policy).await.allowed })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 5);
    assert_eq!(limiter.usage("burst").await.unwrap().minute, 20);
}

#[tokio::test]
async fn test_reset_clears_identifier_and_nested_endpoint_counters() {
    let (limiter, _) = create_limiter();
    let policy = small_policy();

    for _ in 0..6 {
        limiter.check("user:7", &policy).await;
    }
    limiter.check("user:7:endpoint:POST:/api/emails/send", &policy).await;
    limiter.check("user:70", &policy).await;

    // minute and hour counters for each of the two user:7 identifiers
    assert_eq!(limiter.reset("user:7").await.unwrap(), 4);
    assert!(limiter.check("user:7", &policy).await.allowed);
    assert_eq!(limiter.usage("user:70").await.unwrap().minute, 1);
    assert_eq!(limiter.reset("nobody").await.unwrap(), 0);
}

#[tokio::test]
async fn test_store_outage_fails_open() {
    let store = Arc::new(UnreachableStore::default());
    let limiter = RateLimiter::new(store.clone(), manual_clock(), "test");

    for _ in 0..10 {
        let decision = limiter.check("u1", &small_policy()).await;
        assert!(decision.allowed);
        assert!(decision.fail_open);
        assert!(decision.minute.is_none());
    }

    let metrics = limiter.get_metrics();
    assert_eq!(metrics.fail_open, 10);
    assert_eq!(metrics.requests_denied, 0);
    assert!(limiter.usage("u1").await.is_err());
}

#[tokio::test]
async fn test_metrics_snapshot() {
    let (limiter, _) = create_limiter();
    let policy = RateLimitPolicy::new(1, 10, "tight");

    limiter.check("m", &policy).await;
    limiter.check("m", &policy).await;
    limiter.check("m", &policy).await;

    let metrics = limiter.get_metrics();
    assert_eq!(metrics.requests_allowed, 1);
    assert_eq!(metrics.requests_denied, 2);
    assert_eq!(metrics.total_requests, 3);
}

#[test]
fn test_policy_precedence() {
    let table = PolicyTable::new(RateLimitPolicy::new(30, 500, "ip"))
        .with_endpoint("post", "/api/emails/send", RateLimitPolicy::new(10, 100, "send"))
        .with_plan("pro", RateLimitPolicy::new(300, 10_000, "pro"))
        .with_authenticated_default(RateLimitPolicy::new(100, 2_000, "user"));

    let pro = AuthIdentity::new("42").with_plan("pro");
    let unknown_plan = AuthIdentity::new("43").with_plan("legacy");

    let send = table.resolve("POST", "/api/emails/send", Some(&pro), "10.0.0.1");
    assert_eq!(send.identifier, "user:42:endpoint:POST:/api/emails/send");
    assert_eq!(send.policy.requests_per_minute, 10);

    let anonymous_send = table.resolve("POST", "/api/emails/send", None, "10.0.0.1");
    assert_eq!(anonymous_send.identifier, "ip:10.0.0.1:endpoint:POST:/api/emails/send");

    let plan = table.resolve("GET", "/api/leads", Some(&pro), "10.0.0.1");
    assert_eq!(plan.identifier, "user:42");
    assert_eq!(plan.key, PolicyKey::PlanTier { plan: "pro".to_string() });

    let fallback = table.resolve("GET", "/api/leads", Some(&unknown_plan), "10.0.0.1");
    assert_eq!(fallback.key, PolicyKey::AuthenticatedDefault);
    assert_eq!(fallback.identifier, "user:43");

    let ip = table.resolve("GET", "/api/leads", None, "10.0.0.1");
    assert_eq!(ip.key, PolicyKey::IpDefault);
    assert_eq!(ip.identifier, "ip:10.0.0.1");
}

#[tokio::test]
async fn test_endpoint_counter_is_separate_from_user_counter() {
    let (limiter, _) = create_limiter();
    let table = PolicyTable::new(RateLimitPolicy::new(30, 500, "ip"))
        .with_endpoint("POST", "/api/auth/login", RateLimitPolicy::new(1, 10, "login"))
        .with_authenticated_default(RateLimitPolicy::new(100, 2_000, "user"));
    let user = AuthIdentity::new("9");

    let login = table.resolve("POST", "/api/auth/login", Some(&user), "10.0.0.1");
    assert!(limiter.check_resolved(&login).await.allowed);
    assert!(!limiter.check_resolved(&login).await.allowed);

    let generic = table.resolve("GET", "/api/campaigns", Some(&user), "10.0.0.1");
    let decision = limiter.check_resolved(&generic).await;
    assert!(decision.allowed);
    assert_eq!(decision.minute.unwrap().current_usage, 1);
}

#[tokio::test]
async fn test_token_bucket_refills_whole_periods() {
    let clock = manual_clock();
    let store = Arc::new(InMemoryStore::new());
    let bucket = TokenBucketLimiter::new(
        store.clone(),
        clock.clone(),
        "test",
        TokenBucketConfig {
            max_tokens: 3.0,
            refill_rate: 1.0,
            refill_period: Duration::from_secs(10),
        },
    );

    for _ in 0..3 {
        assert!(bucket.try_acquire("ws_1", 1.0).await.unwrap().allowed);
    }
    assert!(!bucket.try_acquire("ws_1", 1.0).await.unwrap().allowed);

    // Part of a period earns nothing
    clock.advance(Duration::from_secs(9));
    assert!(!bucket.try_acquire("ws_1", 1.0).await.unwrap().allowed);

    clock.advance(Duration::from_secs(1));
    let decision = bucket.try_acquire("ws_1", 1.0).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.tokens, 0.0);

    // State is persisted under the bucket key
    assert!(store.get("test:token_bucket:ws_1").await.unwrap().is_some());

    clock.advance(Duration::from_secs(600));
    assert_eq!(bucket.peek("ws_1").await.unwrap().tokens, 3.0);
}

#[tokio::test]
async fn test_daily_quota_is_all_or_nothing() {
    let clock = Arc::new(ManualClock::at_unix(MINUTE_BOUNDARY));
    let quota = DailyQuota::new(
        Arc::new(InMemoryStore::new()),
        clock.clone(),
        "test",
        EmailQuotaConfig::default(),
    );

    let first = quota.check_and_consume("ws_1", "free", 80).await.unwrap();
    assert!(first.allowed);
    assert_eq!(first.remaining, 20);

    let too_many = quota.check_and_consume("ws_1", "free", 30).await.unwrap();
    assert!(!too_many.allowed);
    assert_eq!(too_many.used, 80);
    assert_eq!(quota.usage("ws_1").await.unwrap(), 80);

    let exact = quota.check_and_consume("ws_1", "FREE", 20).await.unwrap();
    assert!(exact.allowed);
    assert_eq!(exact.remaining, 0);

    // Plan limits differ and other workspaces are untouched
    assert!(quota.check_and_consume("ws_2", "pro", 5_000).await.unwrap().allowed);
    assert_eq!(quota.limit_for("enterprise"), 100_000);

    // A new calendar day starts from zero
    clock.advance(Duration::from_secs(24 * 3600));
    assert_eq!(quota.usage("ws_1").await.unwrap(), 0);
    assert!(quota.check_and_consume("ws_1", "free", 100).await.unwrap().allowed);
}

#[tokio::test]
async fn test_daily_quota_rejects_batches_beyond_any_limit() {
    let quota = DailyQuota::new(
        Arc::new(InMemoryStore::new()),
        manual_clock(),
        "test",
        EmailQuotaConfig::default(),
    );

    for count in [101, i64::MAX as u64, i64::MAX as u64 + 1, u64::MAX - 999, u64::MAX] {
        let decision = quota.check_and_consume("ws_1", "free", count).await.unwrap();
        assert!(!decision.allowed, "batch of {} admitted", count);
        assert_eq!(decision.used, 0);
    }

    // No credit was handed out by the rejected batches
    assert!(!quota.check_and_consume("ws_1", "free", 1_000).await.unwrap().allowed);
    assert_eq!(quota.usage("ws_1").await.unwrap(), 0);
    assert!(quota.check_and_consume("ws_1", "free", 100).await.unwrap().allowed);
    assert!(!quota.check_and_consume("ws_1", "free", 1).await.unwrap().allowed);
}

#[tokio::test]
async fn test_token_bucket_rejects_invalid_amounts() {
    let store = Arc::new(InMemoryStore::new());
    let bucket = TokenBucketLimiter::new(
        store.clone(),
        manual_clock(),
        "test",
        TokenBucketConfig {
            max_tokens: 10.0,
            refill_rate: 1.0,
            refill_period: Duration::from_secs(10),
        },
    );

    for requested in [-5.0, f64::NAN, f64::INFINITY] {
        assert!(matches!(
            bucket.try_acquire("x", requested).await,
            Err(RateLimitError::InvalidRequest { .. })
        ));
    }
    assert!(store.get("test:token_bucket:x").await.unwrap().is_none());

    let decision = bucket.try_acquire("x", 0.0).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.tokens, 10.0);
    assert!(decision.tokens <= decision.max_tokens);
}
