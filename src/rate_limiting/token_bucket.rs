//! Token bucket limiter for burst-tolerant quotas
//!
//! Bucket state lives in the store as JSON under
//! `{prefix}:token_bucket:{identifier}`. Refills happen in whole periods:
//! `floor(elapsed / refill_period) * refill_rate` tokens, capped at
//! `max_tokens`, and `last_refill` moves forward by exactly the periods
//! consumed so partial periods carry over to the next call.
//!
//! State is written back on every call, denials included, with a TTL of two
//! refill periods so idle buckets expire on their own.

use super::RateLimitResult;
use crate::core::clock::Clock;
use crate::core::config::TokenBucketConfig;
use crate::store::KvStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Persisted bucket state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,

    /// Unix milliseconds of the last whole-period refill
    pub last_refill: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketDecision {
    pub allowed: bool,
    pub requested: f64,

    /// Tokens left after this call
    pub tokens: f64,
    pub max_tokens: f64,
}

pub struct TokenBucketLimiter {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    config: TokenBucketConfig,
}

impl TokenBucketLimiter {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, key_prefix: &str, config: TokenBucketConfig) -> Self {
        Self {
            store,
            clock,
            key_prefix: key_prefix.to_string(),
            config,
        }
    }

    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    fn bucket_key(&self, identifier: &str) -> String {
        format!("{}:token_bucket:{}", self.key_prefix, identifier)
    }

    async fn load(&self, identifier: &str, now_ms: i64) -> RateLimitResult<BucketState> {
        let fresh = BucketState {
            tokens: self.config.max_tokens,
            last_refill: now_ms,
        };

        let Some(bytes) = self.store.get(&self.bucket_key(identifier)).await? else {
            return Ok(fresh);
        };
        match serde_json::from_slice::<BucketState>(&bytes) {
            Ok(state) if state.tokens.is_finite() => Ok(BucketState {
                tokens: state.tokens.clamp(0.0, self.config.max_tokens.max(0.0)),
                ..state
            }),
            Ok(_) => {
                warn!(identifier, "Non-finite token bucket state, starting full");
                Ok(fresh)
            }
            Err(e) => {
                warn!(identifier, error = %e, "Corrupt token bucket state, starting full");
                Ok(fresh)
            }
        }
    }

    /// Apply the refills owed up to `now_ms`
    fn refill(&self, mut state: BucketState, now_ms: i64) -> BucketState {
        let period_ms = self.config.refill_period.as_millis() as i64;
        if period_ms <= 0 {
            return state;
        }

        let elapsed = now_ms - state.last_refill;
        if elapsed < 0 {
            // Clock moved backwards; restart the period from now
            state.last_refill = now_ms;
            return state;
        }

        let periods = elapsed / period_ms;
        if periods > 0 {
            state.tokens = (state.tokens + periods as f64 * self.config.refill_rate).min(self.config.max_tokens);
            state.last_refill += periods * period_ms;
        }
        state
    }

    /// Take `requested` tokens if available. The refilled state is saved
    /// either way.
    pub async fn try_acquire(&self, identifier: &str, requested: f64) -> RateLimitResult<BucketDecision> {
        if !requested.is_finite() || requested < 0.0 {
            return Err(super::RateLimitError::InvalidRequest {
                field: "requested".to_string(),
                reason: format!("{} is not a finite, non-negative token count", requested),
            });
        }

        let now_ms = self.clock.now_millis();
        let mut state = self.refill(self.load(identifier, now_ms).await?, now_ms);

        let allowed = state.tokens >= requested;
        if allowed {
            state.tokens -= requested;
        }
        state.tokens = state.tokens.clamp(0.0, self.config.max_tokens.max(0.0));

        let bytes = serde_json::to_vec(&state).map_err(|e| super::RateLimitError::Configuration {
            message: format!("token bucket state not serializable: {}", e),
        })?;
        self.store
            .set(&self.bucket_key(identifier), &bytes, self.config.refill_period * 2)
            .await?;

        debug!(identifier, allowed, tokens = state.tokens, "Token bucket checked");
        Ok(BucketDecision {
            allowed,
            requested,
            tokens: state.tokens,
            max_tokens: self.config.max_tokens,
        })
    }

    /// Current state with refills applied, without consuming or saving
    pub async fn peek(&self, identifier: &str) -> RateLimitResult<BucketState> {
        let now_ms = self.clock.now_millis();
        Ok(self.refill(self.load(identifier, now_ms).await?, now_ms))
    }
}
