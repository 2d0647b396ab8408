//! # Rate Limiting Admin Module
//!
//! Operational endpoints for the limiters:
//! - `GET /rate-limit/metrics`: allowed/denied/fail-open counters
//! - `GET /rate-limit/policies`: the resolved policy table
//! - `GET /rate-limit/usage/:identifier`: current window usage
//! - `DELETE /rate-limit/:identifier`: reset an identifier's counters
//! - `GET /rate-limit/bucket/:identifier`: token bucket state
//! - `GET|POST /rate-limit/quota/:workspace`: daily email quota usage and consumption
//!
//! Quota routes are tenant-scoped; everything else requires the admin role.

use super::daily_quota::{DailyQuota, QuotaDecision};
use super::limiter::{RateLimitMetricsSnapshot, RateLimiter, WindowUsage};
use super::policy::{PolicyEntry, PolicyTable};
use super::token_bucket::{BucketState, TokenBucketLimiter};
use crate::core::error::{EdgeError, EdgeResult};
use crate::core::identity::{require_admin, require_workspace, AuthIdentity};
use axum::{
    extract::{Path, State},
    response::Json,
    routing::{delete, get},
    Extension, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// State for rate limiting admin endpoints
#[derive(Clone)]
pub struct RateLimitAdminState {
    pub limiter: Arc<RateLimiter>,
    pub policies: Arc<PolicyTable>,
    pub token_bucket: Arc<TokenBucketLimiter>,
    pub email_quota: Arc<DailyQuota>,
    pub admin_role: Arc<str>,
}

/// Router for rate limiting admin endpoints
pub struct RateLimitAdminRouter;

impl RateLimitAdminRouter {
    pub fn create_router(state: RateLimitAdminState) -> Router {
        Router::new()
            .route("/rate-limit/metrics", get(get_rate_limit_metrics))
            .route("/rate-limit/policies", get(get_policies))
            .route("/rate-limit/usage/:identifier", get(get_usage))
            .route("/rate-limit/bucket/:identifier", get(get_bucket))
            .route("/rate-limit/quota/:workspace", get(get_quota).post(consume_quota))
            .route("/rate-limit/:identifier", delete(reset_rate_limit))
            .with_state(state)
    }
}

type Caller = Option<Extension<AuthIdentity>>;

fn caller(identity: &Caller) -> Option<&AuthIdentity> {
    identity.as_ref().map(|Extension(identity)| identity)
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub identifier: String,
    pub removed: u64,
}

#[derive(Debug, Serialize)]
pub struct QuotaUsageResponse {
    pub workspace_id: String,
    pub plan: String,
    pub used: u64,
    pub limit: u64,
}

#[derive(Debug, Deserialize)]
pub struct ConsumeQuotaRequest {
    pub count: u64,
}

pub async fn get_rate_limit_metrics(
    State(state): State<RateLimitAdminState>,
    identity: Caller,
) -> EdgeResult<Json<RateLimitMetricsSnapshot>> {
    require_admin(caller(&identity), &state.admin_role)?;
    Ok(Json(state.limiter.get_metrics()))
}

pub async fn get_policies(
    State(state): State<RateLimitAdminState>,
    identity: Caller,
) -> EdgeResult<Json<Vec<PolicyEntry>>> {
    require_admin(caller(&identity), &state.admin_role)?;
    Ok(Json(state.policies.entries()))
}

pub async fn get_usage(
    State(state): State<RateLimitAdminState>,
    identity: Caller,
    Path(identifier): Path<String>,
) -> EdgeResult<Json<WindowUsage>> {
    require_admin(caller(&identity), &state.admin_role)?;
    Ok(Json(state.limiter.usage(&identifier).await?))
}

pub async fn reset_rate_limit(
    State(state): State<RateLimitAdminState>,
    identity: Caller,
    Path(identifier): Path<String>,
) -> EdgeResult<Json<ResetResponse>> {
    let admin = require_admin(caller(&identity), &state.admin_role)?;
    let removed = state.limiter.reset(&identifier).await?;
    info!(user_id = %admin.user_id, identifier = %identifier, removed, "Rate limit reset via admin API");
    Ok(Json(ResetResponse { identifier, removed }))
}

pub async fn get_bucket(
    State(state): State<RateLimitAdminState>,
    identity: Caller,
    Path(identifier): Path<String>,
) -> EdgeResult<Json<BucketState>> {
    require_admin(caller(&identity), &state.admin_role)?;
    Ok(Json(state.token_bucket.peek(&identifier).await?))
}

fn caller_plan(identity: &AuthIdentity) -> String {
    identity.plan_tier.clone().unwrap_or_else(|| "free".to_string())
}

pub async fn get_quota(
    State(state): State<RateLimitAdminState>,
    identity: Caller,
    Path(workspace_id): Path<String>,
) -> EdgeResult<Json<QuotaUsageResponse>> {
    let identity = require_workspace(caller(&identity), &workspace_id, &state.admin_role)?;
    let plan = caller_plan(identity);
    let used = state.email_quota.usage(&workspace_id).await?;

    Ok(Json(QuotaUsageResponse {
        limit: state.email_quota.limit_for(&plan),
        workspace_id,
        plan,
        used,
    }))
}

/// Consume `count` emails from today's quota; 429 when the batch does not fit
pub async fn consume_quota(
    State(state): State<RateLimitAdminState>,
    identity: Caller,
    Path(workspace_id): Path<String>,
    Json(request): Json<ConsumeQuotaRequest>,
) -> EdgeResult<Json<QuotaDecision>> {
    let identity = require_workspace(caller(&identity), &workspace_id, &state.admin_role)?;
    let plan = caller_plan(identity);

    let decision = state
        .email_quota
        .check_and_consume(&workspace_id, &plan, request.count)
        .await?;
    if !decision.allowed {
        return Err(EdgeError::QuotaExceeded {
            quota: format!("daily email sends for '{}'", workspace_id),
            used: decision.used,
            limit: decision.limit,
        });
    }
    Ok(Json(decision))
}
