//! # Cache Admin Interface
//!
//! Operational endpoints for the cache layer:
//!
//! | Route | Guard |
//! |---|---|
//! | `GET /cache/stats` | admin |
//! | `POST /cache/invalidate` | admin |
//! | `POST /cache/clear` | admin |
//! | `GET /cache/health` | none |
//! | `POST /cache/warm/workspace/:id` | admin or workspace member |
//! | `POST /cache/warming/start`, `/cache/warming/stop` | admin |
//!
//! Namespaces arrive as strings; an unknown one is a 400, never a silent no-op.

use super::{CacheHealth, CacheManager, CacheNamespace, CacheStats, CacheWarmer, WarmReport};
use crate::core::error::{EdgeError, EdgeResult};
use crate::core::identity::{require_admin, require_workspace, AuthIdentity};
use crate::store::MemoryInfo;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Extension, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Cache admin state
#[derive(Clone)]
pub struct CacheAdminState {
    pub cache: Arc<CacheManager>,
    pub warmer: Arc<CacheWarmer>,

    /// Role required by admin-only routes
    pub admin_role: Arc<str>,
}

/// Cache admin router
pub struct CacheAdminRouter;

impl CacheAdminRouter {
    pub fn create_router(state: CacheAdminState) -> Router {
        Router::new()
            .route("/cache/stats", get(get_cache_stats))
            .route("/cache/health", get(get_cache_health))
            .route("/cache/invalidate", post(invalidate_cache))
            .route("/cache/clear", post(clear_cache))
            .route("/cache/warm/workspace/:id", post(warm_workspace))
            .route("/cache/warming/start", post(start_warming))
            .route("/cache/warming/stop", post(stop_warming))
            .with_state(state)
    }
}

/// Optional caller identity, as attached by the identity middleware
type Caller = Option<Extension<AuthIdentity>>;

fn caller(identity: &Caller) -> Option<&AuthIdentity> {
    identity.as_ref().map(|Extension(identity)| identity)
}

fn parse_namespace(raw: &str) -> EdgeResult<CacheNamespace> {
    Ok(raw.parse::<CacheNamespace>()?)
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub namespace: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    pub stats: CacheStats,

    /// Absent when the store could not report memory
    pub memory: Option<MemoryInfo>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct CacheHealthResponse {
    #[serde(flatten)]
    pub health: CacheHealth,
    pub timestamp: DateTime<Utc>,
}

/// Body of `POST /cache/invalidate`; exactly one of `pattern` or `tag`
#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub namespace: Option<String>,
    pub pattern: Option<String>,
    pub tag: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClearRequest {
    pub namespace: String,
}

#[derive(Debug, Serialize)]
pub struct CacheInvalidationResponse {
    pub success: bool,
    pub message: String,
    pub invalidated_count: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct WarmingStatusResponse {
    pub running: bool,
    pub changed: bool,
    pub interval_secs: u64,
    pub last_report: Option<WarmReport>,
}

/// Get cache statistics
pub async fn get_cache_stats(
    State(state): State<CacheAdminState>,
    identity: Caller,
    Query(params): Query<StatsQuery>,
) -> EdgeResult<Json<CacheStatsResponse>> {
    require_admin(caller(&identity), &state.admin_role)?;

    let namespace = params.namespace.as_deref().map(parse_namespace).transpose()?;
    let stats = state.cache.get_stats(namespace).await;
    let memory = match state.cache.get_memory_usage().await {
        Ok(memory) => Some(memory),
        Err(e) => {
            warn!(error = %e, "Cache memory usage unavailable");
            None
        }
    };

    Ok(Json(CacheStatsResponse {
        stats,
        memory,
        timestamp: state.cache.clock().now(),
    }))
}

/// Store connectivity probe. Answers 503 when the store is down.
pub async fn get_cache_health(State(state): State<CacheAdminState>) -> (StatusCode, Json<CacheHealthResponse>) {
    let health = state.cache.health_check().await;
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(CacheHealthResponse {
            health,
            timestamp: state.cache.clock().now(),
        }),
    )
}

/// Delete by pattern within a namespace, or by tag
pub async fn invalidate_cache(
    State(state): State<CacheAdminState>,
    identity: Caller,
    Json(request): Json<InvalidateRequest>,
) -> EdgeResult<Json<CacheInvalidationResponse>> {
    let admin = require_admin(caller(&identity), &state.admin_role)?;

    let (count, message) = match (request.pattern, request.tag) {
        (Some(pattern), None) => {
            let raw = request
                .namespace
                .ok_or_else(|| EdgeError::validation("namespace", "required with 'pattern'"))?;
            let namespace = parse_namespace(&raw)?;
            let count = state.cache.delete_pattern(&pattern, namespace).await?;
            (count, format!("Invalidated '{}' in namespace '{}'", pattern, namespace))
        }
        (None, Some(tag)) => {
            let count = state.cache.delete_by_tag(&tag).await?;
            (count, format!("Invalidated tag '{}'", tag))
        }
        _ => {
            return Err(EdgeError::validation(
                "pattern",
                "exactly one of 'pattern' or 'tag' must be given",
            ))
        }
    };

    info!(user_id = %admin.user_id, invalidated = count, "{}", message);
    Ok(Json(CacheInvalidationResponse {
        success: true,
        message,
        invalidated_count: count,
        timestamp: state.cache.clock().now(),
    }))
}

/// Clear one namespace
pub async fn clear_cache(
    State(state): State<CacheAdminState>,
    identity: Caller,
    Json(request): Json<ClearRequest>,
) -> EdgeResult<Json<CacheInvalidationResponse>> {
    let admin = require_admin(caller(&identity), &state.admin_role)?;
    let namespace = parse_namespace(&request.namespace)?;

    let count = state.cache.clear_namespace(namespace).await?;
    info!(user_id = %admin.user_id, namespace = namespace.as_str(), cleared = count, "Cache namespace cleared via admin API");

    Ok(Json(CacheInvalidationResponse {
        success: true,
        message: format!("Cleared namespace '{}'", namespace),
        invalidated_count: count,
        timestamp: state.cache.clock().now(),
    }))
}

/// Warm one workspace's settings on demand
pub async fn warm_workspace(
    State(state): State<CacheAdminState>,
    identity: Caller,
    Path(workspace_id): Path<String>,
) -> EdgeResult<Json<WarmReport>> {
    require_workspace(caller(&identity), &workspace_id, &state.admin_role)?;
    let report = state.warmer.warm_workspace(&workspace_id).await?;
    Ok(Json(report))
}

fn warming_status(warmer: &CacheWarmer, changed: bool) -> WarmingStatusResponse {
    WarmingStatusResponse {
        running: warmer.is_running(),
        changed,
        interval_secs: warmer.interval().as_secs(),
        last_report: warmer.last_report(),
    }
}

pub async fn start_warming(
    State(state): State<CacheAdminState>,
    identity: Caller,
) -> EdgeResult<Json<WarmingStatusResponse>> {
    let admin = require_admin(caller(&identity), &state.admin_role)?;
    let changed = state.warmer.start();
    info!(user_id = %admin.user_id, changed, "Cache warming start requested");
    Ok(Json(warming_status(&state.warmer, changed)))
}

pub async fn stop_warming(
    State(state): State<CacheAdminState>,
    identity: Caller,
) -> EdgeResult<Json<WarmingStatusResponse>> {
    let admin = require_admin(caller(&identity), &state.admin_role)?;
    let changed = state.warmer.stop().await;
    info!(user_id = %admin.user_id, changed, "Cache warming stop requested");
    Ok(Json(warming_status(&state.warmer, changed)))
}
