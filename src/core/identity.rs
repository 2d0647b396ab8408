//! # Request Identity
//!
//! The edge does not authenticate callers itself. The authenticating proxy in
//! front of it forwards the verified identity as headers, which the
//! [`identity_middleware`] turns into an [`AuthIdentity`] request extension
//! for the rate limiter, the HTTP cache and the admin endpoints.

use crate::core::config::IdentityConfig;
use crate::core::error::{EdgeError, EdgeResult};
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthIdentity {
    pub user_id: String,

    /// Tenant the caller acts for
    pub workspace_id: Option<String>,

    /// Subscription plan, e.g. `free` or `pro`
    pub plan_tier: Option<String>,

    pub roles: Vec<String>,
}

impl AuthIdentity {
    pub fn new<S: Into<String>>(user_id: S) -> Self {
        Self {
            user_id: user_id.into(),
            workspace_id: None,
            plan_tier: None,
            roles: Vec::new(),
        }
    }

    pub fn with_workspace<S: Into<String>>(mut self, workspace_id: S) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn with_plan<S: Into<String>>(mut self, plan: S) -> Self {
        self.plan_tier = Some(plan.into());
        self
    }

    pub fn with_role<S: Into<String>>(mut self, role: S) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }

    /// Whether the caller may act on `workspace_id`
    pub fn can_access_workspace(&self, workspace_id: &str, admin_role: &str) -> bool {
        self.has_role(admin_role) || self.workspace_id.as_deref() == Some(workspace_id)
    }

    /// Read identity headers; `None` when no user id is present
    pub fn from_headers(headers: &HeaderMap, config: &IdentityConfig) -> Option<Self> {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let user_id = read(&config.user_id_header)?;
        let roles = read(&config.role_header)
            .map(|raw| {
                raw.split(',')
                    .map(|role| role.trim().to_string())
                    .filter(|role| !role.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            user_id,
            workspace_id: read(&config.workspace_header),
            plan_tier: read(&config.plan_header).map(|plan| plan.to_ascii_lowercase()),
            roles,
        })
    }
}

/// Admin-only guard for handlers
pub fn require_admin<'a>(identity: Option<&'a AuthIdentity>, admin_role: &str) -> EdgeResult<&'a AuthIdentity> {
    let identity = identity.ok_or_else(|| EdgeError::auth("missing caller identity"))?;
    if identity.has_role(admin_role) {
        Ok(identity)
    } else {
        Err(EdgeError::authz(format!("role '{}' required", admin_role)))
    }
}

/// Tenant guard: admins or members of `workspace_id`
pub fn require_workspace<'a>(
    identity: Option<&'a AuthIdentity>,
    workspace_id: &str,
    admin_role: &str,
) -> EdgeResult<&'a AuthIdentity> {
    let identity = identity.ok_or_else(|| EdgeError::auth("missing caller identity"))?;
    if identity.can_access_workspace(workspace_id, admin_role) {
        Ok(identity)
    } else {
        Err(EdgeError::authz(format!("no access to workspace '{}'", workspace_id)))
    }
}

/// Attach the forwarded identity to the request extensions
pub async fn identity_middleware(
    State(config): State<Arc<IdentityConfig>>,
    mut request: Request,
    next: Next,
) -> Response {
    // Never let a client-supplied extension survive
    request.extensions_mut().remove::<AuthIdentity>();

    if config.trust_headers {
        if let Some(identity) = AuthIdentity::from_headers(request.headers(), &config) {
            tracing::debug!(
                user_id = %identity.user_id,
                workspace_id = ?identity.workspace_id,
                "Request identity attached"
            );
            request.extensions_mut().insert(identity);
        }
    }

    next.run(request).await
}
