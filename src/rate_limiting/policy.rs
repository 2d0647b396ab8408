//! Rate limit policies and their resolution order

use super::{RateLimitError, RateLimitResult};
use crate::core::config::RateLimitConfig;
use crate::core::identity::AuthIdentity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

/// Limits for the two fixed windows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub requests_per_minute: u64,
    pub requests_per_hour: u64,
    #[serde(default)]
    pub description: String,
}

impl RateLimitPolicy {
    pub fn new(requests_per_minute: u64, requests_per_hour: u64, description: &str) -> Self {
        Self {
            requests_per_minute,
            requests_per_hour,
            description: description.to_string(),
        }
    }
}

/// Which entry of the policy table applied
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyKey {
    Endpoint { method: String, path: String },
    PlanTier { plan: String },
    AuthenticatedDefault,
    IpDefault,
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Endpoint { method, path } => write!(f, "{}:{}", method, path),
            Self::PlanTier { plan } => write!(f, "user_type:{}", plan),
            Self::AuthenticatedDefault => f.write_str("authenticated_default"),
            Self::IpDefault => f.write_str("ip_default"),
        }
    }
}

/// Outcome of policy resolution for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPolicy {
    /// Counter identifier; encodes the branch that fired
    pub identifier: String,
    pub policy: RateLimitPolicy,
    pub key: PolicyKey,
}

/// Entry in the policy listing
#[derive(Debug, Clone, Serialize)]
pub struct PolicyEntry {
    pub key: PolicyKey,
    pub name: String,
    pub policy: RateLimitPolicy,
}

/// Static policy table built from config
#[derive(Debug, Clone)]
pub struct PolicyTable {
    endpoints: HashMap<(String, String), RateLimitPolicy>,
    plans: HashMap<String, RateLimitPolicy>,
    authenticated_default: Option<RateLimitPolicy>,
    ip_default: RateLimitPolicy,
}

impl PolicyTable {
    pub fn new(ip_default: RateLimitPolicy) -> Self {
        Self {
            endpoints: HashMap::new(),
            plans: HashMap::new(),
            authenticated_default: None,
            ip_default,
        }
    }

    pub fn with_endpoint(mut self, method: &str, path: &str, policy: RateLimitPolicy) -> Self {
        self.endpoints
            .insert((method.to_ascii_uppercase(), path.to_string()), policy);
        self
    }

    pub fn with_plan(mut self, plan: &str, policy: RateLimitPolicy) -> Self {
        self.plans.insert(plan.to_ascii_lowercase(), policy);
        self
    }

    pub fn with_authenticated_default(mut self, policy: RateLimitPolicy) -> Self {
        self.authenticated_default = Some(policy);
        self
    }

    pub fn from_config(config: &RateLimitConfig) -> RateLimitResult<Self> {
        let mut table = Self::new(config.ip_default.clone());

        for endpoint in &config.endpoints {
            if endpoint.method.parse::<axum::http::Method>().is_err() {
                return Err(RateLimitError::Configuration {
                    message: format!("'{}' is not an HTTP method", endpoint.method),
                });
            }
            table = table.with_endpoint(&endpoint.method, &endpoint.path, endpoint.policy.clone());
        }
        for (plan, policy) in &config.plans {
            table = table.with_plan(plan, policy.clone());
        }
        table.authenticated_default = config.authenticated_default.clone();

        Ok(table)
    }

    /// Pick the policy and counter identifier for a request.
    ///
    /// 1. Exact `METHOD:path` endpoint entry
    /// 2. Authenticated caller: plan tier policy, else the authenticated default
    /// 3. Client IP with the IP default
    pub fn resolve(&self, method: &str, path: &str, identity: Option<&AuthIdentity>, client_ip: &str) -> ResolvedPolicy {
        let method = method.to_ascii_uppercase();
        let caller = match identity {
            Some(identity) => format!("user:{}", identity.user_id),
            None => format!("ip:{}", client_ip),
        };

        if let Some(policy) = self.endpoints.get(&(method.clone(), path.to_string())) {
            return ResolvedPolicy {
                identifier: format!("{}:endpoint:{}:{}", caller, method, path),
                policy: policy.clone(),
                key: PolicyKey::Endpoint {
                    method,
                    path: path.to_string(),
                },
            };
        }

        if let Some(identity) = identity {
            if let Some((plan, policy)) = identity
                .plan_tier
                .as_deref()
                .and_then(|plan| self.plans.get(plan).map(|policy| (plan, policy)))
            {
                return ResolvedPolicy {
                    identifier: caller,
                    policy: policy.clone(),
                    key: PolicyKey::PlanTier { plan: plan.to_string() },
                };
            }

            if let Some(policy) = &self.authenticated_default {
                return ResolvedPolicy {
                    identifier: caller,
                    policy: policy.clone(),
                    key: PolicyKey::AuthenticatedDefault,
                };
            }

            let missing = RateLimitError::PolicyNotFound {
                key: format!("user_type:{}", identity.plan_tier.as_deref().unwrap_or("none")),
            };
            warn!(user_id = %identity.user_id, error = %missing, "Falling back to the IP default policy");
        }

        ResolvedPolicy {
            identifier: format!("ip:{}", client_ip),
            policy: self.ip_default.clone(),
            key: PolicyKey::IpDefault,
        }
    }

    /// Every configured policy, endpoint entries first
    pub fn entries(&self) -> Vec<PolicyEntry> {
        let mut endpoints: Vec<PolicyEntry> = self
            .endpoints
            .iter()
            .map(|((method, path), policy)| {
                let key = PolicyKey::Endpoint {
                    method: method.clone(),
                    path: path.clone(),
                };
                PolicyEntry {
                    name: key.to_string(),
                    key,
                    policy: policy.clone(),
                }
            })
            .collect();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));

        let mut plans: Vec<PolicyEntry> = self
            .plans
            .iter()
            .map(|(plan, policy)| {
                let key = PolicyKey::PlanTier { plan: plan.clone() };
                PolicyEntry {
                    name: key.to_string(),
                    key,
                    policy: policy.clone(),
                }
            })
            .collect();
        plans.sort_by(|a, b| a.name.cmp(&b.name));

        let mut entries = endpoints;
        entries.extend(plans);
        if let Some(policy) = &self.authenticated_default {
            entries.push(PolicyEntry {
                key: PolicyKey::AuthenticatedDefault,
                name: PolicyKey::AuthenticatedDefault.to_string(),
                policy: policy.clone(),
            });
        }
        entries.push(PolicyEntry {
            key: PolicyKey::IpDefault,
            name: PolicyKey::IpDefault.to_string(),
            policy: self.ip_default.clone(),
        });
        entries
    }
}
