//! # Cache Namespaces
//!
//! Closed set of logical partitions of the cache keyspace. The namespace is
//! part of every physical key, so a key is never visible across namespaces and
//! clearing a namespace is a single pattern delete.

use super::CacheError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheNamespace {
    ApiResponses,
    AiResponses,
    LeadEnrichment,
    Analytics,
    WorkspaceSettings,
    FeatureFlags,
    Session,
    RateLimit,
}

impl CacheNamespace {
    pub const ALL: [CacheNamespace; 8] = [
        CacheNamespace::ApiResponses,
        CacheNamespace::AiResponses,
        CacheNamespace::LeadEnrichment,
        CacheNamespace::Analytics,
        CacheNamespace::WorkspaceSettings,
        CacheNamespace::FeatureFlags,
        CacheNamespace::Session,
        CacheNamespace::RateLimit,
    ];

    /// Key segment used in physical keys and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiResponses => "api_responses",
            Self::AiResponses => "ai_responses",
            Self::LeadEnrichment => "lead_enrichment",
            Self::Analytics => "analytics",
            Self::WorkspaceSettings => "workspace_settings",
            Self::FeatureFlags => "feature_flags",
            Self::Session => "session",
            Self::RateLimit => "rate_limit",
        }
    }

    /// TTL used when a caller does not pass one and config has no override
    pub fn default_ttl(&self) -> Duration {
        match self {
            Self::ApiResponses => Duration::from_secs(300),
            Self::AiResponses => Duration::from_secs(24 * 3600),
            Self::LeadEnrichment => Duration::from_secs(7 * 24 * 3600),
            Self::Analytics => Duration::from_secs(900),
            Self::WorkspaceSettings => Duration::from_secs(3600),
            Self::FeatureFlags => Duration::from_secs(300),
            Self::Session => Duration::from_secs(1800),
            Self::RateLimit => Duration::from_secs(60),
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Self::ApiResponses => 0,
            Self::AiResponses => 1,
            Self::LeadEnrichment => 2,
            Self::Analytics => 3,
            Self::WorkspaceSettings => 4,
            Self::FeatureFlags => 5,
            Self::Session => 6,
            Self::RateLimit => 7,
        }
    }
}

impl fmt::Display for CacheNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheNamespace {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|ns| ns.as_str() == normalized)
            .ok_or_else(|| CacheError::InvalidNamespace { name: s.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trips_every_namespace() {
        for ns in CacheNamespace::ALL {
            assert_eq!(ns.as_str().parse::<CacheNamespace>().unwrap(), ns);
        }
        assert_eq!("FEATURE_FLAGS".parse::<CacheNamespace>().unwrap(), CacheNamespace::FeatureFlags);
    }

    #[test]
    fn test_unknown_namespace_is_rejected() {
        let err = "campaigns".parse::<CacheNamespace>().unwrap_err();
        assert!(matches!(err, CacheError::InvalidNamespace { name } if name == "campaigns"));
    }

    #[test]
    fn test_indices_are_unique() {
        let mut seen = [false; 8];
        for ns in CacheNamespace::ALL {
            assert!(!seen[ns.index()]);
            seen[ns.index()] = true;
        }
    }
}
