//! # HTTP Cache Key Derivation
//!
//! Cached responses are keyed by a SHA-256 digest of the tenant, the path,
//! the query parameters sorted by name and value, and the `Accept` header.
//! Parameter order in the URL does not change the key.

use axum::http::{header, HeaderMap, Uri};
use sha2::{Digest, Sha256};

/// Tenant used when the request carries no workspace identity
pub const UNKNOWN_TENANT: &str = "unknown";

/// Components of an HTTP response cache key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpCacheKey {
    pub tenant_id: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub accept: String,
}

impl HttpCacheKey {
    pub fn new(tenant_id: Option<&str>, path: &str, query: Option<&str>, accept: Option<&str>) -> Self {
        Self {
            tenant_id: tenant_id
                .filter(|t| !t.is_empty())
                .unwrap_or(UNKNOWN_TENANT)
                .to_string(),
            path: path.to_string(),
            query: sorted_query(query.unwrap_or_default()),
            accept: accept.unwrap_or_default().to_string(),
        }
    }

    /// Build from request parts
    pub fn from_request(tenant_id: Option<&str>, uri: &Uri, headers: &HeaderMap) -> Self {
        let accept = headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok());
        Self::new(tenant_id, uri.path(), uri.query(), accept)
    }

    pub fn is_anonymous(&self) -> bool {
        self.tenant_id == UNKNOWN_TENANT
    }

    /// Hex digest used as the logical cache key
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.tenant_id.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(self.path.as_bytes());
        hasher.update(b"\x1f");
        for (i, (name, value)) in self.query.iter().enumerate() {
            if i > 0 {
                hasher.update(b"&");
            }
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        hasher.update(b"\x1f");
        hasher.update(self.accept.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Split a raw query string into pairs sorted by name, then value
pub fn sorted_query(query: &str) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((name, value)) => (name.to_string(), value.to_string()),
            None => (part.to_string(), String::new()),
        })
        .collect();
    pairs.sort();
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_order_does_not_matter() {
        let a = HttpCacheKey::new(Some("ws-1"), "/api/campaigns", Some("page=2&sort=name"), None);
        let b = HttpCacheKey::new(Some("ws-1"), "/api/campaigns", Some("sort=name&page=2"), None);
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
    }

    #[test]
    fn test_every_component_changes_the_key() {
        let base = HttpCacheKey::new(Some("ws-1"), "/api/leads", Some("x=1"), Some("application/json"));
        let variants = [
            HttpCacheKey::new(Some("ws-2"), "/api/leads", Some("x=1"), Some("application/json")),
            HttpCacheKey::new(Some("ws-1"), "/api/lead", Some("x=1"), Some("application/json")),
            HttpCacheKey::new(Some("ws-1"), "/api/leads", Some("x=2"), Some("application/json")),
            HttpCacheKey::new(Some("ws-1"), "/api/leads", Some("x=1"), Some("text/csv")),
        ];
        for variant in variants {
            assert_ne!(base.digest(), variant.digest());
        }
    }

    #[test]
    fn test_missing_tenant_uses_sentinel() {
        let key = HttpCacheKey::new(None, "/api/templates", None, None);
        assert!(key.is_anonymous());
        assert_eq!(key.tenant_id, "unknown");
        assert_eq!(
            key.digest(),
            HttpCacheKey::new(Some(""), "/api/templates", None, None).digest()
        );
    }

    #[test]
    fn test_sorted_query_handles_bare_flags() {
        assert_eq!(
            sorted_query("b=2&a&a=1"),
            vec![
                ("a".to_string(), String::new()),
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ]
        );
    }
}
