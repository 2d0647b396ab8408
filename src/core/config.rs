//! # Configuration Module
//!
//! Static configuration for the edge service, loaded once at startup.
//!
//! ## Key Features
//! - YAML parsing with serde, durations in humantime notation (`"250ms"`, `"5m"`)
//! - Environment variable overrides (`OUTREACH_EDGE_<SECTION>_<FIELD>`)
//! - Validation that reports every problem at once
//!
//! A missing config file is not an error: the service starts on defaults,
//! which use the in-memory store.

use crate::caching::CacheNamespace;
use crate::core::error::{EdgeError, EdgeResult};
use crate::rate_limiting::policy::RateLimitPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "OUTREACH_EDGE_CONFIG";

/// Config file used when `OUTREACH_EDGE_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "config/edge.yaml";

/// Complete edge service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Listener settings
    pub server: ServerConfig,

    /// Key-value store connection
    pub store: StoreConfig,

    /// Cache manager tuning
    pub cache: CacheConfig,

    /// HTTP response cache
    pub http_cache: HttpCacheConfig,

    /// Rate limit policies and quotas
    pub rate_limit: RateLimitConfig,

    /// Cache warming scheduler
    pub warming: WarmingConfig,

    /// Identity propagated by the fronting auth service
    pub identity: IdentityConfig,

    /// CRUD API the edge forwards unmatched requests to
    pub upstream: Option<UpstreamConfig>,

    pub logging: LoggingConfig,
}

impl EdgeConfig {
    /// Load from `OUTREACH_EDGE_CONFIG` (or the default path), falling back
    /// to defaults when the file does not exist
    pub async fn load() -> EdgeResult<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        if tokio::fs::metadata(&path).await.is_err() {
            warn!(path = %path, "Config file not found, using defaults");
            let mut config = Self::default();
            config.apply_env_overrides()?;
            config.validate()?;
            return Ok(config);
        }

        Self::load_from_file(&path).await
    }

    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> EdgeResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| EdgeError::config(format!("Failed to read config file: {}", e)))?;

        let mut config = Self::from_yaml(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML without applying overrides or validation
    pub fn from_yaml(content: &str) -> EdgeResult<Self> {
        serde_yaml::from_str(content).map_err(|e| EdgeError::config(format!("Failed to parse config: {}", e)))
    }

    /// Apply environment variable overrides
    ///
    /// Variables follow the pattern `OUTREACH_EDGE_<SECTION>_<FIELD>`,
    /// e.g. `OUTREACH_EDGE_STORE_URL=redis://cache:6379`.
    pub fn apply_env_overrides(&mut self) -> EdgeResult<()> {
        use std::env;

        fn parse<T: std::str::FromStr>(name: &str, value: &str) -> EdgeResult<T>
        where
            T::Err: std::fmt::Display,
        {
            value
                .parse()
                .map_err(|e| EdgeError::config(format!("Invalid {}: {}", name, e)))
        }

        fn duration(name: &str, value: &str) -> EdgeResult<Duration> {
            humantime::parse_duration(value).map_err(|e| EdgeError::config(format!("Invalid {}: {}", name, e)))
        }

        if let Ok(addr) = env::var("OUTREACH_EDGE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }
        if let Ok(port) = env::var("OUTREACH_EDGE_SERVER_PORT") {
            self.server.port = parse("OUTREACH_EDGE_SERVER_PORT", &port)?;
        }
        if let Ok(timeout) = env::var("OUTREACH_EDGE_SERVER_REQUEST_TIMEOUT") {
            self.server.request_timeout = duration("OUTREACH_EDGE_SERVER_REQUEST_TIMEOUT", &timeout)?;
        }

        if let Ok(backend) = env::var("OUTREACH_EDGE_STORE_BACKEND") {
            self.store.backend = match backend.to_ascii_lowercase().as_str() {
                "redis" => StoreBackend::Redis,
                "memory" => StoreBackend::Memory,
                other => {
                    return Err(EdgeError::config(format!(
                        "Invalid OUTREACH_EDGE_STORE_BACKEND: unknown backend '{}'",
                        other
                    )))
                }
            };
        }
        if let Ok(url) = env::var("OUTREACH_EDGE_STORE_URL") {
            self.store.url = url;
        }
        if let Ok(size) = env::var("OUTREACH_EDGE_STORE_POOL_SIZE") {
            self.store.pool_size = parse("OUTREACH_EDGE_STORE_POOL_SIZE", &size)?;
        }
        if let Ok(timeout) = env::var("OUTREACH_EDGE_STORE_OPERATION_TIMEOUT") {
            self.store.operation_timeout = duration("OUTREACH_EDGE_STORE_OPERATION_TIMEOUT", &timeout)?;
        }
        if let Ok(prefix) = env::var("OUTREACH_EDGE_STORE_KEY_PREFIX") {
            self.store.key_prefix = prefix;
        }

        if let Ok(enabled) = env::var("OUTREACH_EDGE_HTTP_CACHE_ENABLED") {
            self.http_cache.enabled = parse("OUTREACH_EDGE_HTTP_CACHE_ENABLED", &enabled)?;
        }
        if let Ok(enabled) = env::var("OUTREACH_EDGE_RATE_LIMIT_ENABLED") {
            self.rate_limit.enabled = parse("OUTREACH_EDGE_RATE_LIMIT_ENABLED", &enabled)?;
        }

        if let Ok(enabled) = env::var("OUTREACH_EDGE_WARMING_ENABLED") {
            self.warming.enabled = parse("OUTREACH_EDGE_WARMING_ENABLED", &enabled)?;
        }
        if let Ok(interval) = env::var("OUTREACH_EDGE_WARMING_INTERVAL") {
            self.warming.interval = duration("OUTREACH_EDGE_WARMING_INTERVAL", &interval)?;
        }

        if let Ok(url) = env::var("OUTREACH_EDGE_UPSTREAM_URL") {
            match self.upstream.as_mut() {
                Some(upstream) => upstream.url = url,
                None => {
                    self.upstream = Some(UpstreamConfig {
                        url,
                        ..Default::default()
                    })
                }
            }
        }

        if let Ok(level) = env::var("OUTREACH_EDGE_LOGGING_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("OUTREACH_EDGE_LOGGING_FORMAT") {
            self.logging.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => {
                    return Err(EdgeError::config(format!(
                        "Invalid OUTREACH_EDGE_LOGGING_FORMAT: unknown format '{}'",
                        other
                    )))
                }
            };
        }

        Ok(())
    }

    /// Validate the whole configuration, reporting every problem together
    pub fn validate(&self) -> EdgeResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.is_empty() {
            errors.push("server.bind_address cannot be empty".to_string());
        }
        if self.server.request_timeout.is_zero() {
            errors.push("server.request_timeout must be greater than 0".to_string());
        }
        if self.server.max_request_size == 0 {
            errors.push("server.max_request_size must be greater than 0".to_string());
        }

        if self.store.pool_size == 0 {
            errors.push("store.pool_size must be greater than 0".to_string());
        }
        if self.store.operation_timeout.is_zero() {
            errors.push("store.operation_timeout must be greater than 0".to_string());
        }
        if self.store.key_prefix.is_empty() || self.store.key_prefix.contains(['*', '?']) {
            errors.push("store.key_prefix must be non-empty and free of glob characters".to_string());
        }
        if self.store.backend == StoreBackend::Redis
            && !(self.store.url.starts_with("redis://") || self.store.url.starts_with("rediss://"))
        {
            errors.push(format!("store.url '{}' is not a redis:// or rediss:// URL", self.store.url));
        }

        let mut seen_namespaces = Vec::new();
        for entry in &self.cache.namespace_ttls {
            if seen_namespaces.contains(&entry.namespace) {
                errors.push(format!("cache.namespace_ttls lists '{}' more than once", entry.namespace));
            }
            seen_namespaces.push(entry.namespace);
        }

        if self.http_cache.enabled {
            if self.http_cache.default_ttl.is_zero() {
                errors.push("http_cache.default_ttl must be greater than 0".to_string());
            }
            if self.http_cache.max_body_bytes == 0 {
                errors.push("http_cache.max_body_bytes must be greater than 0".to_string());
            }
            for path in self
                .http_cache
                .cacheable_paths
                .iter()
                .chain(&self.http_cache.excluded_paths)
                .chain(&self.http_cache.tenant_independent_paths)
            {
                if !path.starts_with('/') {
                    errors.push(format!("http_cache path prefix '{}' must start with '/'", path));
                }
            }
        }

        errors.extend(self.rate_limit.validation_errors());

        if self.warming.enabled && self.warming.interval.is_zero() {
            errors.push("warming.interval must be greater than 0".to_string());
        }

        if let Some(upstream) = &self.upstream {
            if !(upstream.url.starts_with("http://") || upstream.url.starts_with("https://")) {
                errors.push(format!("upstream.url '{}' must be an http(s) URL", upstream.url));
            }
            if upstream.timeout.is_zero() {
                errors.push("upstream.timeout must be greater than 0".to_string());
            }
        }

        if self.logging.level.trim().is_empty() {
            errors.push("logging.level cannot be empty".to_string());
        }

        for path in self.http_cache.tenant_sensitive_paths() {
            warn!(
                path = %path,
                "Cacheable path is not listed as tenant-independent; anonymous responses on it share the 'unknown' tenant key"
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EdgeError::config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,

    /// Upper bound on handling one request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Largest accepted request body in bytes
    pub max_request_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(30),
            max_request_size: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

/// Key-value store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Connection URL, used by the redis backend
    pub url: String,

    /// Number of multiplexed connections
    pub pool_size: usize,

    /// Bound on every store round-trip
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,

    /// Prefix of every key written by this service
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 4,
            operation_timeout: Duration::from_millis(250),
            key_prefix: "outreach".to_string(),
        }
    }
}

/// TTL override for one namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceTtl {
    pub namespace: CacheNamespace,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

/// Cache manager tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL for namespaces without an explicit override; unset keeps each
    /// namespace's built-in default
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub default_ttl: Option<Duration>,

    /// Serialized size above which entries are compressed
    pub compression_threshold: usize,

    pub namespace_ttls: Vec<NamespaceTtl>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: None,
            compression_threshold: crate::caching::cache_manager::DEFAULT_COMPRESSION_THRESHOLD,
            namespace_ttls: Vec::new(),
        }
    }
}

impl CacheConfig {
    /// Effective TTL for a namespace when callers pass none
    pub fn ttl_for(&self, namespace: CacheNamespace) -> Duration {
        self.namespace_ttls
            .iter()
            .find(|entry| entry.namespace == namespace)
            .map(|entry| entry.ttl)
            .or(self.default_ttl)
            .unwrap_or_else(|| namespace.default_ttl())
    }
}

/// HTTP response cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpCacheConfig {
    pub enabled: bool,

    /// TTL when the response carries no `max-age`
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    /// Path prefixes eligible for caching
    pub cacheable_paths: Vec<String>,

    /// Path prefixes never cached; wins over `cacheable_paths`
    pub excluded_paths: Vec<String>,

    /// Responses larger than this are passed through uncached
    pub max_body_bytes: usize,

    /// Cacheable prefixes whose responses do not depend on the caller
    pub tenant_independent_paths: Vec<String>,
}

impl Default for HttpCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(300),
            cacheable_paths: vec![
                "/api/campaigns".to_string(),
                "/api/leads".to_string(),
                "/api/analytics".to_string(),
                "/api/templates".to_string(),
            ],
            excluded_paths: vec![
                "/api/auth".to_string(),
                "/api/admin".to_string(),
                "/api/gdpr".to_string(),
                "/api/emails/send".to_string(),
            ],
            max_body_bytes: 1024 * 1024,
            tenant_independent_paths: vec!["/api/templates".to_string()],
        }
    }
}

impl HttpCacheConfig {
    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded_paths.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Cacheable prefix match, with exclusions taking precedence
    pub fn is_cacheable(&self, path: &str) -> bool {
        !self.is_excluded(path) && self.cacheable_paths.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }

    pub fn is_tenant_independent(&self, path: &str) -> bool {
        self.tenant_independent_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Cacheable prefixes not covered by `tenant_independent_paths`
    pub fn tenant_sensitive_paths(&self) -> Vec<&str> {
        self.cacheable_paths
            .iter()
            .filter(|path| !self.is_excluded(path) && !self.is_tenant_independent(path))
            .map(String::as_str)
            .collect()
    }
}

/// Per-endpoint policy override
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointPolicyConfig {
    pub method: String,
    pub path: String,
    #[serde(flatten)]
    pub policy: RateLimitPolicy,
}

/// Token bucket parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBucketConfig {
    pub max_tokens: f64,

    /// Tokens added per elapsed refill period
    pub refill_rate: f64,

    #[serde(with = "humantime_serde")]
    pub refill_period: Duration,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            max_tokens: 50.0,
            refill_rate: 5.0,
            refill_period: Duration::from_secs(10),
        }
    }
}

/// Daily email sending quota
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailQuotaConfig {
    /// Plan name → emails per calendar day
    pub plan_daily_limits: HashMap<String, u64>,

    /// Limit for plans not listed above
    pub default_daily_limit: u64,
}

impl Default for EmailQuotaConfig {
    fn default() -> Self {
        let plan_daily_limits = [("free", 100), ("starter", 1_000), ("pro", 10_000), ("enterprise", 100_000)]
            .into_iter()
            .map(|(plan, limit)| (plan.to_string(), limit))
            .collect();
        Self {
            plan_daily_limits,
            default_daily_limit: 50,
        }
    }
}

impl EmailQuotaConfig {
    /// Plan names match case-insensitively, as plan tiers do elsewhere
    pub fn limit_for(&self, plan: &str) -> u64 {
        self.plan_daily_limits
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(plan))
            .map(|(_, limit)| *limit)
            .unwrap_or(self.default_daily_limit)
    }
}

/// Rate limiting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,

    /// Path prefixes that are never limited
    pub exempt_paths: Vec<String>,

    /// Endpoint overrides, checked first
    pub endpoints: Vec<EndpointPolicyConfig>,

    /// Plan tier → policy for authenticated callers
    pub plans: HashMap<String, RateLimitPolicy>,

    /// Policy for authenticated callers whose plan is not listed
    pub authenticated_default: Option<RateLimitPolicy>,

    /// Policy for anonymous callers, keyed by client IP
    pub ip_default: RateLimitPolicy,

    pub token_bucket: TokenBucketConfig,

    pub email_quota: EmailQuotaConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let endpoint = |method: &str, path: &str, rpm, rph, description: &str| EndpointPolicyConfig {
            method: method.to_string(),
            path: path.to_string(),
            policy: RateLimitPolicy::new(rpm, rph, description),
        };
        let plans = [
            ("free", 60, 1_000),
            ("starter", 120, 3_000),
            ("pro", 300, 10_000),
            ("enterprise", 1_000, 50_000),
        ]
        .into_iter()
        .map(|(plan, rpm, rph)| {
            (
                plan.to_string(),
                RateLimitPolicy::new(rpm, rph, &format!("{} plan", plan)),
            )
        })
        .collect();

        Self {
            enabled: true,
            exempt_paths: vec!["/health".to_string(), "/metrics".to_string()],
            endpoints: vec![
                endpoint("POST", "/api/auth/login", 5, 20, "login attempts"),
                endpoint("POST", "/api/auth/register", 3, 10, "account registration"),
                endpoint("POST", "/api/emails/send", 10, 100, "email sending"),
                endpoint("POST", "/api/leads/import", 2, 20, "lead imports"),
            ],
            plans,
            authenticated_default: Some(RateLimitPolicy::new(100, 2_000, "authenticated user")),
            ip_default: RateLimitPolicy::new(30, 500, "anonymous client"),
            token_bucket: TokenBucketConfig::default(),
            email_quota: EmailQuotaConfig::default(),
        }
    }
}

impl RateLimitConfig {
    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }

    fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let mut check = |name: String, policy: &RateLimitPolicy| {
            if policy.requests_per_minute == 0 || policy.requests_per_hour == 0 {
                errors.push(format!("rate_limit policy {} must allow at least one request per window", name));
            }
            if policy.requests_per_hour < policy.requests_per_minute {
                errors.push(format!(
                    "rate_limit policy {} allows fewer requests per hour than per minute",
                    name
                ));
            }
        };

        for endpoint in &self.endpoints {
            check(format!("{}:{}", endpoint.method, endpoint.path), &endpoint.policy);
        }
        for (plan, policy) in &self.plans {
            check(format!("plan '{}'", plan), policy);
        }
        if let Some(policy) = &self.authenticated_default {
            check("authenticated_default".to_string(), policy);
        }
        check("ip_default".to_string(), &self.ip_default);

        for endpoint in &self.endpoints {
            if endpoint.method.parse::<axum::http::Method>().is_err() {
                errors.push(format!("rate_limit endpoint method '{}' is not an HTTP method", endpoint.method));
            }
            if !endpoint.path.starts_with('/') {
                errors.push(format!("rate_limit endpoint path '{}' must start with '/'", endpoint.path));
            }
        }

        let bucket = &self.token_bucket;
        if bucket.max_tokens <= 0.0 || bucket.refill_rate <= 0.0 {
            errors.push("rate_limit.token_bucket max_tokens and refill_rate must be positive".to_string());
        }
        if bucket.refill_period.is_zero() {
            errors.push("rate_limit.token_bucket.refill_period must be greater than 0".to_string());
        }

        errors
    }
}

/// Cache warming scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmingConfig {
    pub enabled: bool,

    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Feature flag name → value
    pub feature_flags: BTreeMap<String, Value>,

    /// Global system settings
    pub system_config: BTreeMap<String, Value>,

    /// Workspace id → settings document
    pub workspaces: BTreeMap<String, Value>,
}

impl Default for WarmingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(300),
            feature_flags: BTreeMap::new(),
            system_config: BTreeMap::new(),
            workspaces: BTreeMap::new(),
        }
    }
}

/// Identity headers set by the authenticating proxy in front of the edge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Read identity from the headers below; when false every request is anonymous
    pub trust_headers: bool,
    pub user_id_header: String,
    pub workspace_header: String,
    pub plan_header: String,
    pub role_header: String,

    /// Role granting access to admin endpoints
    pub admin_role: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            trust_headers: true,
            user_id_header: "x-user-id".to_string(),
            workspace_header: "x-workspace-id".to_string(),
            plan_header: "x-plan-tier".to_string(),
            role_header: "x-user-role".to_string(),
            admin_role: "admin".to_string(),
        }
    }
}

/// Upstream CRUD API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub url: String,

    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8000".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}
