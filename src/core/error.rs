//! # Error Handling
//!
//! Service-level error type for the edge layer. Component errors
//! (`StoreError`, `CacheError`, `RateLimitError`) convert into [`EdgeError`]
//! at the HTTP boundary, where each variant maps onto a status code and a
//! structured JSON body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::convert::Infallible;
use thiserror::Error;

use crate::caching::CacheError;
use crate::rate_limiting::RateLimitError;
use crate::store::StoreError;

/// Result alias used by handlers and startup code
pub type EdgeResult<T> = Result<T, EdgeError>;

/// Errors surfaced by the edge service
#[derive(Debug, Error, Clone)]
pub enum EdgeError {
    /// Invalid or inconsistent configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Caller is not authenticated
    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },

    /// Caller is authenticated but not allowed to perform the operation
    #[error("Authorization failed: {reason}")]
    Authorization { reason: String },

    /// Request budget exhausted
    #[error("Rate limit exceeded: {limit} requests per {window}")]
    RateLimitExceeded { limit: u64, window: String },

    /// Daily quota exhausted
    #[error("Quota exceeded: {used} of {limit} used for {quota}")]
    QuotaExceeded { quota: String, used: u64, limit: u64 },

    /// A dependency (store, upstream) cannot be reached
    #[error("Service unavailable: {service} - {reason}")]
    ServiceUnavailable { service: String, reason: String },

    /// Operation exceeded its deadline
    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Malformed input (unknown namespace, missing field, ...)
    #[error("Request validation failed: {field} - {reason}")]
    RequestValidation { field: String, reason: String },

    /// Resource does not exist
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    /// Unexpected failure
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("JSON error: {message}")]
    Json { message: String },

    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// Upstream HTTP client failure
    #[error("HTTP client error: {message}")]
    HttpClient { message: String },
}

impl EdgeError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn auth<S: Into<String>>(reason: S) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    pub fn authz<S: Into<String>>(reason: S) -> Self {
        Self::Authorization {
            reason: reason.into(),
        }
    }

    pub fn service_unavailable<S: Into<String>>(service: S, reason: S) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a validation error for a named field
    pub fn validation<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self::RequestValidation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// HTTP status code returned to clients for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication { .. } => StatusCode::UNAUTHORIZED,
            Self::Authorization { .. } => StatusCode::FORBIDDEN,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::RequestValidation { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::HttpClient { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Transient errors that a client may retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ServiceUnavailable { .. }
                | Self::Timeout { .. }
                | Self::RateLimitExceeded { .. }
                | Self::HttpClient { .. }
                | Self::Io { .. }
        )
    }

    /// Machine-readable error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::Authentication { .. } => "authentication_error",
            Self::Authorization { .. } => "authorization_error",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Timeout { .. } => "timeout",
            Self::RequestValidation { .. } => "request_validation_error",
            Self::NotFound { .. } => "not_found",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
            Self::HttpClient { .. } => "http_client_error",
        }
    }
}

impl From<Infallible> for EdgeError {
    fn from(infallible: Infallible) -> Self {
        match infallible {}
    }
}

impl From<std::io::Error> for EdgeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EdgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for EdgeError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for EdgeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout { timeout_ms: 0 };
        }
        Self::HttpClient {
            message: err.to_string(),
        }
    }
}

impl From<StoreError> for EdgeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Timeout { timeout_ms } => Self::Timeout { timeout_ms },
            other if other.is_unavailable() => {
                Self::service_unavailable("kv-store".to_string(), other.to_string())
            }
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<CacheError> for EdgeError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Store(store) => store.into(),
            CacheError::InvalidNamespace { name } => {
                Self::validation("namespace", format!("unknown cache namespace '{}'", name))
            }
            other => Self::internal(format!("Cache error: {}", other)),
        }
    }
}

impl From<RateLimitError> for EdgeError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Store(store) => store.into(),
            RateLimitError::InvalidRequest { field, reason } => Self::validation(field, reason),
            other => Self::internal(format!("Rate limit error: {}", other)),
        }
    }
}

impl IntoResponse for EdgeError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
                "retryable": self.is_retryable(),
            }
        });

        (status, Json(error_response)).into_response()
    }
}
