//! # Admin API Tests
//!
//! Exercises the cache and rate limit admin endpoints through the full edge
//! router, identity and rate limiting middleware included.

mod common;

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::{TestRequest, TestServer};
use common::manual_clock;
use outreach_edge::caching::CacheNamespace;
use outreach_edge::core::config::EdgeConfig;
use outreach_edge::store::InMemoryStore;
use outreach_edge::{AppContext, EdgeServer};
use serde_json::{json, Value};
use std::sync::Arc;

fn create_context(mut config: EdgeConfig) -> AppContext {
    config
        .warming
        .feature_flags
        .insert("new_editor".to_string(), json!(true));
    config
        .warming
        .workspaces
        .insert("ws_1".to_string(), json!({"timezone": "Europe/Berlin"}));
    AppContext::with_store(config, Arc::new(InMemoryStore::new()), manual_clock()).unwrap()
}

fn create_test_server(context: &AppContext) -> TestServer {
    let app = EdgeServer::build_router(context, None).expect("router");
    TestServer::new(app).expect("Failed to create test server")
}

fn header(name: &'static str, value: &'static str) -> (HeaderName, HeaderValue) {
    (HeaderName::from_static(name), HeaderValue::from_static(value))
}

fn as_admin(request: TestRequest) -> TestRequest {
    let (user_name, user) = header("x-user-id", "1");
    let (role_name, role) = header("x-user-role", "admin");
    request.add_header(user_name, user).add_header(role_name, role)
}

fn as_member(request: TestRequest, workspace: &'static str) -> TestRequest {
    let (user_name, user) = header("x-user-id", "2");
    let (ws_name, ws) = header("x-workspace-id", workspace);
    let (plan_name, plan) = header("x-plan-tier", "free");
    request
        .add_header(user_name, user)
        .add_header(ws_name, ws)
        .add_header(plan_name, plan)
}

#[tokio::test]
async fn test_health_probes() {
    let context = create_context(EdgeConfig::default());
    let server = create_test_server(&context);

    let response = server.get("/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");

    let response = server.get("/ready").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["store"]["backend"], "memory");

    let response = server.get("/cache/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["healthy"], true);
}

#[tokio::test]
async fn test_admin_routes_require_admin_role() {
    let context = create_context(EdgeConfig::default());
    let server = create_test_server(&context);

    assert_eq!(server.get("/cache/stats").await.status_code(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        as_member(server.get("/cache/stats"), "ws_1").await.status_code(),
        StatusCode::FORBIDDEN
    );
    assert_eq!(
        as_member(server.get("/rate-limit/metrics"), "ws_1").await.status_code(),
        StatusCode::FORBIDDEN
    );

    let response = as_admin(server.get("/cache/stats")).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert!(body["stats"]["namespaces"].get("api_responses").is_some());
    assert_eq!(body["memory"]["backend"], "memory");
}

#[tokio::test]
async fn test_stats_for_unknown_namespace_is_bad_request() {
    let context = create_context(EdgeConfig::default());
    let server = create_test_server(&context);

    let response = as_admin(server.get("/cache/stats").add_query_param("namespace", "bogus")).await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let response = as_admin(server.get("/cache/stats").add_query_param("namespace", "analytics")).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["stats"]["namespaces"].as_object().unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalidate_by_pattern_and_tag() {
    let context = create_context(EdgeConfig::default());
    let server = create_test_server(&context);

    for key in ["lead:1", "lead:2", "company:1"] {
        context
            .cache
            .set(key, &json!({"ok": true}), None, CacheNamespace::LeadEnrichment)
            .await
            .unwrap();
    }

    let response = as_admin(server.post("/cache/invalidate"))
        .json(&json!({"namespace": "lead_enrichment", "pattern": "lead:*"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["invalidated_count"], 2);

    // Neither a pattern nor a tag
    let response = as_admin(server.post("/cache/invalidate"))
        .json(&json!({"namespace": "lead_enrichment"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let response = as_admin(server.post("/cache/invalidate"))
        .json(&json!({"tag": "workspace:ws_404"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["invalidated_count"], 0);
}

#[tokio::test]
async fn test_clear_namespace() {
    let context = create_context(EdgeConfig::default());
    let server = create_test_server(&context);

    context
        .cache
        .set("summary", &json!({"sent": 10}), None, CacheNamespace::Analytics)
        .await
        .unwrap();

    let response = as_admin(server.post("/cache/clear"))
        .json(&json!({"namespace": "analytics"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["invalidated_count"], 1);
    assert!(context
        .cache
        .get::<Value>("summary", CacheNamespace::Analytics)
        .await
        .is_none());

    let response = as_admin(server.post("/cache/clear"))
        .json(&json!({"namespace": "nope"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_warm_workspace_is_tenant_scoped() {
    let context = create_context(EdgeConfig::default());
    let server = create_test_server(&context);

    let response = as_member(server.post("/cache/warm/workspace/ws_1"), "ws_1").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["keys_warmed"], 1);

    let cached: Value = context
        .cache
        .get("workspace:ws_1", CacheNamespace::WorkspaceSettings)
        .await
        .unwrap();
    assert_eq!(cached["timezone"], "Europe/Berlin");

    let response = as_member(server.post("/cache/warm/workspace/ws_1"), "ws_2").await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);

    let response = as_admin(server.post("/cache/warm/workspace/ws_unknown")).await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_warming_scheduler_start_stop() {
    let context = create_context(EdgeConfig::default());
    let server = create_test_server(&context);

    let response = as_admin(server.post("/cache/warming/start")).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["running"], true);
    assert_eq!(body["changed"], true);

    let body: Value = as_admin(server.post("/cache/warming/start")).await.json();
    assert_eq!(body["changed"], false);

    let body: Value = as_admin(server.post("/cache/warming/stop")).await.json();
    assert_eq!(body["running"], false);
    assert_eq!(body["changed"], true);
    assert!(!context.warmer.is_running());
}

#[tokio::test]
async fn test_rate_limit_headers_and_rejection() {
    let mut config = EdgeConfig::default();
    config.rate_limit.ip_default.requests_per_minute = 2;
    let context = create_context(config);
    let server = create_test_server(&context);

    let response = server.get("/api/leads").await;
    // No upstream configured
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(response.header("x-ratelimit-limit-minute"), "2");
    assert_eq!(response.header("x-ratelimit-remaining-minute"), "1");

    server.get("/api/leads").await;
    let response = server.get("/api/leads").await;
    assert_eq!(response.status_code(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.header("retry-after"), "60");
    let body: Value = response.json();
    assert_eq!(body["error"]["retryable"], true);

    // Probes are exempt
    assert_eq!(server.get("/health").await.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limit_admin_usage_and_reset() {
    let mut config = EdgeConfig::default();
    config.rate_limit.ip_default.requests_per_minute = 2;
    let context = create_context(config);
    let server = create_test_server(&context);

    for _ in 0..3 {
        server.get("/api/leads").await;
    }
    assert_eq!(
        server.get("/api/leads").await.status_code(),
        StatusCode::TOO_MANY_REQUESTS
    );

    let body: Value = as_admin(server.get("/rate-limit/usage/ip:unknown")).await.json();
    assert_eq!(body["minute"], 4);

    let response = as_admin(server.delete("/rate-limit/ip:unknown")).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["removed"], 2);

    assert_eq!(server.get("/api/leads").await.status_code(), StatusCode::NOT_FOUND);

    let metrics: Value = as_admin(server.get("/rate-limit/metrics")).await.json();
    assert_eq!(metrics["requests_denied"], 2);

    let policies: Value = as_admin(server.get("/rate-limit/policies")).await.json();
    let names: Vec<&str> = policies
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|entry| entry["name"].as_str())
        .collect();
    assert!(names.contains(&"POST:/api/emails/send"));
    assert!(names.contains(&"user_type:pro"));
    assert_eq!(names.last(), Some(&"ip_default"));
}

#[tokio::test]
async fn test_email_quota_endpoints() {
    let context = create_context(EdgeConfig::default());
    let server = create_test_server(&context);

    let response = as_member(server.post("/rate-limit/quota/ws_1"), "ws_1")
        .json(&json!({"count": 90}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["remaining"], 10);

    let response = as_member(server.post("/rate-limit/quota/ws_1"), "ws_1")
        .json(&json!({"count": 11}))
        .await;
    assert_eq!(response.status_code(), StatusCode::TOO_MANY_REQUESTS);

    let body: Value = as_member(server.get("/rate-limit/quota/ws_1"), "ws_1").await.json();
    assert_eq!(body["used"], 90);
    assert_eq!(body["limit"], 100);
    assert_eq!(body["plan"], "free");

    let response = as_member(server.get("/rate-limit/quota/ws_1"), "ws_9").await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_email_quota_rejects_oversized_batches() {
    let context = create_context(EdgeConfig::default());
    let server = create_test_server(&context);

    for count in [101u64, i64::MAX as u64 + 1, u64::MAX - 999] {
        let response = as_member(server.post("/rate-limit/quota/ws_1"), "ws_1")
            .json(&json!({ "count": count }))
            .await;
        assert_eq!(response.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    let response = as_member(server.post("/rate-limit/quota/ws_1"), "ws_1")
        .json(&json!({"count": 1000}))
        .await;
    assert_eq!(response.status_code(), StatusCode::TOO_MANY_REQUESTS);

    let body: Value = as_member(server.get("/rate-limit/quota/ws_1"), "ws_1").await.json();
    assert_eq!(body["used"], 0);

    let response = as_member(server.post("/rate-limit/quota/ws_1"), "ws_1")
        .json(&json!({"count": 100}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
}
