use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::{middleware::from_fn_with_state, routing::get, Extension, Router};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use tiergate_core::config::Config;
use tiergate_core::tier::{SubscriptionStatus, Tier};
use tiergate_core::AccessDecisionEngine;
use tiergate_duckdb::DuckDbBackend;
use tiergate_metadata::{TierRecord, TierStore};
use tiergate_server::app::build_app;
use tiergate_server::auth::session::encode_session;
use tiergate_server::middleware::{tier_gate, GateContext};
use tiergate_server::state::AppState;

const SESSION_SECRET: &str = "integration-session-secret";
const ADMIN_TOKEN: &str = "integration-admin-token";

fn test_config() -> Config {
    Config {
        port: 0,
        data_dir: "/tmp/tiergate-test".to_string(),
        duckdb_memory_limit: "256MB".to_string(),
        cors_origins: vec![],
        cache_ttl_secs: 300,
        cache_degraded_ttl_secs: 15,
        cache_max_entries: 1_000,
        cache_max_bytes: 1024 * 1024,
        cache_sweep_interval_secs: 0,
        identity_budget_ms: 25,
        billing_budget_ms: 40,
        store_budget_ms: 500,
        decision_budget_ms: 1_000,
        batch_delay_ms: 2,
        batch_max_size: 64,
        fallback_tier: Tier::Basic,
        matrix_path: None,
        routes_path: None,
        clerk_secret_key: None,
        clerk_api_url: "http://127.0.0.1:9/v1".to_string(),
        stripe_secret_key: None,
        stripe_api_url: "http://127.0.0.1:9/v1".to_string(),
        price_tiers: BTreeMap::new(),
        webhook_signing_secret: None,
        session_secret: Some(SESSION_SECRET.to_string()),
        admin_token: Some(ADMIN_TOKEN.to_string()),
    }
}

async fn state_with_users(users: &[(&str, Tier)]) -> Arc<AppState> {
    let db = DuckDbBackend::open_in_memory().expect("in-memory duckdb");
    for (user_id, tier) in users {
        db.upsert_user_tier(&TierRecord {
            user_id: user_id.to_string(),
            customer_id: None,
            tier: *tier,
            status: SubscriptionStatus::Active,
            trial_ends_at: None,
            subscription_ends_at: None,
            updated_at: Utc::now(),
        })
        .await
        .expect("seed user");
    }
    let store: Arc<dyn TierStore> = Arc::new(db);
    let engine = AccessDecisionEngine::builtin().expect("builtin engine");
    Arc::new(AppState::new(test_config(), engine, store, None, None))
}

fn session(user_id: &str) -> String {
    encode_session(SESSION_SECRET, user_id, chrono::Duration::hours(1)).expect("session token")
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("parse JSON body")
}

fn decide_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/access/decide")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
        .body(Body::from(body.to_string()))
        .expect("build request")
}

/// BDD: a Basic user asking for the Professional dashboard is sent to their
/// own dashboard; a Professional user is let in.
#[tokio::test]
async fn decide_endpoint_returns_routing_decision() {
    let state = state_with_users(&[("u_basic", Tier::Basic), ("u_pro", Tier::Professional)]).await;
    let app = build_app(state);

    let response = app
        .clone()
        .oneshot(decide_request(
            json!({ "path": "/dashboard/professional", "user_id": "u_basic" }),
        ))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["allow_access"], false);
    assert_eq!(json["should_redirect"], true);
    assert_eq!(json["target_route"], "/dashboard/basic");
    assert_eq!(json["reason"], "insufficient_tier");
    assert_eq!(json["current_tier"], "basic");
    assert_eq!(json["required_tier"], "professional");

    let response = app
        .oneshot(decide_request(
            json!({ "path": "/dashboard/professional", "user_id": "u_pro" }),
        ))
        .await
        .expect("request");
    let json = json_body(response).await;
    assert_eq!(json["allow_access"], true);
    assert_eq!(json["reason"], "access_granted");
}

#[tokio::test]
async fn decide_without_user_is_anonymous() {
    let app = build_app(state_with_users(&[]).await);
    let response = app
        .oneshot(decide_request(json!({ "path": "/reports/q3" })))
        .await
        .expect("request");
    let json = json_body(response).await;
    assert_eq!(json["allow_access"], false);
    assert_eq!(json["reason"], "authentication_required");
    assert_eq!(json["target_route"], "/sign-in");
    assert!(json["current_tier"].is_null());
}

#[tokio::test]
async fn decide_requires_admin_token() {
    let app = build_app(state_with_users(&[]).await);
    let request = Request::builder()
        .method("POST")
        .uri("/api/access/decide")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "path": "/" }).to_string()))
        .expect("build request");
    let response = app.oneshot(request).await.expect("request");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// BDD: an unknown user resolves to the fallback tier instead of failing.
#[tokio::test]
async fn unknown_user_gets_fallback_tier() {
    let app = build_app(state_with_users(&[]).await);
    let response = app
        .oneshot(decide_request(
            json!({ "path": "/api/reports/export", "user_id": "ghost" }),
        ))
        .await
        .expect("request");
    let json = json_body(response).await;
    assert_eq!(json["current_tier"], "basic");
    assert_eq!(json["allow_access"], false);
    assert_eq!(json["should_redirect"], false);
    assert_eq!(json["target_route"], "/upgrade?feature=pdf_reports");
}

fn check_request(path: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("GET")
        .uri(format!("/api/access/check?path={path}"));
    if let Some(token) = token {
        builder = builder.header(header::COOKIE, format!("__session={token}"));
    }
    builder.body(Body::empty()).expect("build request")
}

/// BDD: forward-auth maps decisions onto 200 / 307 / 401 / 403.
#[tokio::test]
async fn check_endpoint_maps_decisions_to_status_codes() {
    let state = state_with_users(&[("u_basic", Tier::Basic), ("u_ent", Tier::Enterprise)]).await;
    let app = build_app(state);
    let basic = session("u_basic");
    let ent = session("u_ent");

    let response = app
        .clone()
        .oneshot(check_request("/team", Some(&ent)))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-tiergate-tier").and_then(|v| v.to_str().ok()),
        Some("enterprise")
    );

    let response = app
        .clone()
        .oneshot(check_request("/team", Some(&basic)))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers().get(header::LOCATION).and_then(|v| v.to_str().ok()),
        Some("/dashboard/basic")
    );

    let response = app
        .clone()
        .oneshot(check_request("/api/v1/companies", Some(&basic)))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = json_body(response).await;
    assert_eq!(json["reason"], "insufficient_tier");

    let response = app
        .clone()
        .oneshot(check_request("/api/v1/companies", None))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(check_request("/pricing", None))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn check_reads_forwarded_uri_header() {
    let app = build_app(state_with_users(&[]).await);
    let request = Request::builder()
        .method("GET")
        .uri("/api/access/check")
        .header("x-forwarded-uri", "/dashboard")
        .body(Body::empty())
        .expect("build request");
    let response = app.oneshot(request).await.expect("request");
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers().get(header::LOCATION).and_then(|v| v.to_str().ok()),
        Some("/sign-in")
    );
}

#[tokio::test]
async fn check_without_path_is_bad_request() {
    let app = build_app(state_with_users(&[]).await);
    let request = Request::builder()
        .method("GET")
        .uri("/api/access/check")
        .body(Body::empty())
        .expect("build request");
    let response = app.oneshot(request).await.expect("request");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = json_body(response).await;
    assert_eq!(json["error"]["code"], "validation_error");
}

async fn whoami(Extension(ctx): Extension<GateContext>) -> String {
    format!("{}:{}", ctx.user_id, ctx.decision.reason.message())
}

fn gated_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/reports/{id}", get(whoami))
        .route("/api/reports/{id}", get(whoami))
        .route("/pricing", get(|| async { "pricing" }))
        .layer(from_fn_with_state(Arc::clone(&state), tier_gate))
        .with_state(state)
}

fn gated_request(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).expect("build request")
}

/// BDD: the middleware lets entitled users through with a [`GateContext`],
/// redirects browser routes and answers API routes with JSON errors.
#[tokio::test]
async fn tier_gate_middleware_guards_host_routes() {
    let state = state_with_users(&[("u_basic", Tier::Basic), ("u_pro", Tier::Professional)]).await;
    let app = gated_app(state);

    let response = app
        .clone()
        .oneshot(gated_request("/reports/q3", Some(&session("u_pro"))))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.expect("body").to_bytes();
    assert_eq!(&body[..], b"u_pro:access granted");

    let response = app
        .clone()
        .oneshot(gated_request("/reports/q3", Some(&session("u_basic"))))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers().get(header::LOCATION).and_then(|v| v.to_str().ok()),
        Some("/dashboard/basic")
    );

    let response = app
        .clone()
        .oneshot(gated_request("/api/reports/q3", Some(&session("u_basic"))))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = json_body(response).await;
    assert_eq!(json["error"]["code"], "insufficient_tier");

    let response = app
        .clone()
        .oneshot(gated_request("/api/reports/q3", None))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(gated_request("/pricing", None))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
}
