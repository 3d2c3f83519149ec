use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use tiergate_core::config::Config;
use tiergate_core::tier::{SubscriptionStatus, Tier};
use tiergate_core::AccessDecisionEngine;
use tiergate_duckdb::DuckDbBackend;
use tiergate_metadata::{TierRecord, TierStore};
use tiergate_server::app::build_app;
use tiergate_server::state::AppState;

const ADMIN_TOKEN: &str = "integration-admin-token";

fn test_config() -> Config {
    Config {
        port: 0,
        data_dir: "/tmp/tiergate-test".to_string(),
        duckdb_memory_limit: "256MB".to_string(),
        cors_origins: vec!["https://app.example.com".to_string()],
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
        batch_max_size: 1,
        fallback_tier: Tier::Basic,
        matrix_path: None,
        routes_path: None,
        clerk_secret_key: None,
        clerk_api_url: "http://127.0.0.1:9/v1".to_string(),
        stripe_secret_key: None,
        stripe_api_url: "http://127.0.0.1:9/v1".to_string(),
        price_tiers: BTreeMap::new(),
        webhook_signing_secret: None,
        session_secret: None,
        admin_token: Some(ADMIN_TOKEN.to_string()),
    }
}

async fn setup() -> (Arc<AppState>, Arc<dyn TierStore>) {
    let db = DuckDbBackend::open_in_memory().expect("in-memory duckdb");
    db.upsert_user_tier(&TierRecord {
        user_id: "u1".to_string(),
        customer_id: None,
        tier: Tier::Professional,
        status: SubscriptionStatus::Active,
        trial_ends_at: None,
        subscription_ends_at: None,
        updated_at: Utc::now(),
    })
    .await
    .expect("seed user");
    let store: Arc<dyn TierStore> = Arc::new(db);
    let engine = AccessDecisionEngine::builtin().expect("builtin engine");
    let state = Arc::new(AppState::new(
        test_config(),
        engine,
        Arc::clone(&store),
        None,
        None,
    ));
    (state, store)
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

fn admin_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
        .body(Body::empty())
        .expect("build request")
}

/// BDD: stats reflect a miss followed by a hit; invalidation removes the
/// entry and the next lookup resolves again.
#[tokio::test]
async fn stats_and_invalidation() {
    let (state, _) = setup().await;
    let app = build_app(Arc::clone(&state));

    state.gate.resolve_tier("u1").await.expect("first resolve");
    state.gate.resolve_tier("u1").await.expect("cached resolve");

    let response = app
        .clone()
        .oneshot(admin_request("GET", "/api/cache/stats"))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["misses"], 1);
    assert_eq!(json["hits"], 1);
    assert_eq!(json["entry_count"], 1);
    assert_eq!(json["hit_rate"], 0.5);

    let response = app
        .clone()
        .oneshot(admin_request("POST", "/api/cache/invalidate/u1"))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["removed"], 1);

    // Idempotent.
    let response = app
        .clone()
        .oneshot(admin_request("POST", "/api/cache/invalidate/u1"))
        .await
        .expect("request");
    assert_eq!(json_body(response).await["removed"], 0);

    let tier = state.gate.resolve_tier("u1").await.expect("re-resolve");
    assert_eq!(tier.tier, Tier::Professional);
    let response = app
        .oneshot(admin_request("GET", "/api/cache/stats"))
        .await
        .expect("request");
    let json = json_body(response).await;
    assert_eq!(json["misses"], 2);
    assert_eq!(json["invalidations"], 1);
}

#[tokio::test]
async fn admin_endpoints_reject_wrong_token() {
    let (state, _) = setup().await;
    let app = build_app(state);

    let request = Request::builder()
        .method("POST")
        .uri("/api/cache/invalidate/u1")
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .expect("build request");
    let response = app.clone().oneshot(request).await.expect("request");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let request = Request::builder()
        .method("GET")
        .uri("/api/cache/stats")
        .body(Body::empty())
        .expect("build request");
    let response = app.oneshot(request).await.expect("request");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
