use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{routing::get, Json, Router};
use serde_json::json;

use tiergate_core::config::Config;
use tiergate_core::source::{BillingProvider, IdentityProvider};
use tiergate_core::tier::{ResolutionSource, SubscriptionStatus, Tier};
use tiergate_core::AccessDecisionEngine;
use tiergate_duckdb::DuckDbBackend;
use tiergate_server::sources::{
    providers_from_config, ClerkIdentityProvider, PriceCatalog, StripeBillingProvider,
};
use tiergate_server::state::AppState;

const CLERK_KEY: &str = "sk_test_clerk";
const STRIPE_KEY: &str = "sk_test_stripe";

fn authorized(headers: &HeaderMap, key: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some(format!("Bearer {key}").as_str())
}

async fn clerk_user(Path(user_id): Path<String>, headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&headers, CLERK_KEY) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match user_id.as_str() {
        "user_paid" => Json(json!({
            "id": "user_paid",
            "public_metadata": { "stripeCustomerId": "cus_paid" }
        }))
        .into_response(),
        "user_claims" => Json(json!({
            "id": "user_claims",
            "public_metadata": { "tier": "pro", "subscriptionStatus": "trialing" }
        }))
        .into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn stripe_subscriptions(
    Query(params): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&headers, STRIPE_KEY) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    assert_eq!(params.get("status").map(String::as_str), Some("all"));
    let data = match params.get("customer").map(String::as_str) {
        Some("cus_paid") => json!([{
            "id": "sub_1",
            "customer": "cus_paid",
            "status": "active",
            "cancel_at_period_end": false,
            "current_period_end": 4_102_444_800_i64,
            "items": { "data": [ { "price": { "id": "price_ent" } } ] }
        }]),
        _ => json!([]),
    };
    Json(json!({ "object": "list", "data": data })).into_response()
}

/// Serve stub Clerk and Stripe APIs on an ephemeral port; returns the base URL.
async fn spawn_stub_apis() -> String {
    let app = Router::new()
        .route("/clerk/v1/users/{id}", get(clerk_user))
        .route("/stripe/v1/subscriptions", get(stripe_subscriptions));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{addr}")
}

fn catalog() -> BTreeMap<String, Tier> {
    BTreeMap::from([("price_ent".to_string(), Tier::Enterprise)])
}

#[tokio::test]
async fn clerk_adapter_reads_public_metadata() {
    let base = spawn_stub_apis().await;
    let clerk = ClerkIdentityProvider::new(&format!("{base}/clerk/v1"), CLERK_KEY);

    let claims = clerk
        .get_claims("user_claims")
        .await
        .expect("request")
        .expect("user exists");
    assert_eq!(claims.tier.as_deref(), Some("pro"));
    assert_eq!(claims.status.as_deref(), Some("trialing"));

    assert!(clerk.get_claims("nobody").await.expect("request").is_none());

    let wrong_key = ClerkIdentityProvider::new(&format!("{base}/clerk/v1"), "sk_wrong");
    assert!(wrong_key.get_claims("user_claims").await.is_err());
}

#[tokio::test]
async fn stripe_adapter_maps_latest_subscription() {
    let base = spawn_stub_apis().await;
    let stripe = StripeBillingProvider::new(
        &format!("{base}/stripe/v1"),
        STRIPE_KEY,
        PriceCatalog::new(catalog()),
    );

    let sub = stripe
        .get_subscription("cus_paid")
        .await
        .expect("request")
        .expect("subscription exists");
    assert_eq!(sub.tier, Tier::Enterprise);
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert!(stripe.get_subscription("cus_none").await.expect("request").is_none());
}

/// BDD: identity claims without a tier hand the customer id to the billing
/// stage, which answers authoritatively; claims with a tier answer directly.
#[tokio::test]
async fn configured_providers_drive_resolution() {
    let base = spawn_stub_apis().await;
    let config = Config {
        clerk_secret_key: Some(CLERK_KEY.to_string()),
        clerk_api_url: format!("{base}/clerk/v1"),
        stripe_secret_key: Some(STRIPE_KEY.to_string()),
        stripe_api_url: format!("{base}/stripe/v1"),
        price_tiers: catalog(),
        identity_budget_ms: 2_000,
        billing_budget_ms: 2_000,
        store_budget_ms: 2_000,
        decision_budget_ms: 5_000,
        cache_sweep_interval_secs: 0,
        ..Config::default()
    };
    let (identity, billing) = providers_from_config(&config);
    assert!(identity.is_some());
    assert!(billing.is_some());

    let store = Arc::new(DuckDbBackend::open_in_memory().expect("in-memory duckdb"));
    let engine = AccessDecisionEngine::builtin().expect("builtin engine");
    let state = AppState::new(config, engine, store, identity, billing);

    let paid = state.gate.resolve_tier("user_paid").await.expect("resolve");
    assert_eq!(paid.tier, Tier::Enterprise);
    assert_eq!(paid.source, ResolutionSource::Billing);

    let claimed = state.gate.resolve_tier("user_claims").await.expect("resolve");
    assert_eq!(claimed.tier, Tier::Professional);
    assert!(claimed.is_trialing);
    assert_eq!(claimed.source, ResolutionSource::IdentityProvider);

    let decision = state.gate.decide_access("/api/v1/companies", "user_paid").await;
    assert!(decision.allow_access);
}
