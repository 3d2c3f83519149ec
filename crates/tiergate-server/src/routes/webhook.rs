use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use svix::webhooks::Webhook;
use tiergate_core::tier::{SubscriptionStatus, Tier};
use tiergate_engine::{SubscriptionEvent, SubscriptionEventKind};
use tracing::{info, warn};

use crate::{
    error::AppError,
    sources::{
        stripe::{from_unix, StripeSubscription},
        PriceCatalog,
    },
    state::AppState,
};

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    id: Option<String>,
    #[serde(rename = "type")]
    event_type: String,
    created: Option<i64>,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    object: Value,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Idempotency key for a payload without an event id: identical
/// redeliveries hash to the same key.
pub fn body_event_id(body: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(body)))
}

/// Parse a verified payload. `Ok(None)` means the event type is not a
/// subscription change and is acknowledged without processing.
pub fn parse_event(
    body: &[u8],
    catalog: &PriceCatalog,
) -> Result<Option<SubscriptionEvent>, AppError> {
    let payload: WebhookPayload = serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(format!("malformed payload: {e}")))?;
    let Ok(kind) = payload.event_type.parse::<SubscriptionEventKind>() else {
        return Ok(None);
    };
    let subscription: StripeSubscription = serde_json::from_value(payload.data.object)
        .map_err(|e| AppError::BadRequest(format!("malformed subscription: {e}")))?;

    let status = subscription
        .status
        .parse::<SubscriptionStatus>()
        .map_err(|e| AppError::BadRequest(format!("{e}")))?;
    let tier = match catalog.plan_tier(
        subscription.price_ids(),
        subscription.metadata.get("tier").map(String::as_str),
    ) {
        Ok(tier) => tier,
        // The stored tier becomes Basic regardless of the plan.
        Err(_) if kind == SubscriptionEventKind::Deleted => Tier::Basic,
        Err(e) => return Err(AppError::BadRequest(e.to_string())),
    };

    Ok(Some(SubscriptionEvent {
        event_id: payload.id.unwrap_or_else(|| body_event_id(body)),
        kind,
        user_id: subscription.user_id().map(str::to_string),
        customer_id: subscription.customer,
        tier,
        status,
        trial_ends_at: from_unix(subscription.trial_end),
        current_period_end: from_unix(subscription.current_period_end),
        cancel_at_period_end: subscription.cancel_at_period_end,
        occurred_at: from_unix(payload.created).unwrap_or_else(Utc::now),
    }))
}

/// `POST /webhooks/billing`: subscription lifecycle events.
///
/// Verification: Standard Webhooks HMAC-SHA256 via the `svix` crate. The
/// payload is parsed into a [`SubscriptionEvent`] only after the signature
/// checks out. Replays answer 200 with a `duplicate` outcome.
///
/// The body is a Stripe `customer.subscription.*` event, but deliveries must
/// arrive through a Standard Webhooks relay (svix) that re-signs them with
/// `svix-id`, `svix-timestamp` and `svix-signature`. A delivery signed only
/// with Stripe's own `Stripe-Signature` header is rejected with 401.
#[tracing::instrument(skip_all)]
pub async fn billing_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let secret = state
        .config
        .webhook_signing_secret
        .as_deref()
        .ok_or(AppError::NotConfigured("billing webhook signing secret"))?;

    let Some(delivery_id) = header_str(&headers, "svix-id") else {
        warn!("Billing webhook missing svix-id header");
        return Err(AppError::Unauthorized);
    };

    let wh = Webhook::new(secret)
        .map_err(|e| anyhow::anyhow!("webhook verifier init failed: {e}"))?;
    // axum::http::HeaderMap implements svix::webhooks::HeaderMap.
    if let Err(e) = wh.verify(&body, &headers) {
        warn!(delivery_id, error = %e, "Billing webhook signature verification failed");
        return Err(AppError::Unauthorized);
    }

    let Some(event) = parse_event(&body, &state.catalog)? else {
        info!(delivery_id, "Ignoring non-subscription billing event");
        return Ok(Json(json!({ "outcome": "ignored" })).into_response());
    };

    let outcome = state.synchronizer.handle_event(event).await?;
    Ok(Json(outcome).into_response())
}
