use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tiergate_core::source::{IdentityClaims, IdentityProvider};

#[derive(Debug, Deserialize)]
struct ClerkUser {
    #[serde(default)]
    public_metadata: Value,
}

/// Tier fields the billing integration writes into `public_metadata`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TierMetadata {
    tier: Option<String>,
    subscription_status: Option<String>,
    stripe_customer_id: Option<String>,
    trial_ends_at: Option<DateTime<Utc>>,
    current_period_end: Option<DateTime<Utc>>,
}

/// Turn a user's `public_metadata` into raw claims. Values are passed
/// through unparsed; the resolver decides whether to trust them.
pub fn claims_from_metadata(metadata: Value) -> Result<IdentityClaims> {
    let fields: TierMetadata = if metadata.is_null() {
        TierMetadata::default()
    } else {
        serde_json::from_value(metadata.clone()).context("malformed public_metadata")?
    };
    Ok(IdentityClaims {
        tier: fields.tier,
        status: fields.subscription_status,
        billing_customer_id: fields.stripe_customer_id,
        trial_ends_at: fields.trial_ends_at,
        subscription_ends_at: fields.current_period_end,
        metadata,
    })
}

/// Identity provider backed by the Clerk Backend API.
#[derive(Clone)]
pub struct ClerkIdentityProvider {
    client: Client,
    api_url: String,
    secret_key: String,
}

impl ClerkIdentityProvider {
    pub fn new(api_url: &str, secret_key: &str) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
        }
    }
}

#[async_trait]
impl IdentityProvider for ClerkIdentityProvider {
    async fn get_claims(&self, user_id: &str) -> Result<Option<IdentityClaims>> {
        let mut url = reqwest::Url::parse(&self.api_url).context("Invalid Clerk API URL")?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Clerk API URL cannot be a base"))?
            .extend(["users", user_id]);

        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .context("Clerk HTTP request failed")?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Clerk error {status}: {body}");
        }

        let user: ClerkUser = resp.json().await.context("Clerk response parse failed")?;
        claims_from_metadata(user.public_metadata).map(Some)
    }
}
