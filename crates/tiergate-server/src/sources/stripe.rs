use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tiergate_core::source::{BillingProvider, BillingSubscription};
use tiergate_core::tier::SubscriptionStatus;

use super::catalog::{PlanError, PriceCatalog};

/// Subscription object as Stripe serializes it, reduced to the fields tier
/// resolution needs. Shared by the API adapter and the webhook parser.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    pub customer: String,
    pub status: String,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<i64>,
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub items: StripeItems,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StripeItems {
    #[serde(default)]
    pub data: Vec<StripeItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeItem {
    pub price: StripePrice,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripePrice {
    pub id: String,
}

#[derive(Debug, Deserialize)]
struct SubscriptionList {
    data: Vec<StripeSubscription>,
}

pub fn from_unix(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

impl StripeSubscription {
    pub fn price_ids(&self) -> impl Iterator<Item = &str> {
        self.items.data.iter().map(|item| item.price.id.as_str())
    }

    /// User id stamped on the subscription by checkout, when present.
    pub fn user_id(&self) -> Option<&str> {
        self.metadata
            .get("user_id")
            .or_else(|| self.metadata.get("userId"))
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    pub fn status(&self) -> Result<SubscriptionStatus> {
        self.status
            .parse::<SubscriptionStatus>()
            .with_context(|| format!("subscription {}", self.id))
    }

    pub fn to_billing(&self, catalog: &PriceCatalog) -> Result<BillingSubscription> {
        let tier = catalog
            .plan_tier(self.price_ids(), self.metadata.get("tier").map(String::as_str))
            .map_err(|e: PlanError| anyhow::anyhow!("subscription {}: {e}", self.id))?;
        Ok(BillingSubscription {
            tier,
            status: self.status()?,
            current_period_end: from_unix(self.current_period_end),
            trial_end: from_unix(self.trial_end),
            cancel_at_period_end: self.cancel_at_period_end,
        })
    }
}

/// Billing provider backed by the Stripe REST API.
#[derive(Clone)]
pub struct StripeBillingProvider {
    client: Client,
    api_url: String,
    secret_key: String,
    catalog: PriceCatalog,
}

impl StripeBillingProvider {
    pub fn new(api_url: &str, secret_key: &str, catalog: PriceCatalog) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
            catalog,
        }
    }
}

#[async_trait]
impl BillingProvider for StripeBillingProvider {
    /// Most recent subscription of `customer_id`, whatever its status.
    async fn get_subscription(&self, customer_id: &str) -> Result<Option<BillingSubscription>> {
        let mut url = reqwest::Url::parse(&format!("{}/subscriptions", self.api_url))
            .context("Invalid Stripe API URL")?;
        url.query_pairs_mut()
            .append_pair("customer", customer_id)
            .append_pair("status", "all")
            .append_pair("limit", "1");

        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .context("Stripe HTTP request failed")?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Stripe error {status}: {body}");
        }

        let list: SubscriptionList = resp.json().await.context("Stripe response parse failed")?;
        list.data
            .first()
            .map(|sub| sub.to_billing(&self.catalog))
            .transpose()
    }
}
