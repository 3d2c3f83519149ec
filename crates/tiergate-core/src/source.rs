use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SourceError;
use crate::tier::{ResolutionSource, SubscriptionStatus, Tier, TierDetectionResult};

/// Raw claims held by the identity provider for a user.
///
/// Strings are kept as the provider sent them; the resolver parses them and
/// rejects values it does not recognise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityClaims {
    pub tier: Option<String>,
    pub status: Option<String>,
    pub billing_customer_id: Option<String>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub subscription_ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Live subscription as reported by the billing provider, already mapped to a
/// [`Tier`] by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingSubscription {
    pub tier: Tier,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
}

/// Identity provider (session/user claims). Best-effort, may be stale.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    async fn get_claims(&self, user_id: &str) -> anyhow::Result<Option<IdentityClaims>>;
}

/// Billing provider. Authoritative, higher latency.
#[async_trait]
pub trait BillingProvider: Send + Sync + 'static {
    async fn get_subscription(
        &self,
        customer_id: &str,
    ) -> anyhow::Result<Option<BillingSubscription>>;
}

/// Per-resolution scratch state shared between stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionContext {
    pub user_id: String,
    /// Learned from identity claims; the billing stage needs it.
    pub billing_customer_id: Option<String>,
}

impl ResolutionContext {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            billing_customer_id: None,
        }
    }
}

/// Tri-state answer of one resolver stage.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceOutcome {
    Resolved(TierDetectionResult),
    Miss,
    Failed(SourceError),
}

/// One stage of the ordered resolver chain.
#[async_trait]
pub trait TierSource: Send + Sync + 'static {
    fn kind(&self) -> ResolutionSource;

    async fn lookup(&self, ctx: &mut ResolutionContext) -> SourceOutcome;
}
