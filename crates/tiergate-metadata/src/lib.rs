use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tiergate_core::tier::{SubscriptionStatus, Tier};

/// Persisted tier of one user, as last written by the webhook synchronizer
/// or an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierRecord {
    pub user_id: String,
    pub customer_id: Option<String>,
    pub tier: Tier,
    pub status: SubscriptionStatus,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub subscription_ends_at: Option<DateTime<Utc>>,
    /// Billing-side timestamp of the change this record reflects. Used to
    /// reject out-of-order webhook deliveries.
    pub updated_at: DateTime<Utc>,
}

/// Result of [`TierStore::apply_subscription_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// The event id was new and the record was written.
    Applied,
    /// The event id was already processed; nothing was written.
    Duplicate,
    /// The stored record is newer than the event; only the event id was
    /// recorded.
    Stale,
}

/// Durable store for resolved tiers.
///
/// The resolver treats it as the last source before the static fallback,
/// and the synchronizer is its only regular writer.
#[async_trait]
pub trait TierStore: Send + Sync + 'static {
    async fn get_user_tier_record(&self, user_id: &str) -> anyhow::Result<Option<TierRecord>>;

    /// Multi-key lookup. Users without a record are absent from the result.
    async fn get_user_tier_records(&self, user_ids: &[String]) -> anyhow::Result<Vec<TierRecord>>;

    async fn find_user_by_customer(&self, customer_id: &str) -> anyhow::Result<Option<String>>;

    async fn upsert_user_tier(&self, record: &TierRecord) -> anyhow::Result<()>;

    /// Claim `event_id` and write `record` in one transaction.
    async fn apply_subscription_event(
        &self,
        event_id: &str,
        record: &TierRecord,
    ) -> anyhow::Result<ApplyOutcome>;

    async fn ping(&self) -> anyhow::Result<()>;
}
