use async_trait::async_trait;
use tiergate_metadata::{ApplyOutcome, TierRecord, TierStore};

use crate::backend::DuckDbBackend;

#[async_trait]
impl TierStore for DuckDbBackend {
    async fn get_user_tier_record(&self, user_id: &str) -> anyhow::Result<Option<TierRecord>> {
        DuckDbBackend::get_user_tier_record(self, user_id).await
    }

    async fn get_user_tier_records(&self, user_ids: &[String]) -> anyhow::Result<Vec<TierRecord>> {
        DuckDbBackend::get_user_tier_records(self, user_ids).await
    }

    async fn find_user_by_customer(&self, customer_id: &str) -> anyhow::Result<Option<String>> {
        DuckDbBackend::find_user_by_customer(self, customer_id).await
    }

    async fn upsert_user_tier(&self, record: &TierRecord) -> anyhow::Result<()> {
        DuckDbBackend::upsert_user_tier(self, record).await
    }

    async fn apply_subscription_event(
        &self,
        event_id: &str,
        record: &TierRecord,
    ) -> anyhow::Result<ApplyOutcome> {
        DuckDbBackend::apply_subscription_event(self, event_id, record).await
    }

    async fn ping(&self) -> anyhow::Result<()> {
        DuckDbBackend::ping(self).await
    }
}
