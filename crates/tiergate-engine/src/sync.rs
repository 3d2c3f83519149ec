//! Applies billing subscription events to the durable store and the cache.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tiergate_core::tier::{SubscriptionStatus, Tier};
use tiergate_metadata::{ApplyOutcome, TierRecord, TierStore};
use tracing::info;

use crate::cache::TierCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionEventKind {
    #[serde(rename = "subscription.created")]
    Created,
    #[serde(rename = "subscription.updated")]
    Updated,
    #[serde(rename = "subscription.deleted")]
    Deleted,
}

impl SubscriptionEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionEventKind::Created => "subscription.created",
            SubscriptionEventKind::Updated => "subscription.updated",
            SubscriptionEventKind::Deleted => "subscription.deleted",
        }
    }
}

impl fmt::Display for SubscriptionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported subscription event type `{0}`")]
pub struct EventKindParseError(pub String);

impl FromStr for SubscriptionEventKind {
    type Err = EventKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Stripe spells these `customer.subscription.*`.
        match s.trim().trim_start_matches("customer.") {
            "subscription.created" => Ok(SubscriptionEventKind::Created),
            "subscription.updated" => Ok(SubscriptionEventKind::Updated),
            "subscription.deleted" => Ok(SubscriptionEventKind::Deleted),
            _ => Err(EventKindParseError(s.to_string())),
        }
    }
}

/// A billing webhook, already parsed and validated at the HTTP boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    /// Provider delivery id; the idempotency key.
    pub event_id: String,
    pub kind: SubscriptionEventKind,
    pub customer_id: String,
    /// Set when the subscription metadata names the user directly.
    pub user_id: Option<String>,
    pub tier: Tier,
    pub status: SubscriptionStatus,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub occurred_at: DateTime<Utc>,
}

impl SubscriptionEvent {
    /// The record to persist for `user_id`. Deleted or lapsed subscriptions
    /// drop to Basic.
    pub fn to_record(&self, user_id: &str) -> TierRecord {
        let (tier, status) = match self.kind {
            SubscriptionEventKind::Deleted => (Tier::Basic, SubscriptionStatus::Canceled),
            _ if !self.status.grants_access() => (Tier::Basic, self.status),
            _ => (self.tier, self.status),
        };
        let subscription_ends_at = if self.cancel_at_period_end {
            self.current_period_end
        } else {
            None
        };
        TierRecord {
            user_id: user_id.to_string(),
            customer_id: Some(self.customer_id.clone()),
            tier,
            status,
            trial_ends_at: self.trial_ends_at,
            subscription_ends_at,
            updated_at: self.occurred_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Applied {
        user_id: String,
        tier: Tier,
        invalidated: usize,
    },
    Duplicate {
        user_id: String,
    },
    Stale {
        user_id: String,
    },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no user is linked to billing customer `{customer_id}`")]
    UnknownUser { customer_id: String },

    #[error("tier store error: {0:#}")]
    Store(anyhow::Error),
}

pub struct TierSynchronizer {
    store: Arc<dyn TierStore>,
    cache: Arc<TierCache>,
}

impl TierSynchronizer {
    pub fn new(store: Arc<dyn TierStore>, cache: Arc<TierCache>) -> Self {
        Self { store, cache }
    }

    /// Persist the event's tier and invalidate the user's cached tier.
    ///
    /// Replayed events are not re-applied; events older than the stored
    /// record are recorded but ignored.
    #[tracing::instrument(
        skip(self, event),
        fields(event_id = %event.event_id, kind = %event.kind)
    )]
    pub async fn handle_event(&self, event: SubscriptionEvent) -> Result<SyncOutcome, SyncError> {
        let user_id = match &event.user_id {
            Some(user_id) => user_id.clone(),
            None => self
                .store
                .find_user_by_customer(&event.customer_id)
                .await
                .map_err(SyncError::Store)?
                .ok_or_else(|| SyncError::UnknownUser {
                    customer_id: event.customer_id.clone(),
                })?,
        };

        let record = event.to_record(&user_id);
        let outcome = self
            .store
            .apply_subscription_event(&event.event_id, &record)
            .await
            .map_err(SyncError::Store)?;

        Ok(match outcome {
            ApplyOutcome::Applied => {
                let invalidated = self.cache.invalidate(&user_id);
                info!(
                    user_id = %user_id,
                    tier = %record.tier,
                    status = %record.status,
                    "Subscription change applied"
                );
                SyncOutcome::Applied {
                    user_id,
                    tier: record.tier,
                    invalidated,
                }
            }
            ApplyOutcome::Duplicate => {
                self.cache.invalidate(&user_id);
                info!(user_id = %user_id, "Duplicate subscription event ignored");
                SyncOutcome::Duplicate { user_id }
            }
            ApplyOutcome::Stale => {
                info!(user_id = %user_id, "Out-of-order subscription event ignored");
                SyncOutcome::Stale { user_id }
            }
        })
    }
}
