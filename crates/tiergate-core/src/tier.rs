use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::matrix::PermissionMatrix;

/// Subscription tier. The derived `Ord` is the entitlement order:
/// `Basic < Professional < Enterprise`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Basic,
    Professional,
    Enterprise,
}

impl Tier {
    /// All tiers, lowest first.
    pub const ALL: [Tier; 3] = [Tier::Basic, Tier::Professional, Tier::Enterprise];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Basic => "basic",
            Tier::Professional => "professional",
            Tier::Enterprise => "enterprise",
        }
    }

    /// The dashboard a caller on this tier lands on.
    pub fn dashboard_route(self) -> &'static str {
        match self {
            Tier::Basic => "/dashboard/basic",
            Tier::Professional => "/dashboard/professional",
            Tier::Enterprise => "/dashboard/enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected tier string from an external source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown tier `{0}`")]
pub struct TierParseError(pub String);

impl FromStr for Tier {
    type Err = TierParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" | "free" => Ok(Tier::Basic),
            "professional" | "pro" => Ok(Tier::Professional),
            "enterprise" => Ok(Tier::Enterprise),
            _ => Err(TierParseError(s.to_string())),
        }
    }
}

/// Billing-side subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    PastDue,
    Trialing,
    Incomplete,
    Unpaid,
    /// No source could vouch for the status (fallback results only).
    Unknown,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Unknown => "unknown",
        }
    }

    /// Whether a paid tier stays usable in this status. `past_due` keeps
    /// access while the billing provider retries the charge.
    pub fn grants_access(self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown subscription status `{0}`")]
pub struct StatusParseError(pub String);

impl FromStr for SubscriptionStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(SubscriptionStatus::Active),
            "canceled" | "cancelled" => Ok(SubscriptionStatus::Canceled),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "incomplete" | "incomplete_expired" => Ok(SubscriptionStatus::Incomplete),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "unknown" => Ok(SubscriptionStatus::Unknown),
            _ => Err(StatusParseError(s.to_string())),
        }
    }
}

/// Which resolver stage produced a [`TierDetectionResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    IdentityProvider,
    Billing,
    Database,
    Fallback,
}

impl ResolutionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionSource::IdentityProvider => "identity_provider",
            ResolutionSource::Billing => "billing",
            ResolutionSource::Database => "database",
            ResolutionSource::Fallback => "fallback",
        }
    }
}

impl fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved tier together with everything the tier entitles the caller to.
///
/// `features` and `limits` are always copied from the [`PermissionMatrix`]
/// for `tier`, so a result can never claim entitlements its tier lacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierDetectionResult {
    pub tier: Tier,
    pub status: SubscriptionStatus,
    pub features: BTreeSet<String>,
    /// Limit name to cap; `-1` means unlimited.
    pub limits: BTreeMap<String, i64>,
    pub is_trialing: bool,
    pub trial_ends_at: Option<DateTime<Utc>>,
    /// End of paid access when the subscription will not renew.
    pub subscription_ends_at: Option<DateTime<Utc>>,
    pub source: ResolutionSource,
    pub resolved_at: DateTime<Utc>,
}

impl TierDetectionResult {
    pub fn new(
        tier: Tier,
        status: SubscriptionStatus,
        source: ResolutionSource,
        matrix: &PermissionMatrix,
    ) -> Self {
        Self {
            tier,
            status,
            features: matrix.features_for(tier).clone(),
            limits: matrix.limits_for(tier).clone(),
            is_trialing: status == SubscriptionStatus::Trialing,
            trial_ends_at: None,
            subscription_ends_at: None,
            source,
            resolved_at: Utc::now(),
        }
    }

    /// The last-resort result: `tier` with an unknown status.
    pub fn fallback(tier: Tier, matrix: &PermissionMatrix) -> Self {
        Self::new(
            tier,
            SubscriptionStatus::Unknown,
            ResolutionSource::Fallback,
            matrix,
        )
    }

    pub fn with_trial_end(mut self, trial_ends_at: Option<DateTime<Utc>>) -> Self {
        self.trial_ends_at = trial_ends_at;
        self
    }

    pub fn with_subscription_end(mut self, subscription_ends_at: Option<DateTime<Utc>>) -> Self {
        self.subscription_ends_at = subscription_ends_at;
        self
    }

    pub fn with_resolved_at(mut self, resolved_at: DateTime<Utc>) -> Self {
        self.resolved_at = resolved_at;
        self
    }

    /// A paid tier whose entitlement has lapsed by `now`: the trial ran out,
    /// the paid period ended, or the status no longer grants access.
    /// Basic never expires.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.tier == Tier::Basic {
            return false;
        }
        let trial_over = self.is_trialing && self.trial_ends_at.is_some_and(|t| t <= now);
        let period_over = self.subscription_ends_at.is_some_and(|t| t <= now);
        let lapsed = matches!(
            self.status,
            SubscriptionStatus::Canceled
                | SubscriptionStatus::Unpaid
                | SubscriptionStatus::Incomplete
        ) && self.subscription_ends_at.is_none();
        trial_over || period_over || lapsed
    }

    /// Produced because no source could answer.
    pub fn is_degraded(&self) -> bool {
        self.source == ResolutionSource::Fallback && self.status == SubscriptionStatus::Unknown
    }

    /// Rough heap + inline footprint, used for cache byte accounting.
    pub fn estimated_size(&self) -> usize {
        let features: usize = self
            .features
            .iter()
            .map(|f| f.len() + std::mem::size_of::<String>())
            .sum();
        let limits: usize = self
            .limits
            .keys()
            .map(|k| k.len() + std::mem::size_of::<String>() + std::mem::size_of::<i64>())
            .sum();
        std::mem::size_of::<Self>() + features + limits
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn tier_order_is_total() {
        assert!(Tier::Basic < Tier::Professional);
        assert!(Tier::Professional < Tier::Enterprise);
        let mut tiers = vec![Tier::Enterprise, Tier::Basic, Tier::Professional];
        tiers.sort();
        assert_eq!(tiers, Tier::ALL.to_vec());
    }

    #[test]
    fn tier_parses_aliases_and_rejects_unknown() {
        assert_eq!("Pro".parse::<Tier>(), Ok(Tier::Professional));
        assert_eq!(" free ".parse::<Tier>(), Ok(Tier::Basic));
        assert_eq!("ENTERPRISE".parse::<Tier>(), Ok(Tier::Enterprise));
        assert_eq!(
            "platinum".parse::<Tier>(),
            Err(TierParseError("platinum".to_string()))
        );
    }

    #[test]
    fn status_parses_provider_strings() {
        assert_eq!(
            "incomplete_expired".parse::<SubscriptionStatus>(),
            Ok(SubscriptionStatus::Incomplete)
        );
        assert_eq!(
            "cancelled".parse::<SubscriptionStatus>(),
            Ok(SubscriptionStatus::Canceled)
        );
        assert!("paused_forever".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn result_copies_entitlements_from_matrix() {
        let matrix = PermissionMatrix::builtin();
        let result = TierDetectionResult::new(
            Tier::Professional,
            SubscriptionStatus::Trialing,
            ResolutionSource::Billing,
            &matrix,
        );
        assert!(result.is_trialing);
        assert!(result.features.contains("professional_evaluation"));
        assert_eq!(result.limits.get("evaluations_per_month"), Some(&25));
    }

    #[test]
    fn expiry_rules() {
        let matrix = PermissionMatrix::builtin();
        let now = Utc::now();

        let basic = TierDetectionResult::new(
            Tier::Basic,
            SubscriptionStatus::Canceled,
            ResolutionSource::Database,
            &matrix,
        );
        assert!(!basic.is_expired(now), "basic never expires");

        let trial = TierDetectionResult::new(
            Tier::Professional,
            SubscriptionStatus::Trialing,
            ResolutionSource::IdentityProvider,
            &matrix,
        )
        .with_trial_end(Some(now - Duration::hours(1)));
        assert!(trial.is_expired(now));

        let winding_down = TierDetectionResult::new(
            Tier::Enterprise,
            SubscriptionStatus::Canceled,
            ResolutionSource::Database,
            &matrix,
        )
        .with_subscription_end(Some(now + Duration::days(3)));
        assert!(!winding_down.is_expired(now));
        assert!(winding_down.is_expired(now + Duration::days(4)));

        let lapsed = TierDetectionResult::new(
            Tier::Professional,
            SubscriptionStatus::Unpaid,
            ResolutionSource::IdentityProvider,
            &matrix,
        );
        assert!(lapsed.is_expired(now));
    }

    #[test]
    fn fallback_is_degraded() {
        let matrix = PermissionMatrix::builtin();
        let result = TierDetectionResult::fallback(Tier::Basic, &matrix);
        assert!(result.is_degraded());
        assert_eq!(result.source, ResolutionSource::Fallback);
        assert!(result.estimated_size() > std::mem::size_of::<TierDetectionResult>());
    }
}
