use std::collections::BTreeMap;

use thiserror::Error;
use tiergate_core::tier::Tier;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("no configured price and no tier metadata on the subscription")]
    Unmapped,

    #[error("unknown tier `{0}` in subscription metadata")]
    UnknownTier(String),
}

/// Maps billing price ids to tiers.
#[derive(Debug, Clone, Default)]
pub struct PriceCatalog {
    prices: BTreeMap<String, Tier>,
}

impl PriceCatalog {
    pub fn new(prices: BTreeMap<String, Tier>) -> Self {
        Self { prices }
    }

    pub fn tier_for_price(&self, price_id: &str) -> Option<Tier> {
        self.prices.get(price_id).copied()
    }

    /// Highest tier among the subscription's known prices. Falls back to a
    /// `tier` metadata value when no price is in the catalog.
    pub fn plan_tier<'a>(
        &self,
        price_ids: impl IntoIterator<Item = &'a str>,
        metadata_tier: Option<&str>,
    ) -> Result<Tier, PlanError> {
        if let Some(tier) = price_ids
            .into_iter()
            .filter_map(|id| self.tier_for_price(id))
            .max()
        {
            return Ok(tier);
        }
        match metadata_tier {
            Some(raw) => raw
                .parse::<Tier>()
                .map_err(|_| PlanError::UnknownTier(raw.to_string())),
            None => Err(PlanError::Unmapped),
        }
    }
}
