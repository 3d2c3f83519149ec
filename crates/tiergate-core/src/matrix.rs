use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigProblem, ConfigurationError, MatrixError};
use crate::tier::Tier;

/// Limit value meaning "no cap".
pub const UNLIMITED: i64 = -1;

static NO_FEATURES: BTreeSet<String> = BTreeSet::new();
static NO_LIMITS: BTreeMap<String, i64> = BTreeMap::new();

/// Everything one tier is entitled to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierEntitlements {
    #[serde(default)]
    pub features: BTreeSet<String>,
    #[serde(default)]
    pub limits: BTreeMap<String, i64>,
}

/// Static tier → feature / limit table.
///
/// Loaded once at startup and validated with [`PermissionMatrix::validate`];
/// every lookup afterwards is a pure function over immutable data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionMatrix {
    tiers: BTreeMap<Tier, TierEntitlements>,
}

const BASIC_FEATURES: &[&str] = &["basic_dashboard", "basic_evaluation", "email_support"];

const PROFESSIONAL_FEATURES: &[&str] = &[
    "professional_dashboard",
    "professional_evaluation",
    "pdf_reports",
    "ai_analysis",
    "comparable_companies",
    "priority_support",
];

const ENTERPRISE_FEATURES: &[&str] = &[
    "enterprise_dashboard",
    "enterprise_evaluation",
    "api_access",
    "team_management",
    "white_label",
    "dedicated_support",
];

// (limit, basic, professional, enterprise)
const LIMITS: &[(&str, i64, i64, i64)] = &[
    ("evaluations_per_month", 3, 25, UNLIMITED),
    ("pdf_exports_per_month", 0, 20, UNLIMITED),
    ("ai_analyses_per_month", 0, 50, UNLIMITED),
    ("team_members", 1, 5, UNLIMITED),
    ("api_requests_per_day", 0, 0, 10_000),
];

impl PermissionMatrix {
    pub fn new(tiers: BTreeMap<Tier, TierEntitlements>) -> Self {
        Self { tiers }
    }

    /// The valuation product's tier table. Each tier inherits every feature
    /// of the tiers below it.
    pub fn builtin() -> Self {
        let mut tiers = BTreeMap::new();
        let mut features: BTreeSet<String> = BTreeSet::new();
        let grants = [
            (Tier::Basic, BASIC_FEATURES),
            (Tier::Professional, PROFESSIONAL_FEATURES),
            (Tier::Enterprise, ENTERPRISE_FEATURES),
        ];
        for (idx, (tier, added)) in grants.into_iter().enumerate() {
            features.extend(added.iter().map(|f| f.to_string()));
            let limits = LIMITS
                .iter()
                .map(|(name, basic, pro, ent)| {
                    let value = [*basic, *pro, *ent][idx];
                    (name.to_string(), value)
                })
                .collect();
            tiers.insert(
                tier,
                TierEntitlements {
                    features: features.clone(),
                    limits,
                },
            );
        }
        Self { tiers }
    }

    /// Parse a matrix revision from JSON and validate it.
    ///
    /// ```json
    /// { "tiers": { "basic": { "features": ["basic_dashboard"], "limits": { "team_members": 1 } } } }
    /// ```
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigurationError> {
        let matrix: Self = serde_json::from_str(raw)
            .map_err(|e| ConfigurationError::invalid(format!("permission matrix: {e}")))?;
        matrix.validate()?;
        Ok(matrix)
    }

    pub fn features_for(&self, tier: Tier) -> &BTreeSet<String> {
        self.tiers
            .get(&tier)
            .map(|t| &t.features)
            .unwrap_or(&NO_FEATURES)
    }

    pub fn limits_for(&self, tier: Tier) -> &BTreeMap<String, i64> {
        self.tiers
            .get(&tier)
            .map(|t| &t.limits)
            .unwrap_or(&NO_LIMITS)
    }

    /// Every feature granted to at least one tier.
    pub fn known_features(&self) -> BTreeSet<&str> {
        self.tiers
            .values()
            .flat_map(|t| t.features.iter().map(String::as_str))
            .collect()
    }

    pub fn is_known_feature(&self, feature: &str) -> bool {
        self.tiers.values().any(|t| t.features.contains(feature))
    }

    pub fn has_feature(&self, tier: Tier, feature: &str) -> Result<bool, MatrixError> {
        if !self.is_known_feature(feature) {
            return Err(MatrixError::UnknownFeature(feature.to_string()));
        }
        Ok(self.features_for(tier).contains(feature))
    }

    /// Cap for `limit` on `tier`; [`UNLIMITED`] means no cap.
    pub fn limit_for(&self, tier: Tier, limit: &str) -> Result<i64, MatrixError> {
        self.limits_for(tier)
            .get(limit)
            .copied()
            .ok_or_else(|| MatrixError::UnknownLimit(limit.to_string()))
    }

    /// Whether `used` units still fit under the tier's cap (strictly below it).
    pub fn is_within_limit(&self, tier: Tier, limit: &str, used: u64) -> Result<bool, MatrixError> {
        let cap = self.limit_for(tier, limit)?;
        if cap == UNLIMITED {
            return Ok(true);
        }
        Ok(u64::try_from(cap).is_ok_and(|cap| used < cap))
    }

    /// Lowest tier granting `feature`, if any.
    pub fn minimum_tier_for(&self, feature: &str) -> Option<Tier> {
        Tier::ALL
            .into_iter()
            .find(|tier| self.features_for(*tier).contains(feature))
    }

    /// Check the tier-ordering invariant: every tier declares the same limits,
    /// each tier's features are a superset of the tier below, and limits never
    /// decrease going up (unlimited dominates any finite cap).
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let mut problems = Vec::new();

        for tier in Tier::ALL {
            if !self.tiers.contains_key(&tier) {
                problems.push(ConfigProblem::MissingTier { tier });
            }
        }

        for (tier, entitlements) in &self.tiers {
            for (limit, value) in &entitlements.limits {
                if *value < UNLIMITED {
                    problems.push(ConfigProblem::InvalidLimit {
                        limit: limit.clone(),
                        tier: *tier,
                        value: *value,
                    });
                }
            }
        }

        for pair in Tier::ALL.windows(2) {
            let (lower, higher) = (pair[0], pair[1]);
            let (Some(lo), Some(hi)) = (self.tiers.get(&lower), self.tiers.get(&higher)) else {
                continue;
            };

            for feature in lo.features.difference(&hi.features) {
                problems.push(ConfigProblem::FeatureNotInherited {
                    feature: feature.clone(),
                    lower,
                    higher,
                });
            }

            let names: BTreeSet<&String> = lo.limits.keys().chain(hi.limits.keys()).collect();
            for name in names {
                match (lo.limits.get(name), hi.limits.get(name)) {
                    (Some(&lo_value), Some(&hi_value)) => {
                        let decreases = if hi_value == UNLIMITED {
                            false
                        } else {
                            lo_value == UNLIMITED || lo_value > hi_value
                        };
                        if decreases {
                            problems.push(ConfigProblem::LimitDecreases {
                                limit: name.clone(),
                                lower,
                                lower_value: lo_value,
                                higher,
                                higher_value: hi_value,
                            });
                        }
                    }
                    (None, _) => problems.push(ConfigProblem::Invalid(format!(
                        "limit `{name}` is not declared for {lower}"
                    ))),
                    (_, None) => problems.push(ConfigProblem::Invalid(format!(
                        "limit `{name}` is not declared for {higher}"
                    ))),
                }
            }
        }

        ConfigurationError::check(problems)
    }
}

impl Default for PermissionMatrix {
    fn default() -> Self {
        Self::builtin()
    }
}
