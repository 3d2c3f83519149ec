use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigProblem, ConfigurationError};
use crate::matrix::PermissionMatrix;
use crate::tier::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Exact,
    Prefix,
}

/// A path pattern plus how to compare it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMatcher {
    pub path_pattern: String,
    pub match_kind: MatchKind,
}

impl PathMatcher {
    pub fn exact(pattern: &str) -> Self {
        Self {
            path_pattern: pattern.to_string(),
            match_kind: MatchKind::Exact,
        }
    }

    pub fn prefix(pattern: &str) -> Self {
        Self {
            path_pattern: pattern.to_string(),
            match_kind: MatchKind::Prefix,
        }
    }

    /// Case-sensitive, segment-aware match. A prefix pattern `/reports`
    /// matches `/reports` and `/reports/q1` but never `/reportsx`.
    /// `path` must already be stripped of query and fragment.
    pub fn matches(&self, path: &str) -> bool {
        pattern_matches(&self.path_pattern, self.match_kind, path)
    }
}

fn pattern_matches(pattern: &str, kind: MatchKind, path: &str) -> bool {
    match kind {
        MatchKind::Exact => path == pattern,
        MatchKind::Prefix => {
            if pattern.is_empty() || path == pattern {
                return path == pattern;
            }
            match path.strip_prefix(pattern) {
                Some(rest) => pattern.ends_with('/') || rest.starts_with('/'),
                None => false,
            }
        }
    }
}

/// A tier-gated route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub path_pattern: String,
    pub match_kind: MatchKind,
    pub required_tier: Tier,
    #[serde(default)]
    pub required_feature: Option<String>,
    /// Where a denied browser request is sent. Required for non-API routes.
    #[serde(default)]
    pub fallback_route: Option<String>,
}

impl RouteRule {
    pub fn prefix(pattern: &str, required_tier: Tier) -> Self {
        Self {
            path_pattern: pattern.to_string(),
            match_kind: MatchKind::Prefix,
            required_tier,
            required_feature: None,
            fallback_route: None,
        }
    }

    pub fn exact(pattern: &str, required_tier: Tier) -> Self {
        Self {
            match_kind: MatchKind::Exact,
            ..Self::prefix(pattern, required_tier)
        }
    }

    pub fn feature(mut self, feature: &str) -> Self {
        self.required_feature = Some(feature.to_string());
        self
    }

    pub fn fallback(mut self, route: &str) -> Self {
        self.fallback_route = Some(route.to_string());
        self
    }

    pub fn matches(&self, path: &str) -> bool {
        pattern_matches(&self.path_pattern, self.match_kind, path)
    }

    pub fn is_api(&self) -> bool {
        is_api_path(&self.path_pattern)
    }
}

/// Declarative route configuration, loaded once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTable {
    /// Open to anyone, signed in or not.
    #[serde(default)]
    pub public: Vec<PathMatcher>,
    /// Requires a signed-in user but no particular tier.
    #[serde(default)]
    pub authenticated: Vec<PathMatcher>,
    #[serde(default)]
    pub rules: Vec<RouteRule>,
}

impl RouteTable {
    /// Routes of the valuation web app.
    pub fn builtin() -> Self {
        Self {
            public: vec![
                PathMatcher::exact("/"),
                PathMatcher::prefix("/pricing"),
                PathMatcher::prefix("/sign-in"),
                PathMatcher::prefix("/sign-up"),
                PathMatcher::prefix("/upgrade"),
                PathMatcher::prefix("/api/webhooks"),
                PathMatcher::exact("/health"),
            ],
            authenticated: vec![
                PathMatcher::exact("/dashboard"),
                PathMatcher::prefix("/account"),
                PathMatcher::prefix("/settings"),
                PathMatcher::prefix("/api/user"),
            ],
            rules: vec![
                RouteRule::prefix("/dashboard/basic", Tier::Basic)
                    .feature("basic_dashboard")
                    .fallback("/dashboard"),
                RouteRule::prefix("/dashboard/professional", Tier::Professional)
                    .feature("professional_dashboard")
                    .fallback("/dashboard"),
                RouteRule::prefix("/dashboard/enterprise", Tier::Enterprise)
                    .feature("enterprise_dashboard")
                    .fallback("/dashboard"),
                RouteRule::prefix("/evaluations/basic", Tier::Basic)
                    .feature("basic_evaluation")
                    .fallback("/dashboard"),
                RouteRule::prefix("/evaluations/professional", Tier::Professional)
                    .feature("professional_evaluation")
                    .fallback("/dashboard"),
                RouteRule::prefix("/evaluations/enterprise", Tier::Enterprise)
                    .feature("enterprise_evaluation")
                    .fallback("/dashboard"),
                RouteRule::prefix("/reports", Tier::Professional)
                    .feature("pdf_reports")
                    .fallback("/dashboard"),
                RouteRule::prefix("/comparables", Tier::Professional)
                    .feature("comparable_companies")
                    .fallback("/dashboard"),
                RouteRule::prefix("/team", Tier::Enterprise)
                    .feature("team_management")
                    .fallback("/dashboard"),
                RouteRule::prefix("/api/evaluations", Tier::Basic).feature("basic_evaluation"),
                RouteRule::prefix("/api/reports", Tier::Professional).feature("pdf_reports"),
                RouteRule::prefix("/api/ai", Tier::Professional).feature("ai_analysis"),
                RouteRule::prefix("/api/v1", Tier::Enterprise).feature("api_access"),
            ],
        }
    }

    /// Parse a route table from JSON. Validation against the matrix happens in
    /// [`validate_route_config`].
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(raw)
            .map_err(|e| ConfigurationError::invalid(format!("route table: {e}")))
    }
}

/// `/api` and everything below it.
pub fn is_api_path(path: &str) -> bool {
    path == "/api" || path.starts_with("/api/")
}

/// Drop `?query` and `#fragment`. No other normalisation is applied.
pub fn strip_query_and_fragment(path: &str) -> &str {
    match path.find(['?', '#']) {
        Some(idx) => &path[..idx],
        None => path,
    }
}

/// Startup check for the route table against the matrix.
///
/// Every non-API rule must name a fallback route, every required feature must
/// exist in at least one tier, patterns must be absolute and no
/// (pattern, kind) pair may be declared twice. All problems are reported
/// together.
pub fn validate_route_config(
    routes: &RouteTable,
    matrix: &PermissionMatrix,
) -> Result<(), ConfigurationError> {
    let mut problems = Vec::new();
    let mut seen: HashSet<(&str, MatchKind)> = HashSet::new();

    let untiered = routes.public.iter().chain(routes.authenticated.iter());
    for matcher in untiered {
        if !matcher.path_pattern.starts_with('/') {
            problems.push(ConfigProblem::InvalidPattern {
                pattern: matcher.path_pattern.clone(),
            });
        }
    }

    for rule in &routes.rules {
        if !rule.path_pattern.starts_with('/') {
            problems.push(ConfigProblem::InvalidPattern {
                pattern: rule.path_pattern.clone(),
            });
        }
        if !seen.insert((rule.path_pattern.as_str(), rule.match_kind)) {
            problems.push(ConfigProblem::DuplicateRule {
                pattern: rule.path_pattern.clone(),
            });
        }
        if !rule.is_api() && rule.fallback_route.is_none() {
            problems.push(ConfigProblem::MissingFallback {
                pattern: rule.path_pattern.clone(),
            });
        }
        if let Some(feature) = &rule.required_feature {
            if !matrix.is_known_feature(feature) {
                problems.push(ConfigProblem::UnknownFeature {
                    pattern: rule.path_pattern.clone(),
                    feature: feature.clone(),
                });
            }
        }
    }

    ConfigurationError::check(problems)
}
