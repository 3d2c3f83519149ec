use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::matrix::PermissionMatrix;
use crate::route::{
    is_api_path, strip_query_and_fragment, validate_route_config, MatchKind, RouteRule,
    RouteTable,
};
use crate::tier::Tier;

/// Where unauthenticated browser requests are sent.
pub const SIGN_IN_ROUTE: &str = "/sign-in";

/// Why a [`RoutingDecision`] came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    PublicRoute,
    AuthenticatedRoute,
    NoTierRestriction,
    InsufficientTier,
    MissingFeature,
    AccessGranted,
    AuthenticationRequired,
}

impl ReasonCode {
    pub fn message(self) -> &'static str {
        match self {
            ReasonCode::PublicRoute => "public route",
            ReasonCode::AuthenticatedRoute => "authenticated, no tier restriction",
            ReasonCode::NoTierRestriction => "no tier restriction found",
            ReasonCode::InsufficientTier => "insufficient tier",
            ReasonCode::MissingFeature => "missing required feature",
            ReasonCode::AccessGranted => "access granted",
            ReasonCode::AuthenticationRequired => "authentication required",
        }
    }
}

/// Verdict for one access check. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub should_redirect: bool,
    pub target_route: Option<String>,
    pub allow_access: bool,
    pub reason: ReasonCode,
    /// `None` only for unauthenticated callers.
    pub current_tier: Option<Tier>,
    pub required_tier: Option<Tier>,
    pub missing_features: BTreeSet<String>,
}

impl RoutingDecision {
    fn allow(reason: ReasonCode, tier: Option<Tier>) -> Self {
        Self {
            should_redirect: false,
            target_route: None,
            allow_access: true,
            reason,
            current_tier: tier,
            required_tier: None,
            missing_features: BTreeSet::new(),
        }
    }
}

/// Upgrade page for a denied request, specific to the feature when one is known.
pub fn upgrade_route(feature: Option<&str>, required_tier: Tier) -> String {
    match feature {
        Some(feature) => format!("/upgrade?feature={feature}"),
        None => format!("/upgrade?tier={required_tier}"),
    }
}

/// Evaluates the route table and permission matrix for a resolved tier.
///
/// Stateless per call: the same inputs always yield the same decision.
#[derive(Debug, Clone)]
pub struct AccessDecisionEngine {
    routes: RouteTable,
    matrix: Arc<PermissionMatrix>,
}

impl AccessDecisionEngine {
    /// Validates the matrix and the routes; any problem is fatal.
    pub fn new(
        routes: RouteTable,
        matrix: Arc<PermissionMatrix>,
    ) -> Result<Self, ConfigurationError> {
        let mut problems = Vec::new();
        if let Err(e) = matrix.validate() {
            problems.extend(e.problems);
        }
        if let Err(e) = validate_route_config(&routes, &matrix) {
            problems.extend(e.problems);
        }
        ConfigurationError::check(problems)?;
        Ok(Self { routes, matrix })
    }

    pub fn builtin() -> Result<Self, ConfigurationError> {
        Self::new(RouteTable::builtin(), Arc::new(PermissionMatrix::builtin()))
    }

    pub fn matrix(&self) -> &Arc<PermissionMatrix> {
        &self.matrix
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Most specific tier rule for `path`.
    ///
    /// An exact rule beats any prefix rule; among prefix rules the longest
    /// pattern wins; equal candidates go to the rule declared first.
    pub fn matching_rule(&self, path: &str) -> Option<&RouteRule> {
        let path = strip_query_and_fragment(path);
        self.routes
            .rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.matches(path))
            .max_by_key(|(idx, rule)| {
                (
                    rule.match_kind == MatchKind::Exact,
                    rule.path_pattern.len(),
                    std::cmp::Reverse(*idx),
                )
            })
            .map(|(_, rule)| rule)
    }

    /// Decide whether a caller on `tier` may open `path`.
    ///
    /// `features` overrides the tier's feature set from the matrix; pass the
    /// set carried by the resolved tier, or `None` to use the matrix.
    pub fn decide(
        &self,
        path: &str,
        tier: Tier,
        features: Option<&BTreeSet<String>>,
    ) -> RoutingDecision {
        let path = strip_query_and_fragment(path);
        let api = is_api_path(path);

        if self.routes.public.iter().any(|m| m.matches(path)) {
            return RoutingDecision::allow(ReasonCode::PublicRoute, Some(tier));
        }
        if self.routes.authenticated.iter().any(|m| m.matches(path)) {
            return RoutingDecision::allow(ReasonCode::AuthenticatedRoute, Some(tier));
        }
        let Some(rule) = self.matching_rule(path) else {
            return RoutingDecision::allow(ReasonCode::NoTierRestriction, Some(tier));
        };

        let features = features.unwrap_or_else(|| self.matrix.features_for(tier));
        let missing: BTreeSet<String> = rule
            .required_feature
            .iter()
            .filter(|f| !features.contains(f.as_str()))
            .cloned()
            .collect();

        if rule.required_tier > tier {
            let (should_redirect, target) = if api || rule.fallback_route.is_none() {
                (
                    !api,
                    upgrade_route(rule.required_feature.as_deref(), rule.required_tier),
                )
            } else {
                (true, tier.dashboard_route().to_string())
            };
            return RoutingDecision {
                should_redirect,
                target_route: Some(target),
                allow_access: false,
                reason: ReasonCode::InsufficientTier,
                current_tier: Some(tier),
                required_tier: Some(rule.required_tier),
                missing_features: missing,
            };
        }

        if let Some(target) = missing
            .first()
            .map(|f| upgrade_route(Some(f.as_str()), rule.required_tier))
        {
            return RoutingDecision {
                should_redirect: !api,
                target_route: Some(target),
                allow_access: false,
                reason: ReasonCode::MissingFeature,
                current_tier: Some(tier),
                required_tier: Some(rule.required_tier),
                missing_features: missing,
            };
        }

        RoutingDecision {
            required_tier: Some(rule.required_tier),
            ..RoutingDecision::allow(ReasonCode::AccessGranted, Some(tier))
        }
    }

    /// Decision for a caller without a session: only public routes are open.
    pub fn decide_unauthenticated(&self, path: &str) -> RoutingDecision {
        let path = strip_query_and_fragment(path);
        if self.routes.public.iter().any(|m| m.matches(path)) {
            return RoutingDecision::allow(ReasonCode::PublicRoute, None);
        }
        let api = is_api_path(path);
        RoutingDecision {
            should_redirect: !api,
            target_route: (!api).then(|| SIGN_IN_ROUTE.to_string()),
            allow_access: false,
            reason: ReasonCode::AuthenticationRequired,
            current_tier: None,
            required_tier: None,
            missing_features: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::PathMatcher;

    fn engine() -> AccessDecisionEngine {
        AccessDecisionEngine::builtin().expect("builtin config is valid")
    }

    #[test]
    fn basic_user_is_redirected_to_own_dashboard() {
        let d = engine().decide("/dashboard/professional", Tier::Basic, None);
        assert!(!d.allow_access);
        assert!(d.should_redirect);
        assert_eq!(d.target_route.as_deref(), Some("/dashboard/basic"));
        assert_eq!(d.reason, ReasonCode::InsufficientTier);
        assert_eq!(d.required_tier, Some(Tier::Professional));
    }

    #[test]
    fn enterprise_user_can_open_professional_dashboard() {
        let d = engine().decide("/dashboard/professional", Tier::Enterprise, None);
        assert!(d.allow_access);
        assert!(!d.should_redirect);
        assert_eq!(d.reason, ReasonCode::AccessGranted);
    }

    #[test]
    fn api_denial_targets_upgrade_page_never_dashboard() {
        let d = engine().decide("/api/reports/pdf", Tier::Basic, None);
        assert!(!d.allow_access);
        assert!(!d.should_redirect);
        let target = d.target_route.expect("upgrade target");
        assert!(target.starts_with("/upgrade"), "{target}");
        assert!(!target.contains("/dashboard"));
        assert_eq!(target, "/upgrade?feature=pdf_reports");
    }

    #[test]
    fn missing_feature_is_reported() {
        let none = BTreeSet::new();
        let d = engine().decide("/evaluations/professional", Tier::Professional, Some(&none));
        assert!(!d.allow_access);
        assert_eq!(d.reason, ReasonCode::MissingFeature);
        assert_eq!(
            d.missing_features,
            BTreeSet::from(["professional_evaluation".to_string()])
        );
        assert_eq!(
            d.target_route.as_deref(),
            Some("/upgrade?feature=professional_evaluation")
        );
        assert!(d.should_redirect);
    }

    #[test]
    fn missing_feature_on_api_does_not_redirect() {
        let none = BTreeSet::new();
        let d = engine().decide("/api/ai/summary", Tier::Enterprise, Some(&none));
        assert!(!d.allow_access);
        assert!(!d.should_redirect);
        assert_eq!(d.target_route.as_deref(), Some("/upgrade?feature=ai_analysis"));
    }

    #[test]
    fn malformed_paths_resolve_to_defined_decisions() {
        let e = engine();
        for path in ["", "/", "///a//b", "?", "#", "//", "/\u{0}"] {
            let d = e.decide(path, Tier::Basic, None);
            assert!(d.allow_access, "path {path:?} -> {d:?}");
        }
        assert_eq!(
            e.decide("", Tier::Basic, None).reason,
            ReasonCode::NoTierRestriction
        );
        assert_eq!(
            e.decide("///a//b", Tier::Basic, None).reason,
            ReasonCode::NoTierRestriction
        );
    }

    #[test]
    fn public_and_authenticated_routes_come_first() {
        let e = engine();
        assert_eq!(e.decide("/pricing", Tier::Basic, None).reason, ReasonCode::PublicRoute);
        assert_eq!(
            e.decide("/dashboard", Tier::Basic, None).reason,
            ReasonCode::AuthenticatedRoute
        );
        assert_eq!(
            e.decide("/account/billing", Tier::Basic, None).reason,
            ReasonCode::AuthenticatedRoute
        );
    }

    #[test]
    fn query_and_fragment_are_ignored() {
        let d = engine().decide("/dashboard/professional?tab=2#top", Tier::Basic, None);
        assert!(!d.allow_access);
        let d = engine().decide("/reportsx", Tier::Basic, None);
        assert!(d.allow_access, "segment-aware prefix must not match /reportsx");
    }

    #[test]
    fn matching_is_case_sensitive() {
        let d = engine().decide("/Dashboard/Professional", Tier::Basic, None);
        assert!(d.allow_access);
        assert_eq!(d.reason, ReasonCode::NoTierRestriction);
    }

    #[test]
    fn exact_rule_beats_longer_prefix_rule() {
        let routes = RouteTable {
            public: vec![],
            authenticated: vec![],
            rules: vec![
                RouteRule::prefix("/reports/annual/full", Tier::Enterprise).fallback("/dashboard"),
                RouteRule::exact("/reports/annual/full", Tier::Professional).fallback("/dashboard"),
                RouteRule::prefix("/reports", Tier::Basic).fallback("/dashboard"),
            ],
        };
        let e = AccessDecisionEngine::new(routes, Arc::new(PermissionMatrix::builtin()))
            .expect("valid");
        let rule = e.matching_rule("/reports/annual/full").expect("match");
        assert_eq!(rule.match_kind, MatchKind::Exact);
        assert!(e.decide("/reports/annual/full", Tier::Professional, None).allow_access);

        let rule = e.matching_rule("/reports/annual/full/pdf").expect("match");
        assert_eq!(rule.required_tier, Tier::Enterprise, "longest prefix wins");
    }

    #[test]
    fn equal_prefixes_resolve_to_first_declared() {
        let routes = RouteTable {
            rules: vec![
                RouteRule::prefix("/api/data", Tier::Professional),
                RouteRule::prefix("/api/data", Tier::Enterprise),
            ],
            ..RouteTable::default()
        };
        // Duplicate (pattern, kind) pairs are rejected at startup, so exercise the
        // tie-break on the table directly.
        let e = AccessDecisionEngine {
            routes,
            matrix: Arc::new(PermissionMatrix::builtin()),
        };
        assert_eq!(
            e.matching_rule("/api/data/x").map(|r| r.required_tier),
            Some(Tier::Professional)
        );
    }

    #[test]
    fn invalid_config_prevents_construction() {
        let routes = RouteTable {
            rules: vec![RouteRule::prefix("/reports", Tier::Professional).feature("nope")],
            ..RouteTable::default()
        };
        let err = AccessDecisionEngine::new(routes, Arc::new(PermissionMatrix::builtin()))
            .expect_err("invalid");
        assert_eq!(err.problems.len(), 2, "{err}");
    }

    #[test]
    fn unauthenticated_callers_only_reach_public_routes() {
        let e = engine();
        let d = e.decide_unauthenticated("/pricing?plan=pro");
        assert!(d.allow_access);
        assert_eq!(d.current_tier, None);

        let d = e.decide_unauthenticated("/dashboard/basic");
        assert!(!d.allow_access);
        assert!(d.should_redirect);
        assert_eq!(d.target_route.as_deref(), Some(SIGN_IN_ROUTE));

        let d = e.decide_unauthenticated("/api/reports/pdf");
        assert!(!d.should_redirect);
        assert_eq!(d.target_route, None);
        assert_eq!(d.reason, ReasonCode::AuthenticationRequired);
    }

    #[test]
    fn public_matchers_shadow_rules() {
        let routes = RouteTable {
            public: vec![PathMatcher::prefix("/reports/sample")],
            authenticated: vec![],
            rules: vec![RouteRule::prefix("/reports", Tier::Professional).fallback("/dashboard")],
        };
        let e = AccessDecisionEngine::new(routes, Arc::new(PermissionMatrix::builtin()))
            .expect("valid");
        assert!(e.decide("/reports/sample/1", Tier::Basic, None).allow_access);
        assert!(!e.decide("/reports/1", Tier::Basic, None).allow_access);
    }

    #[test]
    fn decision_serializes_with_snake_case_reason() {
        let d = engine().decide("/dashboard/enterprise", Tier::Professional, None);
        let json = serde_json::to_value(&d).expect("serialize");
        assert_eq!(json["reason"], "insufficient_tier");
        assert_eq!(json["current_tier"], "professional");
        assert_eq!(json["target_route"], "/dashboard/professional");
    }
}
