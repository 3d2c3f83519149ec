use std::sync::Arc;
use std::time::Duration;

use tiergate_core::tier::Tier;
use tiergate_core::{AccessDecisionEngine, RoutingDecision, TierDetectionResult};
use tracing::warn;

use crate::cache::{CacheError, CacheKey, TierCache};
use crate::resolver::TierResolver;

/// The per-request entry point: cached tier resolution followed by the
/// route decision, bounded by an overall budget.
pub struct AccessGate {
    engine: Arc<AccessDecisionEngine>,
    cache: Arc<TierCache>,
    resolver: Arc<TierResolver>,
    decision_budget: Duration,
}

impl AccessGate {
    pub fn new(
        engine: Arc<AccessDecisionEngine>,
        cache: Arc<TierCache>,
        resolver: Arc<TierResolver>,
        decision_budget: Duration,
    ) -> Self {
        Self {
            engine,
            cache,
            resolver,
            decision_budget,
        }
    }

    pub fn engine(&self) -> &Arc<AccessDecisionEngine> {
        &self.engine
    }

    pub fn cache(&self) -> &Arc<TierCache> {
        &self.cache
    }

    pub fn fallback_tier(&self) -> Tier {
        self.resolver.fallback_tier()
    }

    /// Cached tier for `user_id`, resolving through the source chain on a
    /// miss. The resolution runs on its own task so a caller that gives up
    /// still leaves the result in the cache.
    pub async fn resolve_tier(
        &self,
        user_id: &str,
    ) -> Result<Arc<TierDetectionResult>, CacheError> {
        let cache = Arc::clone(&self.cache);
        let resolver = Arc::clone(&self.resolver);
        let user_id = user_id.to_string();
        let task = tokio::spawn(async move {
            let key = CacheKey::resolver(&user_id);
            cache
                .get_or_resolve(key, || async move {
                    Ok(resolver.resolve(&user_id, None).await)
                })
                .await
        });
        task.await
            .map_err(|e| CacheError::Resolution(format!("resolution task failed: {e}")))?
    }

    /// Decide whether `user_id` may access `path`. Always returns a decision:
    /// when the tier cannot be obtained within the budget the fallback
    /// tier's decision is returned.
    #[tracing::instrument(skip(self))]
    pub async fn decide_access(&self, path: &str, user_id: &str) -> RoutingDecision {
        match tokio::time::timeout(self.decision_budget, self.resolve_tier(user_id)).await {
            Ok(Ok(tier)) => self.engine.decide(path, tier.tier, Some(&tier.features)),
            Ok(Err(e)) => {
                warn!(error = %e, "Tier resolution failed; deciding with fallback tier");
                self.fallback_decision(path)
            }
            Err(_) => {
                warn!(
                    budget_ms = self.decision_budget.as_millis() as u64,
                    "Decision budget exceeded; deciding with fallback tier"
                );
                self.fallback_decision(path)
            }
        }
    }

    fn fallback_decision(&self, path: &str) -> RoutingDecision {
        self.engine.decide(path, self.resolver.fallback_tier(), None)
    }

    /// Decision for a caller without a session.
    pub fn decide_unauthenticated(&self, path: &str) -> RoutingDecision {
        self.engine.decide_unauthenticated(path)
    }
}
