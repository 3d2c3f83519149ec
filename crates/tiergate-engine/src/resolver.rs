//! Ordered multi-source tier resolution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tiergate_core::config::Config;
use tiergate_core::source::{
    BillingProvider, IdentityProvider, ResolutionContext, SourceOutcome, TierSource,
};
use tiergate_core::tier::{ResolutionSource, SubscriptionStatus, Tier, TierDetectionResult};
use tiergate_core::{PermissionMatrix, SourceError};
use tiergate_metadata::{TierRecord, TierStore};
use tracing::{debug, warn};

use crate::batch::{BatchConfig, BatchLoader, BatchWindow};
use crate::clock::Clock;

struct Stage {
    source: Arc<dyn TierSource>,
    budget: Duration,
}

/// Queries tier sources in priority order and returns the first confident
/// answer, or the fallback tier when none has one.
pub struct TierResolver {
    stages: Vec<Stage>,
    matrix: Arc<PermissionMatrix>,
    fallback_tier: Tier,
    clock: Arc<dyn Clock>,
}

impl TierResolver {
    pub fn new(matrix: Arc<PermissionMatrix>, fallback_tier: Tier, clock: Arc<dyn Clock>) -> Self {
        Self {
            stages: Vec::new(),
            matrix,
            fallback_tier,
            clock,
        }
    }

    /// Append a stage. Stages run in the order they were added.
    pub fn with_stage(mut self, source: Arc<dyn TierSource>, budget: Duration) -> Self {
        self.stages.push(Stage { source, budget });
        self
    }

    pub fn fallback_tier(&self) -> Tier {
        self.fallback_tier
    }

    fn ordered(&self, preferred: Option<&[ResolutionSource]>) -> Vec<&Stage> {
        match preferred {
            None => self.stages.iter().collect(),
            Some(order) => {
                let mut picked: Vec<&Stage> = Vec::new();
                for kind in order {
                    if picked.iter().any(|s| s.source.kind() == *kind) {
                        continue;
                    }
                    if let Some(stage) = self.stages.iter().find(|s| s.source.kind() == *kind) {
                        picked.push(stage);
                    }
                }
                picked
            }
        }
    }

    /// Resolve `user_id`. Never fails: stage failures and timeouts move on to
    /// the next stage, and exhaustion yields the fallback tier.
    ///
    /// `preferred_order` selects and orders the stages to consult; the
    /// fallback tier always comes last.
    #[tracing::instrument(skip(self, preferred_order))]
    pub async fn resolve(
        &self,
        user_id: &str,
        preferred_order: Option<&[ResolutionSource]>,
    ) -> TierDetectionResult {
        let mut ctx = ResolutionContext::new(user_id);
        let mut failures: Vec<SourceError> = Vec::new();

        for stage in self.ordered(preferred_order) {
            let kind = stage.source.kind();
            let lookup = stage.source.lookup(&mut ctx);
            let outcome = match tokio::time::timeout(stage.budget, lookup).await {
                Ok(outcome) => outcome,
                Err(_) => SourceOutcome::Failed(SourceError::Timeout {
                    stage: kind,
                    budget: stage.budget,
                }),
            };

            match outcome {
                SourceOutcome::Resolved(result) if result.is_expired(self.clock.utc_now()) => {
                    debug!(
                        source = %kind,
                        tier = %result.tier,
                        "Tier source returned an expired entitlement"
                    );
                }
                SourceOutcome::Resolved(result) => {
                    debug!(
                        source = %kind,
                        tier = %result.tier,
                        status = %result.status,
                        "Tier resolved"
                    );
                    return result;
                }
                SourceOutcome::Miss => {
                    debug!(source = %kind, "Tier source miss");
                }
                SourceOutcome::Failed(e) => {
                    warn!(source = %kind, error = %e, "Tier source failed");
                    failures.push(e);
                }
            }
        }

        if failures.is_empty() {
            debug!(tier = %self.fallback_tier, "No tier source knows this user; using fallback tier");
        } else {
            let failed: Vec<&str> = failures.iter().map(|e| e.stage().as_str()).collect();
            warn!(
                tier = %self.fallback_tier,
                failed = ?failed,
                "All tier sources exhausted; serving fallback tier in degraded mode"
            );
        }
        TierDetectionResult::fallback(self.fallback_tier, &self.matrix)
            .with_resolved_at(self.clock.utc_now())
    }
}

/// Reads tier claims from the identity provider. Also records the billing
/// customer id for later stages.
pub struct IdentityStage {
    provider: Arc<dyn IdentityProvider>,
    matrix: Arc<PermissionMatrix>,
}

impl IdentityStage {
    pub fn new(provider: Arc<dyn IdentityProvider>, matrix: Arc<PermissionMatrix>) -> Self {
        Self { provider, matrix }
    }
}

#[async_trait]
impl TierSource for IdentityStage {
    fn kind(&self) -> ResolutionSource {
        ResolutionSource::IdentityProvider
    }

    async fn lookup(&self, ctx: &mut ResolutionContext) -> SourceOutcome {
        let claims = match self.provider.get_claims(&ctx.user_id).await {
            Ok(Some(claims)) => claims,
            Ok(None) => return SourceOutcome::Miss,
            Err(e) => return SourceOutcome::Failed(SourceError::unavailable(self.kind(), e)),
        };
        if let Some(customer_id) = &claims.billing_customer_id {
            ctx.billing_customer_id = Some(customer_id.clone());
        }

        let Some(raw_tier) = claims.tier.as_deref() else {
            return SourceOutcome::Miss;
        };
        let tier = match raw_tier.parse::<Tier>() {
            Ok(tier) => tier,
            Err(e) => {
                warn!(user_id = %ctx.user_id, error = %e, "Ignoring identity claims");
                return SourceOutcome::Miss;
            }
        };
        let status = match claims.status.as_deref().map(str::parse::<SubscriptionStatus>) {
            None => SubscriptionStatus::Active,
            Some(Ok(status)) => status,
            Some(Err(e)) => {
                warn!(user_id = %ctx.user_id, error = %e, "Ignoring identity claims");
                return SourceOutcome::Miss;
            }
        };

        SourceOutcome::Resolved(
            TierDetectionResult::new(tier, status, self.kind(), &self.matrix)
                .with_trial_end(claims.trial_ends_at)
                .with_subscription_end(claims.subscription_ends_at),
        )
    }
}

/// Authoritative subscription lookup. Uses the customer id an earlier stage
/// put on the context, or the one persisted in the store.
pub struct BillingStage {
    provider: Arc<dyn BillingProvider>,
    matrix: Arc<PermissionMatrix>,
    store: Option<Arc<dyn TierStore>>,
}

impl BillingStage {
    pub fn new(provider: Arc<dyn BillingProvider>, matrix: Arc<PermissionMatrix>) -> Self {
        Self {
            provider,
            matrix,
            store: None,
        }
    }

    /// Look up the customer id in `store` when no earlier stage supplied one.
    pub fn with_store(mut self, store: Arc<dyn TierStore>) -> Self {
        self.store = Some(store);
        self
    }

    async fn customer_id(&self, ctx: &mut ResolutionContext) -> Option<String> {
        if ctx.billing_customer_id.is_none() {
            let store = self.store.as_ref()?;
            match store.get_user_tier_record(&ctx.user_id).await {
                Ok(record) => ctx.billing_customer_id = record.and_then(|r| r.customer_id),
                Err(e) => {
                    warn!(
                        user_id = %ctx.user_id,
                        error = %format!("{e:#}"),
                        "Could not read billing customer id from the store"
                    );
                    return None;
                }
            }
        }
        ctx.billing_customer_id.clone()
    }
}

#[async_trait]
impl TierSource for BillingStage {
    fn kind(&self) -> ResolutionSource {
        ResolutionSource::Billing
    }

    async fn lookup(&self, ctx: &mut ResolutionContext) -> SourceOutcome {
        let Some(customer_id) = self.customer_id(ctx).await else {
            return SourceOutcome::Miss;
        };
        let sub = match self.provider.get_subscription(&customer_id).await {
            Ok(Some(sub)) => sub,
            Ok(None) => return SourceOutcome::Miss,
            Err(e) => return SourceOutcome::Failed(SourceError::unavailable(self.kind(), e)),
        };

        let tier = if sub.status.grants_access() {
            sub.tier
        } else {
            Tier::Basic
        };
        let ends_at = if sub.cancel_at_period_end || sub.status == SubscriptionStatus::Canceled {
            sub.current_period_end
        } else {
            None
        };
        SourceOutcome::Resolved(
            TierDetectionResult::new(tier, sub.status, self.kind(), &self.matrix)
                .with_trial_end(sub.trial_end)
                .with_subscription_end(ends_at),
        )
    }
}

/// Adapts a [`TierStore`] to [`BatchLoader`] keyed by user id.
pub struct StoreBatchLoader {
    store: Arc<dyn TierStore>,
}

impl StoreBatchLoader {
    pub fn new(store: Arc<dyn TierStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BatchLoader for StoreBatchLoader {
    type Key = String;
    type Value = TierRecord;

    async fn load_batch(&self, keys: &[String]) -> anyhow::Result<HashMap<String, TierRecord>> {
        let records = self.store.get_user_tier_records(keys).await?;
        Ok(records.into_iter().map(|r| (r.user_id.clone(), r)).collect())
    }
}

enum StoreAccess {
    Direct(Arc<dyn TierStore>),
    Batched(BatchWindow<StoreBatchLoader>),
}

/// Last persisted tier from the durable store.
pub struct StoreStage {
    access: StoreAccess,
    matrix: Arc<PermissionMatrix>,
}

impl StoreStage {
    pub fn new(store: Arc<dyn TierStore>, matrix: Arc<PermissionMatrix>) -> Self {
        Self {
            access: StoreAccess::Direct(store),
            matrix,
        }
    }

    /// Route lookups through a batch window so concurrent misses share one
    /// multi-key query. Must be called inside a tokio runtime.
    pub fn batched(
        store: Arc<dyn TierStore>,
        matrix: Arc<PermissionMatrix>,
        config: BatchConfig,
    ) -> Self {
        let window = BatchWindow::new(Arc::new(StoreBatchLoader::new(store)), config);
        Self {
            access: StoreAccess::Batched(window),
            matrix,
        }
    }
}

#[async_trait]
impl TierSource for StoreStage {
    fn kind(&self) -> ResolutionSource {
        ResolutionSource::Database
    }

    async fn lookup(&self, ctx: &mut ResolutionContext) -> SourceOutcome {
        let record = match &self.access {
            StoreAccess::Direct(store) => store
                .get_user_tier_record(&ctx.user_id)
                .await
                .map_err(|e| SourceError::unavailable(self.kind(), format!("{e:#}"))),
            StoreAccess::Batched(window) => window
                .load(ctx.user_id.clone())
                .await
                .map_err(|e| SourceError::unavailable(self.kind(), e)),
        };
        match record {
            Ok(Some(record)) => SourceOutcome::Resolved(
                TierDetectionResult::new(record.tier, record.status, self.kind(), &self.matrix)
                    .with_trial_end(record.trial_ends_at)
                    .with_subscription_end(record.subscription_ends_at),
            ),
            Ok(None) => SourceOutcome::Miss,
            Err(e) => SourceOutcome::Failed(e),
        }
    }
}

/// The standard chain: identity, then billing, then the store. Sources that
/// are not configured are left out.
pub fn standard_resolver(
    config: &Config,
    matrix: Arc<PermissionMatrix>,
    clock: Arc<dyn Clock>,
    identity: Option<Arc<dyn IdentityProvider>>,
    billing: Option<Arc<dyn BillingProvider>>,
    store: Arc<dyn TierStore>,
) -> TierResolver {
    let mut resolver = TierResolver::new(Arc::clone(&matrix), config.fallback_tier, clock);
    if let Some(provider) = identity {
        resolver = resolver.with_stage(
            Arc::new(IdentityStage::new(provider, Arc::clone(&matrix))),
            config.identity_budget(),
        );
    }
    if let Some(provider) = billing {
        let stage =
            BillingStage::new(provider, Arc::clone(&matrix)).with_store(Arc::clone(&store));
        resolver = resolver.with_stage(Arc::new(stage), config.billing_budget());
    }
    let store_stage = if config.batch_max_size > 1 {
        StoreStage::batched(
            store,
            matrix,
            BatchConfig {
                max_delay: config.batch_delay(),
                max_batch_size: config.batch_max_size,
            },
        )
    } else {
        StoreStage::new(store, matrix)
    };
    resolver.with_stage(Arc::new(store_stage), config.store_budget())
}
