use std::sync::Arc;

use tiergate_core::config::Config;
use tiergate_core::source::{BillingProvider, IdentityProvider};
use tiergate_core::AccessDecisionEngine;
use tiergate_engine::{
    standard_resolver, AccessGate, CacheConfig, Clock, SystemClock, TierCache, TierSynchronizer,
};
use tiergate_metadata::TierStore;

use crate::sources::PriceCatalog;

/// Shared application state injected into every Axum handler via
/// [`axum::extract::State`].
pub struct AppState {
    /// Parsed configuration, loaded once at startup from environment variables.
    pub config: Arc<Config>,

    /// Durable tier records and the webhook idempotency ledger.
    pub store: Arc<dyn TierStore>,

    /// Cached resolution plus route decision. Owns the [`TierCache`].
    pub gate: Arc<AccessGate>,

    pub synchronizer: Arc<TierSynchronizer>,

    /// Billing price id to tier, shared by the billing adapter and the
    /// webhook parser.
    pub catalog: Arc<PriceCatalog>,
}

impl AppState {
    /// Wire the resolver chain, the cache, the gate and the synchronizer.
    ///
    /// Must run inside a Tokio runtime: a batched store stage spawns its
    /// collector task here.
    pub fn new(
        config: Config,
        engine: AccessDecisionEngine,
        store: Arc<dyn TierStore>,
        identity: Option<Arc<dyn IdentityProvider>>,
        billing: Option<Arc<dyn BillingProvider>>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let engine = Arc::new(engine);
        let resolver = standard_resolver(
            &config,
            Arc::clone(engine.matrix()),
            Arc::clone(&clock),
            identity,
            billing,
            Arc::clone(&store),
        );
        let cache = Arc::new(TierCache::new(CacheConfig::from(&config), clock));
        let gate = AccessGate::new(
            engine,
            Arc::clone(&cache),
            Arc::new(resolver),
            config.decision_budget(),
        );
        let synchronizer = TierSynchronizer::new(Arc::clone(&store), cache);
        let catalog = PriceCatalog::new(config.price_tiers.clone());

        Self {
            config: Arc::new(config),
            store,
            gate: Arc::new(gate),
            synchronizer: Arc::new(synchronizer),
            catalog: Arc::new(catalog),
        }
    }

    pub fn cache(&self) -> &Arc<TierCache> {
        self.gate.cache()
    }
}
