//! HTTP adapters for the external tier sources.

mod catalog;
pub mod clerk;
pub mod stripe;

use std::sync::Arc;

use tiergate_core::config::Config;
use tiergate_core::source::{BillingProvider, IdentityProvider};
use tracing::info;

pub use catalog::{PlanError, PriceCatalog};
pub use clerk::ClerkIdentityProvider;
pub use stripe::StripeBillingProvider;

/// Identity and billing providers for the credentials present in `config`.
pub fn providers_from_config(
    config: &Config,
) -> (
    Option<Arc<dyn IdentityProvider>>,
    Option<Arc<dyn BillingProvider>>,
) {
    let identity = config.clerk_secret_key.as_deref().map(|key| {
        info!(api = %config.clerk_api_url, "Identity provider enabled");
        Arc::new(ClerkIdentityProvider::new(&config.clerk_api_url, key))
            as Arc<dyn IdentityProvider>
    });
    let billing = config.stripe_secret_key.as_deref().map(|key| {
        info!(
            api = %config.stripe_api_url,
            prices = config.price_tiers.len(),
            "Billing provider enabled"
        );
        Arc::new(StripeBillingProvider::new(
            &config.stripe_api_url,
            key,
            PriceCatalog::new(config.price_tiers.clone()),
        )) as Arc<dyn BillingProvider>
    });
    (identity, billing)
}
