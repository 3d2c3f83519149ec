use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigurationError;
use crate::tier::Tier;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: String,
    pub duckdb_memory_limit: String,
    pub cors_origins: Vec<String>,

    pub cache_ttl_secs: u64,
    /// TTL for fallback results produced while every source was failing.
    pub cache_degraded_ttl_secs: u64,
    pub cache_max_entries: usize,
    pub cache_max_bytes: usize,
    /// 0 disables the background sweep; expiry is still enforced on read.
    pub cache_sweep_interval_secs: u64,

    pub identity_budget_ms: u64,
    pub billing_budget_ms: u64,
    pub store_budget_ms: u64,
    pub decision_budget_ms: u64,
    pub batch_delay_ms: u64,
    pub batch_max_size: usize,
    pub fallback_tier: Tier,

    pub matrix_path: Option<String>,
    pub routes_path: Option<String>,

    pub clerk_secret_key: Option<String>,
    pub clerk_api_url: String,
    pub stripe_secret_key: Option<String>,
    pub stripe_api_url: String,
    /// Billing price id to tier.
    pub price_tiers: BTreeMap<String, Tier>,
    pub webhook_signing_secret: Option<String>,
    /// HS256 secret for session tokens presented to the forward-auth endpoint.
    pub session_secret: Option<String>,
    /// Bearer token for the cache administration endpoints.
    pub admin_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            data_dir: "./data".to_string(),
            duckdb_memory_limit: "256MB".to_string(),
            cors_origins: Vec::new(),
            cache_ttl_secs: 300,
            cache_degraded_ttl_secs: 15,
            cache_max_entries: 10_000,
            cache_max_bytes: 16 * 1024 * 1024,
            cache_sweep_interval_secs: 60,
            identity_budget_ms: 25,
            billing_budget_ms: 40,
            store_budget_ms: 20,
            decision_budget_ms: 100,
            batch_delay_ms: 10,
            batch_max_size: 64,
            fallback_tier: Tier::Basic,
            matrix_path: None,
            routes_path: None,
            clerk_secret_key: None,
            clerk_api_url: "https://api.clerk.com/v1".to_string(),
            stripe_secret_key: None,
            stripe_api_url: "https://api.stripe.com/v1".to_string(),
            price_tiers: BTreeMap::new(),
            webhook_signing_secret: None,
            session_secret: None,
            admin_token: None,
        }
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(name: &str, default: T) -> Result<T, ConfigurationError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigurationError::invalid(format!("{name}: {e}"))),
        None => Ok(default),
    }
}

/// Parse `price_123:professional,price_456:enterprise`.
pub fn parse_price_tiers(raw: &str) -> Result<BTreeMap<String, Tier>, ConfigurationError> {
    let mut map = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (price, tier) = pair.split_once(':').ok_or_else(|| {
            ConfigurationError::invalid(format!(
                "TIERGATE_PRICE_TIERS: expected `price:tier`, got `{pair}`"
            ))
        })?;
        let tier: Tier = tier
            .parse()
            .map_err(|e| ConfigurationError::invalid(format!("TIERGATE_PRICE_TIERS: {e}")))?;
        map.insert(price.trim().to_string(), tier);
    }
    Ok(map)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let d = Self::default();
        Ok(Self {
            port: parsed("TIERGATE_PORT", d.port)?,
            data_dir: var("TIERGATE_DATA_DIR").unwrap_or(d.data_dir),
            duckdb_memory_limit: var("TIERGATE_DUCKDB_MEMORY").unwrap_or(d.duckdb_memory_limit),
            cors_origins: var("TIERGATE_CORS_ORIGINS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            cache_ttl_secs: parsed("TIERGATE_CACHE_TTL_SECS", d.cache_ttl_secs)?,
            cache_degraded_ttl_secs: parsed(
                "TIERGATE_CACHE_DEGRADED_TTL_SECS",
                d.cache_degraded_ttl_secs,
            )?,
            cache_max_entries: parsed("TIERGATE_CACHE_MAX_ENTRIES", d.cache_max_entries)?,
            cache_max_bytes: parsed("TIERGATE_CACHE_MAX_BYTES", d.cache_max_bytes)?,
            cache_sweep_interval_secs: parsed(
                "TIERGATE_CACHE_SWEEP_INTERVAL_SECS",
                d.cache_sweep_interval_secs,
            )?,
            identity_budget_ms: parsed("TIERGATE_IDENTITY_BUDGET_MS", d.identity_budget_ms)?,
            billing_budget_ms: parsed("TIERGATE_BILLING_BUDGET_MS", d.billing_budget_ms)?,
            store_budget_ms: parsed("TIERGATE_STORE_BUDGET_MS", d.store_budget_ms)?,
            decision_budget_ms: parsed("TIERGATE_DECISION_BUDGET_MS", d.decision_budget_ms)?,
            batch_delay_ms: parsed("TIERGATE_BATCH_DELAY_MS", d.batch_delay_ms)?,
            batch_max_size: parsed("TIERGATE_BATCH_MAX_SIZE", d.batch_max_size)?,
            fallback_tier: parsed("TIERGATE_FALLBACK_TIER", d.fallback_tier)?,
            matrix_path: var("TIERGATE_MATRIX_PATH"),
            routes_path: var("TIERGATE_ROUTES_PATH"),
            clerk_secret_key: var("CLERK_SECRET_KEY"),
            clerk_api_url: var("CLERK_API_URL").unwrap_or(d.clerk_api_url),
            stripe_secret_key: var("STRIPE_SECRET_KEY"),
            stripe_api_url: var("STRIPE_API_URL").unwrap_or(d.stripe_api_url),
            price_tiers: match var("TIERGATE_PRICE_TIERS") {
                Some(raw) => parse_price_tiers(&raw)?,
                None => d.price_tiers,
            },
            webhook_signing_secret: var("TIERGATE_WEBHOOK_SIGNING_SECRET"),
            session_secret: var("TIERGATE_SESSION_SECRET"),
            admin_token: var("TIERGATE_ADMIN_TOKEN"),
        })
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn cache_degraded_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_degraded_ttl_secs)
    }

    pub fn identity_budget(&self) -> Duration {
        Duration::from_millis(self.identity_budget_ms)
    }

    pub fn billing_budget(&self) -> Duration {
        Duration::from_millis(self.billing_budget_ms)
    }

    pub fn store_budget(&self) -> Duration {
        Duration::from_millis(self.store_budget_ms)
    }

    pub fn decision_budget(&self) -> Duration {
        Duration::from_millis(self.decision_budget_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}
