/// DuckDB initialization SQL.
///
/// Executed once at open time via `Connection::execute_batch`. Every
/// statement uses `IF NOT EXISTS`, so it is safe to re-run on each startup.
///
/// Timestamps are stored as RFC 3339 strings with microsecond precision in
/// UTC, which keeps them both lossless and lexically ordered.
///
/// `user_tiers` carries no secondary index: DuckDB refuses
/// `ON CONFLICT DO UPDATE` assignments to indexed columns, and
/// `customer_id` must stay updatable.
pub fn init_sql(memory_limit: &str) -> String {
    format!(
        r#"SET memory_limit = '{memory_limit}';
SET threads = 2;

-- ===========================================
-- USER TIERS
-- ===========================================
CREATE TABLE IF NOT EXISTS user_tiers (
    user_id               VARCHAR PRIMARY KEY,
    customer_id           VARCHAR,                -- billing provider customer id
    tier                  VARCHAR NOT NULL,       -- basic | professional | enterprise
    status                VARCHAR NOT NULL,       -- active | trialing | past_due | canceled | ...
    trial_ends_at         VARCHAR,
    subscription_ends_at  VARCHAR,
    updated_at            VARCHAR NOT NULL        -- billing-side time of the change
);

-- ===========================================
-- WEBHOOK IDEMPOTENCY LEDGER
-- ===========================================
CREATE TABLE IF NOT EXISTS processed_webhooks (
    event_id      VARCHAR PRIMARY KEY,
    processed_at  TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#
    )
}
