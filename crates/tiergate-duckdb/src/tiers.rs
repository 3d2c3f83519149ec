use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use duckdb::{Connection, OptionalExt};
use tiergate_core::tier::{SubscriptionStatus, Tier};
use tiergate_metadata::{ApplyOutcome, TierRecord};

use crate::backend::DuckDbBackend;

const SELECT_TIER_COLUMNS: &str = "SELECT user_id, customer_id, tier, status, trial_ends_at, \
     subscription_ends_at, updated_at FROM user_tiers";

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("invalid stored timestamp `{raw}`"))
}

/// Row as stored; converted to a [`TierRecord`] outside the row callback so
/// parse failures surface as `anyhow` errors.
struct TierRow {
    user_id: String,
    customer_id: Option<String>,
    tier: String,
    status: String,
    trial_ends_at: Option<String>,
    subscription_ends_at: Option<String>,
    updated_at: String,
}

impl TierRow {
    fn read(row: &duckdb::Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            customer_id: row.get(1)?,
            tier: row.get(2)?,
            status: row.get(3)?,
            trial_ends_at: row.get(4)?,
            subscription_ends_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<TierRecord> {
        Ok(TierRecord {
            tier: self
                .tier
                .parse::<Tier>()
                .with_context(|| format!("user_tiers row for `{}`", self.user_id))?,
            status: self
                .status
                .parse::<SubscriptionStatus>()
                .with_context(|| format!("user_tiers row for `{}`", self.user_id))?,
            trial_ends_at: self.trial_ends_at.as_deref().map(parse_ts).transpose()?,
            subscription_ends_at: self
                .subscription_ends_at
                .as_deref()
                .map(parse_ts)
                .transpose()?,
            updated_at: parse_ts(&self.updated_at)?,
            user_id: self.user_id,
            customer_id: self.customer_id,
        })
    }
}

fn upsert_sync(conn: &Connection, record: &TierRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO user_tiers \
         (user_id, customer_id, tier, status, trial_ends_at, subscription_ends_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         ON CONFLICT (user_id) DO UPDATE SET \
           customer_id = excluded.customer_id, \
           tier = excluded.tier, \
           status = excluded.status, \
           trial_ends_at = excluded.trial_ends_at, \
           subscription_ends_at = excluded.subscription_ends_at, \
           updated_at = excluded.updated_at",
        duckdb::params![
            record.user_id,
            record.customer_id,
            record.tier.as_str(),
            record.status.as_str(),
            record.trial_ends_at.map(format_ts),
            record.subscription_ends_at.map(format_ts),
            format_ts(record.updated_at),
        ],
    )?;
    Ok(())
}

impl DuckDbBackend {
    pub async fn get_user_tier_record(&self, user_id: &str) -> Result<Option<TierRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!("{SELECT_TIER_COLUMNS} WHERE user_id = ?1"))?;
        let row = stmt
            .query_row(duckdb::params![user_id], TierRow::read)
            .optional()?;
        row.map(TierRow::into_record).transpose()
    }

    /// One query for many users. Unknown users are simply absent.
    pub async fn get_user_tier_records(&self, user_ids: &[String]) -> Result<Vec<TierRecord>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=user_ids.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare(&format!("{SELECT_TIER_COLUMNS} WHERE user_id IN ({placeholders})"))?;
        let rows = stmt
            .query_map(duckdb::params_from_iter(user_ids.iter()), TierRow::read)?
            .collect::<duckdb::Result<Vec<_>>>()?;
        rows.into_iter().map(TierRow::into_record).collect()
    }

    pub async fn find_user_by_customer(&self, customer_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let user_id = conn
            .query_row(
                "SELECT user_id FROM user_tiers WHERE customer_id = ?1 \
                 ORDER BY updated_at DESC LIMIT 1",
                duckdb::params![customer_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(user_id)
    }

    pub async fn upsert_user_tier(&self, record: &TierRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        upsert_sync(&conn, record)
    }

    /// Claim `event_id` and write `record` in one transaction.
    ///
    /// A claimed id short-circuits to `Duplicate` without touching
    /// `user_tiers`. A stored row with a newer `updated_at` keeps the claim
    /// but skips the write.
    pub async fn apply_subscription_event(
        &self,
        event_id: &str,
        record: &TierRecord,
    ) -> Result<ApplyOutcome> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let seen: i64 = tx.query_row(
            "SELECT COUNT(*) FROM processed_webhooks WHERE event_id = ?1",
            duckdb::params![event_id],
            |row| row.get(0),
        )?;
        if seen > 0 {
            return Ok(ApplyOutcome::Duplicate);
        }
        tx.execute(
            "INSERT INTO processed_webhooks (event_id) VALUES (?1)",
            duckdb::params![event_id],
        )?;

        let stored: Option<String> = tx
            .query_row(
                "SELECT updated_at FROM user_tiers WHERE user_id = ?1",
                duckdb::params![record.user_id],
                |row| row.get(0),
            )
            .optional()?;
        let stale = match stored.as_deref() {
            Some(raw) => parse_ts(raw)? > record.updated_at,
            None => false,
        };
        if !stale {
            upsert_sync(&tx, record)?;
        }
        tx.commit()?;

        Ok(if stale {
            ApplyOutcome::Stale
        } else {
            ApplyOutcome::Applied
        })
    }
}
