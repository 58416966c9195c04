/// Shared record types and the durable checkpoint store.
///
/// Each component owns one opaque state blob, checkpointed on every mutation
/// and reloaded on restart. The store only needs to tolerate concurrent
/// idempotent writers; dedup-by-id inside the blobs makes overlapping writes
/// commutative.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::{PgPool, Row};

use crate::error::MentionRewardsError;
use crate::provider::PostKind;

/// One ingested post. Created on first sighting, mutated only to flip
/// `processed`, removed only by retention cleanup. There is deliberately no
/// body-text field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: String,
    pub author_id: String,
    pub author_handle: String,
    pub author_name: String,
    pub created_at: DateTime<Utc>,
    pub kind: PostKind,
    pub view_count: u64,
    pub follower_count: u64,
    pub has_share_link: bool,
    pub processed: bool,
    pub fetched_at: DateTime<Utc>,
}

/// Append-only fetch audit entry, trimmed to a bounded count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchHistoryEntry {
    pub fetched_at: DateTime<Utc>,
    pub fetched: u32,
    pub new: u32,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// One reward per (author, date). Once `sent`, never recomputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardRecord {
    pub author_id: String,
    pub author_handle: String,
    pub reward_date: NaiveDate,
    /// Reference post for the ledger call.
    pub post_id: String,
    pub post_count: u32,
    pub regular_credits: u32,
    pub bonus_credits: u32,
    pub bonus_before_multiplier: u32,
    pub final_credits: u32,
    pub has_share_link: bool,
    pub sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub transaction_id: Option<String>,
}

/// A (minViews, minFollowers, credits) rule. Best match is the highest
/// credits among tiers whose thresholds are all satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardTier {
    pub min_views: u64,
    pub min_followers: u64,
    pub credits: u32,
}

/// What a detected gap is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingKind {
    PostData,
    RewardData,
}

/// A half-open `[start, end)` slice with no stored data. Always recomputed
/// on demand, never persisted as ground truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub kind: MissingKind,
}

impl MissingPeriod {
    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

/// Durable per-component checkpoint store.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>>;
    async fn save(&self, key: &str, state: serde_json::Value) -> Result<()>;
}

pub async fn load_state<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>> {
    match store.load(key).await? {
        Some(value) => {
            let state = serde_json::from_value(value)
                .with_context(|| format!("Failed to decode checkpoint '{}'", key))?;
            Ok(Some(state))
        }
        None => Ok(None),
    }
}

pub async fn save_state<T: Serialize>(store: &dyn StateStore, key: &str, state: &T) -> Result<()> {
    let value = serde_json::to_value(state)
        .with_context(|| format!("Failed to encode checkpoint '{}'", key))?;
    store.save(key, value).await
}

/// Postgres-backed checkpoint store: one JSONB row per component key.
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        // Check if using connection pooler (pgBouncer)
        let use_pooler = database_url.contains(":6543") || database_url.contains("pgbouncer=true");

        let mut pool_options = sqlx::postgres::PgPoolOptions::new().max_connections(10);

        // Disable prepared statements for connection poolers
        if use_pooler {
            log::info!("Using connection pooler - disabling prepared statements");
            pool_options = pool_options.after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("SET statement_timeout = 0")
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            });
        }

        let pool = pool_options
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    /// Create the checkpoint table if it doesn't exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS component_state (
                key TEXT PRIMARY KEY,
                state JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create component_state table")?;

        Ok(())
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT state FROM component_state WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| MentionRewardsError::Store(e.to_string()))
            .with_context(|| format!("Failed to load checkpoint '{}'", key))?;

        Ok(row.map(|r| r.get("state")))
    }

    async fn save(&self, key: &str, state: serde_json::Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO component_state (key, state, updated_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (key) DO UPDATE SET state = EXCLUDED.state, updated_at = NOW()",
        )
        .bind(key)
        .bind(state)
        .execute(&self.pool)
        .await
        .map_err(|e| MentionRewardsError::Store(e.to_string()))
        .with_context(|| format!("Failed to save checkpoint '{}'", key))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStateStore;

    #[tokio::test]
    async fn checkpoint_round_trip() {
        let store = MemoryStateStore::default();

        let record = RewardRecord {
            author_id: "a1".into(),
            author_handle: "alice".into(),
            reward_date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            post_id: "p1".into(),
            post_count: 3,
            regular_credits: 6,
            bonus_credits: 15,
            bonus_before_multiplier: 10,
            final_credits: 21,
            has_share_link: true,
            sent: false,
            sent_at: None,
            transaction_id: None,
        };

        save_state(&store, "reward:test", &vec![record.clone()])
            .await
            .unwrap();

        let loaded: Vec<RewardRecord> = load_state(&store, "reward:test").await.unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].final_credits, 21);
        assert_eq!(loaded[0].reward_date, record.reward_date);
    }

    #[tokio::test]
    async fn missing_key_loads_none() {
        let store = MemoryStateStore::default();
        let loaded: Option<Vec<RewardRecord>> = load_state(&store, "nope").await.unwrap();
        assert!(loaded.is_none());
    }
}
