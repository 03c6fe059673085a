//! Network-scoped counters, metadata fields, missing-block set and heartbeats.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use chainsight_core::error::{StorageError, StorageResult};
use chainsight_core::ports::{Counter, Daemon, MetadataStore};

use super::database::Database;
use super::helpers::{db_error, to_i64};

/// PostgreSQL implementation of [`MetadataStore`].
///
/// Every row carries the network name so several chains can share one
/// database.
pub struct PgMetadataStore {
    pool: PgPool,
    network: String,
}

impl PgMetadataStore {
    pub fn new(db: &Database, network: impl Into<String>) -> Self {
        Self {
            pool: db.pool().clone(),
            network: network.into(),
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Number of blocks in the missing set.
    pub async fn missing_count(&self) -> StorageResult<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM missing_blocks WHERE network = $1")
                .bind(&self.network)
                .fetch_one(&self.pool)
                .await
                .map_err(db_error)?;
        Ok(count as u64)
    }

    async fn read(&self, key: &str) -> StorageResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM chain_metadata WHERE network = $1 AND key = $2")
                .bind(&self.network)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;
        Ok(row.map(|(v,)| v))
    }

    async fn write(&self, key: &str, value: &str) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_metadata (network, key, value, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (network, key) DO UPDATE SET
                value = EXCLUDED.value,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&self.network)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }
}

fn parse_counter(key: &str, value: &str) -> StorageResult<u64> {
    value.trim().parse().map_err(|_| {
        StorageError::SerializationError(format!("{key}: not a block number: {value:?}"))
    })
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn counter(&self, counter: Counter) -> StorageResult<u64> {
        match self.read(counter.key()).await? {
            Some(value) => parse_counter(counter.key(), &value),
            None => Ok(0),
        }
    }

    async fn set_counter(&self, counter: Counter, value: u64) -> StorageResult<()> {
        self.write(counter.key(), &value.to_string()).await
    }

    async fn advance_counter(&self, counter: Counter, value: u64) -> StorageResult<u64> {
        // The row is only touched when the stored value is lower
        let updated: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO chain_metadata (network, key, value, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (network, key) DO UPDATE SET
                value = EXCLUDED.value,
                updated_at = EXCLUDED.updated_at
            WHERE chain_metadata.value::NUMERIC < EXCLUDED.value::NUMERIC
            RETURNING value
            "#,
        )
        .bind(&self.network)
        .bind(counter.key())
        .bind(value.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match updated {
            Some((v,)) => parse_counter(counter.key(), &v),
            None => self.counter(counter).await,
        }
    }

    async fn set_metadata(&self, key: &str, value: &str) -> StorageResult<()> {
        self.write(key, value).await
    }

    async fn metadata(&self, key: &str) -> StorageResult<Option<String>> {
        self.read(key).await
    }

    async fn increment_metadata(&self, key: &str, by: u64) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_metadata (network, key, value, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (network, key) DO UPDATE SET
                value = (COALESCE(NULLIF(chain_metadata.value, ''), '0')::NUMERIC
                         + EXCLUDED.value::NUMERIC)::TEXT,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&self.network)
        .bind(key)
        .bind(by.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn add_missing(&self, block_number: u64) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO missing_blocks (network, block_num) VALUES ($1, $2) \
             ON CONFLICT (network, block_num) DO NOTHING",
        )
        .bind(&self.network)
        .bind(to_i64(block_number, "missing.block_num")?)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn remove_missing(&self, block_number: u64) -> StorageResult<()> {
        sqlx::query("DELETE FROM missing_blocks WHERE network = $1 AND block_num = $2")
            .bind(&self.network)
            .bind(to_i64(block_number, "missing.block_num")?)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn missing_blocks(&self) -> StorageResult<Vec<u64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT block_num FROM missing_blocks WHERE network = $1 ORDER BY block_num",
        )
        .bind(&self.network)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(rows.into_iter().map(|(n,)| n as u64).collect())
    }

    async fn heartbeat(&self, daemon: Daemon) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO daemon_heartbeats (network, daemon, beat_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (network, daemon) DO UPDATE SET beat_at = EXCLUDED.beat_at
            "#,
        )
        .bind(&self.network)
        .bind(daemon.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn last_heartbeat(&self, daemon: Daemon) -> StorageResult<Option<DateTime<Utc>>> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            "SELECT beat_at FROM daemon_heartbeats WHERE network = $1 AND daemon = $2",
        )
        .bind(&self.network)
        .bind(daemon.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(row.map(|(at,)| at))
    }
}
