//! Sharded block store.
//!
//! Blocks, extrinsics, events and logs are split into physical tables of
//! [`SHARD_SIZE`] blocks each. Shard 0 is created by the migrations; other
//! shards are created the first time a block in their range is written.

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::RwLock;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, instrument};

use chainsight_core::error::{StorageError, StorageResult};
use chainsight_core::models::{
    Block, BlockCounts, BlockData, Event, Extrinsic, Log, RuntimeVersion, SHARD_SIZE, shard_of,
    sharded_table,
};
use chainsight_core::ports::{BlockStore, PersistOutcome};

use super::database::Database;
use super::helpers::{db_error, to_i64, tx_error};
use super::rows::{
    BLOCK_COLUMNS, BlockCountsRow, BlockRow, EVENT_COLUMNS, EXTRINSIC_COLUMNS, EventRow,
    ExtrinsicRow, RuntimeVersionRow,
};

/// Entities stored per shard.
pub const SHARDED_TABLES: [&str; 4] = ["blocks", "extrinsics", "events", "logs"];

/// DDL creating every table of one shard from the shard-0 templates.
pub(crate) fn shard_ddl(shard: u64) -> Vec<String> {
    if shard == 0 {
        return Vec::new();
    }
    SHARDED_TABLES
        .iter()
        .map(|base| {
            format!("CREATE TABLE IF NOT EXISTS {base}_{shard} (LIKE {base} INCLUDING ALL)")
        })
        .collect()
}

/// Physical table names of one shard.
pub(crate) fn shard_tables(shard: u64) -> Vec<String> {
    SHARDED_TABLES
        .iter()
        .map(|base| {
            if shard == 0 {
                (*base).to_string()
            } else {
                format!("{base}_{shard}")
            }
        })
        .collect()
}

fn missing_from(expected: &[String], present: &[String]) -> Vec<String> {
    expected
        .iter()
        .filter(|t| !present.contains(t))
        .cloned()
        .collect()
}

/// Shards overlapping a block range, highest first.
pub(crate) fn shards_in(range: &RangeInclusive<u64>) -> std::iter::Rev<RangeInclusive<u64>> {
    (shard_of(*range.start())..=shard_of(*range.end())).rev()
}

/// PostgreSQL implementation of [`BlockStore`].
pub struct PgBlockStore {
    pool: PgPool,
    /// Shards known to exist.
    shards: RwLock<HashSet<u64>>,
}

impl PgBlockStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
            shards: RwLock::new(HashSet::from([0])),
        }
    }

    fn is_known(&self, shard: u64) -> bool {
        self.shards
            .read()
            .map(|s| s.contains(&shard))
            .unwrap_or(false)
    }

    fn remember(&self, shard: u64) {
        if let Ok(mut shards) = self.shards.write() {
            shards.insert(shard);
        }
    }

    /// Tables of `shard` that do not exist yet.
    async fn missing_tables(&self, shard: u64) -> StorageResult<Vec<String>> {
        let expected = shard_tables(shard);
        let present: Vec<(String,)> = sqlx::query_as(
            "SELECT t FROM unnest($1::TEXT[]) AS t WHERE to_regclass(t) IS NOT NULL",
        )
        .bind(&expected)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        let present: Vec<String> = present.into_iter().map(|(t,)| t).collect();
        Ok(missing_from(&expected, &present))
    }

    /// Whether every table of the shard holding `block_number` exists.
    async fn shard_exists(&self, block_number: u64) -> StorageResult<bool> {
        let shard = shard_of(block_number);
        if self.is_known(shard) {
            return Ok(true);
        }

        let complete = self.missing_tables(shard).await?.is_empty();
        if complete {
            self.remember(shard);
        }
        Ok(complete)
    }

    /// Create the shard holding `block_number` if needed.
    async fn ensure_shard(&self, block_number: u64) -> StorageResult<()> {
        if self.shard_exists(block_number).await? {
            return Ok(());
        }

        let shard = shard_of(block_number);
        let mut last_error = None;
        for ddl in shard_ddl(shard) {
            // Another worker may be creating the same table; checked below.
            if let Err(e) = sqlx::raw_sql(&ddl).execute(&self.pool).await {
                debug!(shard, error = %e, "Shard DDL failed");
                last_error = Some(e);
            }
        }

        let missing = self.missing_tables(shard).await?;
        if !missing.is_empty() {
            return Err(match last_error {
                Some(e) => db_error(e),
                None => StorageError::QueryError(format!(
                    "shard {shard} incomplete, missing {}",
                    missing.join(", ")
                )),
            });
        }

        info!(shard, first_block = shard * SHARD_SIZE, "🗄️  Created block shard");
        self.remember(shard);
        Ok(())
    }

    async fn insert_extrinsic(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        ext: &Extrinsic,
    ) -> StorageResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (
                id, block_number, index, hash, call_module, call_module_function,
                signer, signature, nonce, tip, params, success, fee
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10::NUMERIC, $11, $12, $13::NUMERIC)
            "#
        ))
        .bind(&ext.id)
        .bind(to_i64(ext.block_number, "extrinsic.block_number")?)
        .bind(ext.index as i32)
        .bind(ext.hash.as_ref().map(|h| &h.0[..]))
        .bind(&ext.call_module)
        .bind(&ext.call_module_function)
        .bind(ext.signer.as_ref().map(|s| &s.0[..]))
        .bind(&ext.signature)
        .bind(ext.nonce.map(|n| n as i64))
        .bind(ext.tip.to_string())
        .bind(&ext.params)
        .bind(ext.success)
        .bind(ext.fee.to_string())
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn insert_event(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        event: &Event,
    ) -> StorageResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (
                id, block_number, index, phase, extrinsic_index,
                module_id, event_id, params, extrinsic_hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#
        ))
        .bind(&event.id)
        .bind(to_i64(event.block_number, "event.block_number")?)
        .bind(event.index as i32)
        .bind(event.phase.as_str())
        .bind(event.extrinsic_index().map(|i| i as i32))
        .bind(&event.module_id)
        .bind(&event.event_id)
        .bind(&event.params)
        .bind(event.extrinsic_hash.as_ref().map(|h| &h.0[..]))
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn insert_log(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        log: &Log,
    ) -> StorageResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {table} (id, block_number, index, log_type, data, finalized) \
             VALUES ($1, $2, $3, $4, $5, $6)"
        ))
        .bind(&log.id)
        .bind(to_i64(log.block_number, "log.block_number")?)
        .bind(log.index as i32)
        .bind(&log.log_type)
        .bind(&log.data)
        .bind(log.finalized)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    /// Upsert the block row last; reports whether it was newly created.
    async fn upsert_block(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        block: &Block,
    ) -> StorageResult<PersistOutcome> {
        let (created,): (bool,) = sqlx::query_as(&format!(
            r#"
            INSERT INTO {table} (
                number, hash, parent_hash, state_root, extrinsics_root,
                logs_raw, extrinsics_raw, event_raw, extrinsics_count, event_count,
                spec_version, validator, finalized, codec_error, timestamp, indexed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW())
            ON CONFLICT (number) DO UPDATE SET
                hash = EXCLUDED.hash,
                parent_hash = EXCLUDED.parent_hash,
                state_root = EXCLUDED.state_root,
                extrinsics_root = EXCLUDED.extrinsics_root,
                logs_raw = EXCLUDED.logs_raw,
                extrinsics_raw = EXCLUDED.extrinsics_raw,
                event_raw = EXCLUDED.event_raw,
                extrinsics_count = EXCLUDED.extrinsics_count,
                event_count = EXCLUDED.event_count,
                spec_version = EXCLUDED.spec_version,
                validator = EXCLUDED.validator,
                finalized = EXCLUDED.finalized,
                codec_error = EXCLUDED.codec_error,
                timestamp = EXCLUDED.timestamp,
                indexed_at = EXCLUDED.indexed_at
            RETURNING (xmax = 0)
            "#
        ))
        .bind(to_i64(block.number, "block.number")?)
        .bind(&block.hash.0[..])
        .bind(&block.parent_hash.0[..])
        .bind(&block.state_root.0[..])
        .bind(&block.extrinsics_root.0[..])
        .bind(Json(&block.logs_raw))
        .bind(Json(&block.extrinsics_raw))
        .bind(&block.event_raw)
        .bind(block.extrinsics_count as i32)
        .bind(block.event_count as i32)
        .bind(block.spec_version as i32)
        .bind(block.validator.as_ref().map(|v| &v.0[..]))
        .bind(block.finalized)
        .bind(block.codec_error)
        .bind(block.timestamp)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_error)?;

        Ok(if created {
            PersistOutcome::Created
        } else {
            PersistOutcome::Updated
        })
    }
}

#[async_trait]
impl BlockStore for PgBlockStore {
    async fn get_block(&self, number: u64) -> StorageResult<Option<Block>> {
        if !self.shard_exists(number).await? {
            return Ok(None);
        }

        let table = sharded_table("blocks", number);
        let row = sqlx::query_as::<_, BlockRow>(&format!(
            "SELECT {BLOCK_COLUMNS} FROM {table} WHERE number = $1"
        ))
        .bind(to_i64(number, "block.number")?)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(BlockRow::into_block).transpose()
    }

    async fn nearest_spec_version(&self, number: u64) -> StorageResult<Option<u32>> {
        for shard in shards_in(&(0..=number)) {
            let first = shard * SHARD_SIZE;
            if !self.shard_exists(first).await? {
                continue;
            }

            let table = sharded_table("blocks", first);
            let row: Option<(i32,)> = sqlx::query_as(&format!(
                "SELECT spec_version FROM {table} WHERE number <= $1 ORDER BY number DESC LIMIT 1"
            ))
            .bind(to_i64(number, "block.number")?)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

            if let Some((spec,)) = row {
                return Ok(Some(spec as u32));
            }
        }
        Ok(None)
    }

    async fn block_counts(&self, range: RangeInclusive<u64>) -> StorageResult<Vec<BlockCounts>> {
        let mut counts = Vec::new();
        for shard in shards_in(&range) {
            let first = shard * SHARD_SIZE;
            if !self.shard_exists(first).await? {
                continue;
            }

            let table = sharded_table("blocks", first);
            let rows = sqlx::query_as::<_, BlockCountsRow>(&format!(
                "SELECT number, extrinsics_count, event_count FROM {table} \
                 WHERE number BETWEEN $1 AND $2 ORDER BY number"
            ))
            .bind(to_i64(*range.start(), "range.start")?)
            .bind(to_i64(*range.end(), "range.end")?)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

            counts.extend(rows.into_iter().map(BlockCounts::from));
        }
        counts.sort_by_key(|c| c.number);
        Ok(counts)
    }

    #[instrument(skip_all, fields(block = data.block.number))]
    async fn persist_block(&self, data: &BlockData) -> StorageResult<PersistOutcome> {
        let number = data.block.number;
        self.ensure_shard(number).await?;

        let blocks = sharded_table("blocks", number);
        let extrinsics = sharded_table("extrinsics", number);
        let events = sharded_table("events", number);
        let logs = sharded_table("logs", number);
        let key = to_i64(number, "block.number")?;

        let mut tx = self.pool.begin().await.map_err(tx_error)?;

        // Children of a previous attempt are replaced wholesale
        for table in [&extrinsics, &events, &logs] {
            sqlx::query(&format!("DELETE FROM {table} WHERE block_number = $1"))
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
        }

        for ext in &data.extrinsics {
            Self::insert_extrinsic(&mut tx, &extrinsics, ext).await?;
        }
        for event in &data.events {
            Self::insert_event(&mut tx, &events, event).await?;
        }
        for log in &data.logs {
            Self::insert_log(&mut tx, &logs, log).await?;
        }

        let outcome = Self::upsert_block(&mut tx, &blocks, &data.block).await?;

        tx.commit().await.map_err(tx_error)?;

        debug!(
            extrinsics = data.extrinsics.len(),
            events = data.events.len(),
            logs = data.logs.len(),
            ?outcome,
            "Block persisted"
        );
        Ok(outcome)
    }

    async fn extrinsics(&self, block_number: u64) -> StorageResult<Vec<Extrinsic>> {
        if !self.shard_exists(block_number).await? {
            return Ok(Vec::new());
        }

        let table = sharded_table("extrinsics", block_number);
        let rows = sqlx::query_as::<_, ExtrinsicRow>(&format!(
            "SELECT {EXTRINSIC_COLUMNS} FROM {table} WHERE block_number = $1 ORDER BY index"
        ))
        .bind(to_i64(block_number, "block.number")?)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(ExtrinsicRow::into_extrinsic).collect()
    }

    async fn events(&self, block_number: u64) -> StorageResult<Vec<Event>> {
        if !self.shard_exists(block_number).await? {
            return Ok(Vec::new());
        }

        let table = sharded_table("events", block_number);
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM {table} WHERE block_number = $1 ORDER BY index"
        ))
        .bind(to_i64(block_number, "block.number")?)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    async fn runtime_versions(&self) -> StorageResult<Vec<RuntimeVersion>> {
        let rows = sqlx::query_as::<_, RuntimeVersionRow>(
            "SELECT spec_version, impl_name, modules, raw_metadata \
             FROM runtime_versions ORDER BY spec_version",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.into_iter().map(RuntimeVersion::from).collect())
    }

    async fn insert_runtime_version(&self, version: &RuntimeVersion) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO runtime_versions (spec_version, impl_name, modules, raw_metadata)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (spec_version) DO NOTHING
            "#,
        )
        .bind(version.spec_version as i32)
        .bind(&version.impl_name)
        .bind(&version.modules)
        .bind(&version.raw_metadata)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn set_runtime_metadata(
        &self,
        spec_version: u32,
        raw: &str,
        modules: &[String],
    ) -> StorageResult<()> {
        sqlx::query(
            "UPDATE runtime_versions SET raw_metadata = $2, modules = $3 WHERE spec_version = $1",
        )
        .bind(spec_version as i32)
        .bind(raw)
        .bind(modules)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }
}
