//! Connection pool, embedded migrations and network purge.

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, instrument};

use chainsight_core::error::{StorageError, StorageResult};

use super::helpers::db_error;

/// Default connection URL when none is configured.
pub const DEFAULT_DATABASE_URL: &str = "postgres://localhost/chainsight";

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Minimum number of connections to maintain.
    pub min_connections: u32,
    /// Connection acquisition timeout.
    pub acquire_timeout: Duration,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    /// Maximum connection lifetime.
    pub max_lifetime: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: 20,
            min_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DatabaseConfig {
    /// Pool sized for the live subscriber or the plugin loop.
    ///
    /// `workers` is the size of the worker pool sharing the connections.
    pub fn for_indexer(url: &str, workers: usize) -> Self {
        Self {
            url: url.to_string(),
            max_connections: (workers as u32).saturating_add(4),
            min_connections: 3,
            ..Default::default()
        }
    }

    /// Pool sized for a repair run (block workers plus plugin workers).
    pub fn for_repair(url: &str, workers: usize) -> Self {
        Self {
            url: url.to_string(),
            max_connections: (workers as u32).saturating_add(4),
            min_connections: 4,
            acquire_timeout: Duration::from_secs(60),
            ..Default::default()
        }
    }

    /// Small pool for one-shot commands.
    pub fn for_maintenance(url: &str) -> Self {
        Self {
            url: url.to_string(),
            max_connections: 2,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            max_lifetime: Duration::from_secs(300),
        }
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the database with the given configuration.
    #[instrument(skip_all)]
    pub async fn connect(config: &DatabaseConfig) -> StorageResult<Self> {
        debug!(
            max_conn = config.max_connections,
            min_conn = config.min_connections,
            "Creating connection pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.url)
            .await
            .map_err(|e| StorageError::ConnectionError(e.to_string()))?;

        debug!("Connection pool created");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded schema migrations.
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> StorageResult<()> {
        debug!("Running migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::MigrationError(e.to_string()))?;

        debug!("Migrations completed");

        Ok(())
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Every existing physical table of the sharded entities.
    pub async fn shard_tables(&self) -> StorageResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT table_name::TEXT FROM information_schema.tables
            WHERE table_schema = current_schema()
              AND table_name ~ '^(blocks|extrinsics|events|logs)(_[0-9]+)?$'
            ORDER BY table_name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    /// Tables owned by plugins that have applied at least one migration.
    pub async fn plugin_tables(&self) -> StorageResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT t.table_name::TEXT FROM information_schema.tables t
            JOIN plugin_migrations m
              ON t.table_name LIKE replace(m.plugin, '_', '\_') || '\_%'
            WHERE t.table_schema = current_schema()
              AND t.table_type = 'BASE TABLE'
            ORDER BY 1
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    /// Purge all indexed data for one network.
    ///
    /// This operation:
    /// - Truncates every block shard and every plugin table
    /// - Deletes the network's counters, metadata, missing set and heartbeats
    /// - Preserves the schema, runtime versions and migration tracking
    #[instrument(skip(self))]
    pub async fn purge(&self, network: &str) -> StorageResult<PurgeStats> {
        debug!("Starting database purge");

        let shards = self.shard_tables().await?;
        let plugin_tables = self.plugin_tables().await?;

        let mut stats = PurgeStats {
            shard_tables: shards.len(),
            plugin_tables: plugin_tables.len(),
            ..Default::default()
        };

        for table in &shards {
            let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&self.pool)
                .await
                .map_err(db_error)?;
            let count = count as u64;
            if table.starts_with("blocks") {
                stats.blocks_removed += count;
            } else if table.starts_with("extrinsics") {
                stats.extrinsics_removed += count;
            } else if table.starts_with("events") {
                stats.events_removed += count;
            }
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;

        for table in shards.iter().chain(&plugin_tables) {
            sqlx::raw_sql(&format!("TRUNCATE {table}"))
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            debug!(table = %table, "Truncated");
        }

        for table in ["chain_metadata", "missing_blocks", "daemon_heartbeats"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE network = $1"))
                .bind(network)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;

        debug!("Database purge completed");

        Ok(stats)
    }
}

/// Statistics from a database purge operation.
#[derive(Debug, Clone, Default)]
pub struct PurgeStats {
    /// Number of blocks removed.
    pub blocks_removed: u64,
    /// Number of extrinsics removed.
    pub extrinsics_removed: u64,
    /// Number of events removed.
    pub events_removed: u64,
    /// Block shard tables truncated (4 per shard).
    pub shard_tables: usize,
    /// Plugin tables truncated.
    pub plugin_tables: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_sizes_follow_worker_counts() {
        let live = DatabaseConfig::for_indexer("postgres://x/y", 10);
        assert_eq!(live.max_connections, 14);
        assert_eq!(live.url, "postgres://x/y");

        let repair = DatabaseConfig::for_repair("postgres://x/y", 16 + 8);
        assert_eq!(repair.max_connections, 28);

        assert_eq!(DatabaseConfig::for_maintenance("postgres://x/y").max_connections, 2);
    }
}
