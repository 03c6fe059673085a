//! PostgreSQL storage adapter.
//!
//! This module implements the storage ports defined in `chainsight-core`
//! using PostgreSQL as the backing store.
//!
//! # Architecture
//!
//! - [`Database`] - Connection pool, migrations and purge
//! - [`PgBlockStore`] - Sharded blocks, extrinsics, events, logs and runtime versions
//! - [`PgMetadataStore`] - Network-scoped counters, missing-block set and heartbeats
//! - [`PgPluginStores`] - Prefixed, DDL-guarded stores handed to plugins
//!
//! # Usage
//!
//! ```ignore
//! let config = DatabaseConfig::for_indexer(&database_url, 10);
//! let db = Database::connect(&config).await?;
//! db.migrate().await?;
//!
//! let blocks = Arc::new(PgBlockStore::new(&db));
//! let meta = Arc::new(PgMetadataStore::new(&db, "polkadot"));
//! ```

mod block_store;
mod database;
mod helpers;
mod metadata_store;
mod plugin_store;
mod rows;

pub use block_store::{PgBlockStore, SHARDED_TABLES};
pub use database::{DEFAULT_DATABASE_URL, Database, DatabaseConfig, PurgeStats};
pub use metadata_store::PgMetadataStore;
pub use plugin_store::{PgPluginStore, PgPluginStores, check_ddl, is_protected_table, render_ddl};
