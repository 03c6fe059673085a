//! # Chainsight Storage
//!
//! PostgreSQL adapters for the `chainsight-core` storage ports.

pub mod postgres;

pub use postgres::{
    Database, DatabaseConfig, PgBlockStore, PgMetadataStore, PgPluginStores, PurgeStats,
};
