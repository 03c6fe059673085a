//! Port traits for plugins.
//!
//! This is the main extensibility point for the indexer. A plugin
//! subscribes to module names and receives every decoded extrinsic or
//! event of those modules once the block is durably stored.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{PluginResult, StorageResult};
use crate::models::{Block, Event, Extrinsic};

/// Storage handle scoped to one plugin.
///
/// Tables are namespaced as `{prefix}_{name}`; the shared chain tables
/// are protected from plugin DDL.
#[async_trait]
pub trait PluginStore: Send + Sync {
    /// Namespace of this plugin's tables.
    fn prefix(&self) -> &str;

    /// Fully qualified table name.
    fn table(&self, name: &str) -> String {
        format!("{}_{}", self.prefix(), name)
    }

    /// Apply one DDL migration if it has not been applied yet.
    ///
    /// The `{prefix}` placeholder in `ddl` is replaced by the plugin prefix.
    async fn apply_migration(&self, index: usize, ddl: &str) -> StorageResult<()>;

    /// Insert one row given as a JSON object keyed by column name.
    ///
    /// `table` is a fully qualified name as returned by [`PluginStore::table`].
    async fn insert(&self, table: &str, row: serde_json::Value) -> StorageResult<()>;
}

/// Hands out plugin-scoped stores.
pub trait PluginStoreProvider: Send + Sync {
    fn store_for(&self, plugin: &str) -> Arc<dyn PluginStore>;
}

/// A domain-specific processor of decoded records.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique plugin name; also the table prefix.
    fn name(&self) -> &'static str;

    fn version(&self) -> &'static str {
        "0.1"
    }

    /// Receive the plugin's storage handle. Called once at registration.
    fn init(&self, store: Arc<dyn PluginStore>);

    /// DDL templates, applied in order, using the `{prefix}` placeholder.
    fn migrations(&self) -> &'static [&'static str] {
        &[]
    }

    /// Module names whose extrinsics this plugin receives.
    fn subscribe_extrinsic(&self) -> &'static [&'static str] {
        &[]
    }

    /// Module names whose events this plugin receives.
    fn subscribe_event(&self) -> &'static [&'static str] {
        &[]
    }

    /// Process an extrinsic together with the events it emitted.
    async fn process_extrinsic(
        &self,
        _block: &Block,
        _extrinsic: &Extrinsic,
        _events: &[Event],
    ) -> PluginResult<()> {
        Ok(())
    }

    /// Process an event; `fee` is the fee of its emitting extrinsic, 0 if none.
    async fn process_event(&self, _block: &Block, _event: &Event, _fee: u128) -> PluginResult<()> {
        Ok(())
    }
}
