//! Plugin registry and dispatcher.
//!
//! Plugins are registered once at startup through [`PluginRegistryBuilder`].
//! The resulting [`PluginRegistry`] maps lowercased module names to the
//! plugins subscribed to them and is immutable afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, instrument, trace, warn};

use crate::error::{DomainError, IndexerError, IndexerResult, PluginResult};
use crate::metrics::record_plugin_error;
use crate::models::group_by_extrinsic;
use crate::ports::{BlockStore, Plugin, PluginStore, PluginStoreProvider};

// =============================================================================
// Registry
// =============================================================================

pub struct PluginRegistryBuilder {
    provider: Arc<dyn PluginStoreProvider>,
    plugins: Vec<(Arc<dyn Plugin>, Arc<dyn PluginStore>)>,
    names: HashSet<String>,
}

impl PluginRegistryBuilder {
    pub fn new(provider: Arc<dyn PluginStoreProvider>) -> Self {
        Self {
            provider,
            plugins: Vec::new(),
            names: HashSet::new(),
        }
    }

    /// Register a plugin and hand it its prefixed store.
    ///
    /// Names are compared lowercased; a second plugin with the same name
    /// is ignored. Returns whether the plugin was added.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> bool {
        let name = plugin.name().to_lowercase();
        if !self.names.insert(name.clone()) {
            warn!(plugin = %name, "⚠️  Plugin already registered, ignoring");
            return false;
        }

        let store = self.provider.store_for(&name);
        plugin.init(store.clone());
        debug!(plugin = %name, version = plugin.version(), "Plugin registered");
        self.plugins.push((plugin, store));
        true
    }

    pub fn build(self) -> PluginRegistry {
        let mut by_extrinsic: HashMap<String, Vec<Arc<dyn Plugin>>> = HashMap::new();
        let mut by_event: HashMap<String, Vec<Arc<dyn Plugin>>> = HashMap::new();

        for (plugin, _) in &self.plugins {
            for module in plugin.subscribe_extrinsic() {
                by_extrinsic
                    .entry(module.to_lowercase())
                    .or_default()
                    .push(plugin.clone());
            }
            for module in plugin.subscribe_event() {
                by_event
                    .entry(module.to_lowercase())
                    .or_default()
                    .push(plugin.clone());
            }
        }

        PluginRegistry {
            plugins: self.plugins,
            by_extrinsic,
            by_event,
        }
    }
}

/// Immutable module → plugins tables.
pub struct PluginRegistry {
    plugins: Vec<(Arc<dyn Plugin>, Arc<dyn PluginStore>)>,
    by_extrinsic: HashMap<String, Vec<Arc<dyn Plugin>>>,
    by_event: HashMap<String, Vec<Arc<dyn Plugin>>>,
}

impl PluginRegistry {
    /// Plugins subscribed to extrinsics of `module` (case-insensitive).
    pub fn extrinsic_plugins(&self, module: &str) -> &[Arc<dyn Plugin>] {
        self.by_extrinsic
            .get(&module.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Plugins subscribed to events of `module` (case-insensitive).
    pub fn event_plugins(&self, module: &str) -> &[Arc<dyn Plugin>] {
        self.by_event
            .get(&module.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|(p, _)| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Apply every plugin's DDL migrations.
    #[instrument(skip_all)]
    pub async fn run_migrations(&self) -> IndexerResult<()> {
        for (plugin, store) in &self.plugins {
            for (index, ddl) in plugin.migrations().iter().enumerate() {
                store.apply_migration(index, ddl).await?;
            }
            debug!(
                plugin = plugin.name(),
                migrations = plugin.migrations().len(),
                "Plugin migrations applied"
            );
        }
        info!(plugins = self.plugins.len(), "📦 Plugin schemas ready");
        Ok(())
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Delivery counts for one dispatched block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: usize,
    /// Deliveries the plugin had already recorded.
    pub duplicates: usize,
}

pub struct PluginDispatcher {
    registry: Arc<PluginRegistry>,
    blocks: Arc<dyn BlockStore>,
}

impl PluginDispatcher {
    pub fn new(registry: Arc<PluginRegistry>, blocks: Arc<dyn BlockStore>) -> Self {
        Self { registry, blocks }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Replay a stored, finalized block to every subscribed plugin.
    ///
    /// Duplicate-key errors are counted and skipped; any other plugin
    /// error aborts the block so it can be re-attempted.
    #[instrument(skip(self), fields(block = number))]
    pub async fn dispatch_block(&self, number: u64) -> IndexerResult<DispatchStats> {
        let block = self
            .blocks
            .get_block(number)
            .await?
            .ok_or(DomainError::BlockNotFound(number))?;
        if !block.finalized {
            return Err(DomainError::ValidationError(format!(
                "block {number} is not finalized"
            ))
            .into());
        }

        let extrinsics = self.blocks.extrinsics(number).await?;
        let events = self.blocks.events(number).await?;
        let by_extrinsic = group_by_extrinsic(&events);
        let fees: HashMap<u32, u128> = extrinsics.iter().map(|e| (e.index, e.fee)).collect();

        let mut stats = DispatchStats::default();

        for extrinsic in &extrinsics {
            let emitted = by_extrinsic
                .get(&extrinsic.index)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for plugin in self.registry.extrinsic_plugins(&extrinsic.call_module) {
                let result = plugin.process_extrinsic(&block, extrinsic, emitted).await;
                tally(&mut stats, plugin.name(), number, result)?;
            }
        }

        for event in &events {
            let fee = event
                .extrinsic_index()
                .and_then(|idx| fees.get(&idx).copied())
                .unwrap_or(0);
            for plugin in self.registry.event_plugins(&event.module_id) {
                let result = plugin.process_event(&block, event, fee).await;
                tally(&mut stats, plugin.name(), number, result)?;
            }
        }

        trace!(
            delivered = stats.delivered,
            duplicates = stats.duplicates,
            "Block dispatched"
        );
        Ok(stats)
    }
}

fn tally(
    stats: &mut DispatchStats,
    plugin: &str,
    block: u64,
    result: PluginResult<()>,
) -> IndexerResult<()> {
    match result {
        Ok(()) => {
            stats.delivered += 1;
            Ok(())
        }
        Err(e) if e.is_duplicate_key() => {
            trace!(plugin, block, "Record already processed");
            stats.duplicates += 1;
            Ok(())
        }
        Err(e) => {
            record_plugin_error(plugin);
            Err(IndexerError::Plugin {
                plugin: plugin.to_string(),
                block,
                source: e,
            })
        }
    }
}
