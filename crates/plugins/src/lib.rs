//! Built-in plugins for the chainsight indexer.
//!
//! Each plugin implements [`Plugin`] and owns the tables under its name
//! prefix:
//!
//! - [`transfers`] - balance transfer calls (`transfers_transfers`)
//! - [`bond`] - staking bond/unbond calls (`bond_bonds`)
//! - [`reward`] - staking rewards and slashes (`reward_rewards`)
//! - [`system`] - failed extrinsics (`system_extrinsic_errors`)
//!
//! # Writing a Plugin
//!
//! ```ignore
//! use chainsight_core::ports::{Plugin, PluginStore};
//!
//! #[derive(Default)]
//! pub struct MyPlugin {
//!     store: OnceLock<Arc<dyn PluginStore>>,
//! }
//!
//! #[async_trait]
//! impl Plugin for MyPlugin {
//!     fn name(&self) -> &'static str { "my_plugin" }
//!
//!     fn init(&self, store: Arc<dyn PluginStore>) {
//!         let _ = self.store.set(store);
//!     }
//!
//!     fn migrations(&self) -> &'static [&'static str] {
//!         &["CREATE TABLE IF NOT EXISTS {prefix}_things (id TEXT PRIMARY KEY)"]
//!     }
//!
//!     fn subscribe_event(&self) -> &'static [&'static str] {
//!         &["balances"]
//!     }
//!
//!     async fn process_event(&self, block: &Block, event: &Event, fee: u128) -> PluginResult<()> {
//!         // ...
//!     }
//! }
//! ```
//!
//! # Registering Plugins
//!
//! ```ignore
//! let mut builder = PluginRegistryBuilder::new(Arc::new(PgPluginStores::new(&db)));
//! for plugin in chainsight_plugins::builtin_plugins() {
//!     builder.register(plugin);
//! }
//! let registry = builder.build();
//! registry.run_migrations().await?;
//! ```

pub mod bond;
pub mod reward;
pub mod system;
pub mod transfers;

mod utils;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use chainsight_core::ports::Plugin;

pub use bond::BondPlugin;
pub use reward::RewardPlugin;
pub use system::SystemPlugin;
pub use transfers::TransfersPlugin;

/// Every built-in plugin, in registration order.
pub fn builtin_plugins() -> Vec<Arc<dyn Plugin>> {
    vec![
        Arc::new(TransfersPlugin::new()),
        Arc::new(BondPlugin::new()),
        Arc::new(RewardPlugin::new()),
        Arc::new(SystemPlugin::new()),
    ]
}
