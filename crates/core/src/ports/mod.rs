mod block_store;
mod chain;
mod decoder;
mod metadata_store;
mod plugin;

pub use block_store::*;
pub use chain::*;
pub use decoder::*;
pub use metadata_store::*;
pub use plugin::*;
