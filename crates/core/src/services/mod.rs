//! Core services: ingestion, catch-up, subscription, repair and plugin dispatch.

mod catchup;
mod dispatcher;
mod ingest;
mod pool;
mod repair;
mod runtime;
mod subscriber;

#[cfg(test)]
pub(crate) mod testing;

pub use catchup::*;
pub use dispatcher::*;
pub use ingest::*;
pub use pool::*;
pub use repair::*;
pub use runtime::*;
pub use subscriber::*;
