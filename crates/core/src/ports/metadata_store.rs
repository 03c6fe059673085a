//! Port trait for network-scoped counters, metadata and the missing-block set.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::error::StorageResult;

/// Well-known counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Best head reported by the node.
    BestBlock,
    /// Finalized head reported by the node.
    FinalizedBlock,
    /// Highest block number ever persisted.
    FillAlready,
    /// Highest contiguously persisted finalized block.
    FillFinalized,
    /// Highest contiguously dispatched block for plugins.
    PluginsFinalized,
}

impl Counter {
    pub fn key(&self) -> &'static str {
        match self {
            Counter::BestBlock => "blockNum",
            Counter::FinalizedBlock => "finalized_blockNum",
            Counter::FillAlready => "FillAlreadyBlockNum",
            Counter::FillFinalized => "FillFinalizedBlockNum",
            Counter::PluginsFinalized => "plugins:finalized_blockNum",
        }
    }

    pub const ALL: [Counter; 5] = [
        Counter::BestBlock,
        Counter::FinalizedBlock,
        Counter::FillAlready,
        Counter::FillFinalized,
        Counter::PluginsFinalized,
    ];
}

/// Metadata fields.
pub mod meta {
    pub const IMPL_NAME: &str = "implName";
    pub const SPEC_VERSION: &str = "specVersion";
    pub const COUNT_EXTRINSIC: &str = "count_extrinsic";
    pub const COUNT_EVENT: &str = "count_event";
}

/// Long-running processes that write heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Daemon {
    Substrate,
    Plugins,
    Repair,
}

impl Daemon {
    pub fn as_str(&self) -> &'static str {
        match self {
            Daemon::Substrate => "substrate",
            Daemon::Plugins => "plugins",
            Daemon::Repair => "repair",
        }
    }

    pub const ALL: [Daemon; 3] = [Daemon::Substrate, Daemon::Plugins, Daemon::Repair];
}

/// A daemon whose last heartbeat is older than this is considered down.
pub const DAEMON_ALIVE_WINDOW_SECS: i64 = 60;

/// Whether a heartbeat written at `last` is recent enough at `now`.
pub fn is_alive(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    last.is_some_and(|beat| now - beat < TimeDelta::seconds(DAEMON_ALIVE_WINDOW_SECS))
}

/// Key/value state scoped to one network.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Current counter value, 0 when unset.
    async fn counter(&self, counter: Counter) -> StorageResult<u64>;

    /// Overwrite a counter.
    async fn set_counter(&self, counter: Counter, value: u64) -> StorageResult<()>;

    /// Raise a counter to `value` if it is currently lower.
    ///
    /// Returns the value after the update.
    async fn advance_counter(&self, counter: Counter, value: u64) -> StorageResult<u64>;

    async fn set_metadata(&self, key: &str, value: &str) -> StorageResult<()>;

    async fn metadata(&self, key: &str) -> StorageResult<Option<String>>;

    /// Add `by` to a numeric metadata field.
    async fn increment_metadata(&self, key: &str, by: u64) -> StorageResult<()>;

    async fn add_missing(&self, block_number: u64) -> StorageResult<()>;

    async fn remove_missing(&self, block_number: u64) -> StorageResult<()>;

    /// Missing block numbers, ascending.
    async fn missing_blocks(&self) -> StorageResult<Vec<u64>>;

    async fn heartbeat(&self, daemon: Daemon) -> StorageResult<()>;

    async fn last_heartbeat(&self, daemon: Daemon) -> StorageResult<Option<DateTime<Utc>>>;
}
