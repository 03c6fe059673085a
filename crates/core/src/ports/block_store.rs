//! Port trait for sharded block storage.
//!
//! Implementations live in the infrastructure layer (e.g., `chainsight-storage`).

use async_trait::async_trait;
use std::ops::RangeInclusive;

use crate::error::StorageResult;
use crate::models::{Block, BlockCounts, BlockData, Event, Extrinsic, RuntimeVersion};

/// Whether a persist created the block row or overwrote an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Created,
    Updated,
}

/// Storage for blocks, extrinsics, events, logs and runtime versions.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Get block by number.
    async fn get_block(&self, number: u64) -> StorageResult<Option<Block>>;

    /// Spec version of the highest persisted block at or below `number`.
    async fn nearest_spec_version(&self, number: u64) -> StorageResult<Option<u32>>;

    /// Persisted counts for every block row in the range.
    ///
    /// Blocks without a row are absent from the result.
    async fn block_counts(&self, range: RangeInclusive<u64>) -> StorageResult<Vec<BlockCounts>>;

    /// Write a block and all of its children in one transaction.
    ///
    /// Existing extrinsic, event and log rows for the block number are
    /// deleted first; the block row is upserted last.
    async fn persist_block(&self, data: &BlockData) -> StorageResult<PersistOutcome>;

    /// Extrinsics of a block, ordered by index.
    async fn extrinsics(&self, block_number: u64) -> StorageResult<Vec<Extrinsic>>;

    /// Events of a block, ordered by index.
    async fn events(&self, block_number: u64) -> StorageResult<Vec<Event>>;

    /// All known runtime versions.
    async fn runtime_versions(&self) -> StorageResult<Vec<RuntimeVersion>>;

    /// Insert a runtime version; a no-op if the spec version exists.
    async fn insert_runtime_version(&self, version: &RuntimeVersion) -> StorageResult<()>;

    /// Back-fill raw metadata and module list for a spec version.
    async fn set_runtime_metadata(
        &self,
        spec_version: u32,
        raw: &str,
        modules: &[String],
    ) -> StorageResult<()>;
}
