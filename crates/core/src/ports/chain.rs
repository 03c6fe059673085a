//! Port trait for the chain node.
//!
//! This trait defines the request/response and subscription surface the
//! indexer consumes from a Substrate node. Implementations live in the
//! infrastructure layer (e.g., `chainsight-substrate`).

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::error::ChainResult;
use crate::models::{AccountId, BlockHash};

/// Header fields of a block as returned by `chain_getBlock`.
#[derive(Debug, Clone)]
pub struct ChainHeader {
    pub number: u64,
    pub parent_hash: BlockHash,
    pub state_root: BlockHash,
    pub extrinsics_root: BlockHash,
    /// Hex-encoded digest items.
    pub digest_logs: Vec<String>,
}

/// A block body as returned by the node.
#[derive(Debug, Clone)]
pub struct ChainBlock {
    pub header: ChainHeader,
    /// Hex-encoded extrinsics.
    pub extrinsics: Vec<String>,
}

/// Runtime version reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeVersionInfo {
    pub spec_version: u32,
    pub impl_name: String,
}

/// Notification delivered on the head subscription stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainNotification {
    /// Reply to (or update of) the runtime version subscription.
    RuntimeVersion(RuntimeVersionInfo),
    /// New best head.
    NewHead(u64),
    /// New finalized head.
    FinalizedHead(u64),
}

/// Stream of head notifications. Items are errors on frame/decode failures;
/// the stream ends when the transport closes.
pub type NotificationStream = Pin<Box<dyn Stream<Item = ChainResult<ChainNotification>> + Send>>;

/// Chain node client.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Canonical hash for a block number, `None` if the node does not know it.
    async fn block_hash(&self, number: u64) -> ChainResult<Option<BlockHash>>;

    /// Block header and raw extrinsics.
    async fn block(&self, hash: &BlockHash) -> ChainResult<Option<ChainBlock>>;

    /// Raw storage value (hex) at a block.
    async fn storage(&self, key: &str, at: &BlockHash) -> ChainResult<Option<String>>;

    /// Runtime version at a block, or the latest one when `at` is `None`.
    async fn runtime_version(&self, at: Option<&BlockHash>)
    -> ChainResult<Option<RuntimeVersionInfo>>;

    /// Hex-encoded runtime metadata at a block.
    async fn metadata(&self, at: &BlockHash) -> ChainResult<String>;

    /// Partial fee of an encoded extrinsic, evaluated at a block.
    async fn query_fee(&self, extrinsic_hex: &str, at: &BlockHash) -> ChainResult<u128>;

    /// Session validator set at a block.
    async fn validators(&self, at: &BlockHash) -> ChainResult<Vec<AccountId>>;

    /// Liveness probe (`system_health`).
    async fn health(&self) -> ChainResult<()>;

    /// Open the runtime-version, new-head and finalized-head subscriptions
    /// and merge them into one stream.
    async fn subscribe(&self) -> ChainResult<NotificationStream>;

    /// Tear down and re-establish the transport.
    async fn reconnect(&self) -> ChainResult<()>;

    /// Whether the transport currently reports a live connection.
    fn is_connected(&self) -> bool;
}
