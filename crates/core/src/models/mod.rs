//! Domain models representing indexed blockchain data.
//!
//! These models are storage-agnostic and represent the canonical
//! form of indexed data within the domain layer.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// 32-byte Hash Types
// =============================================================================

/// Macro to generate 32-byte hash newtypes with common functionality.
///
/// Generates:
/// - `from_hex()` - Parse from hex string (with or without 0x prefix)
/// - `to_hex()` - Convert to 0x-prefixed hex string
/// - `Display` trait implementation
/// - `From<[u8; 32]>` implementation
macro_rules! hash32_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// Parse from hex string (with or without 0x prefix).
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let s = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(s)?;
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| hex::FromHexError::InvalidStringLength)?;
                Ok(Self(arr))
            }

            /// Convert to 0x-prefixed hex string.
            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }

            /// Get the inner bytes.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }
    };
}

hash32_newtype!(
    /// 32-byte block hash (Blake2-256).
    BlockHash
);

hash32_newtype!(
    /// 32-byte account identifier (SS58 decoded public key).
    AccountId
);

hash32_newtype!(
    /// 32-byte extrinsic hash (Blake2-256 of the encoded extrinsic).
    ExtrinsicHash
);

// =============================================================================
// Sharding
// =============================================================================

/// Number of blocks per physical table.
pub const SHARD_SIZE: u64 = 1_000_000;

/// Shard index holding `block_number`.
pub fn shard_of(block_number: u64) -> u64 {
    block_number / SHARD_SIZE
}

/// Physical table name for a sharded entity.
///
/// Shard 0 uses the bare table name so a fresh database works without
/// any shard bookkeeping; later shards get a numeric suffix.
pub fn sharded_table(base: &str, block_number: u64) -> String {
    match shard_of(block_number) {
        0 => base.to_string(),
        shard => format!("{base}_{shard}"),
    }
}

/// Composite record id: `"{block}-{position}"`.
pub fn record_id(block_number: u64, position: u32) -> String {
    format!("{block_number}-{position}")
}

// =============================================================================
// Block & Chain Data
// =============================================================================

/// Indexed block with all relevant metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Block number (height).
    pub number: u64,
    /// Block hash.
    pub hash: BlockHash,
    /// Parent block hash.
    pub parent_hash: BlockHash,
    /// State root after executing this block.
    pub state_root: BlockHash,
    /// Extrinsics root (merkle root of extrinsics).
    pub extrinsics_root: BlockHash,
    /// Raw digest logs as returned by the node.
    pub logs_raw: Vec<String>,
    /// Raw SCALE-encoded extrinsics (hex).
    pub extrinsics_raw: Vec<String>,
    /// Raw `System.Events` storage value (hex).
    pub event_raw: String,
    /// Number of extrinsics in this block.
    pub extrinsics_count: u32,
    /// Number of events in this block.
    pub event_count: u32,
    /// Runtime spec version used to decode the block.
    pub spec_version: u32,
    /// Block author, resolved from the pre-runtime digest.
    pub validator: Option<AccountId>,
    /// Whether the block was finalized when ingested.
    pub finalized: bool,
    /// Whether decoding or author resolution failed.
    pub codec_error: bool,
    /// Timestamp from `timestamp.set` (if available).
    pub timestamp: Option<DateTime<Utc>>,
}

impl Block {
    /// Whether the stored row can be treated as immutable.
    ///
    /// Such a block is never fetched from the node again.
    pub fn is_settled(&self) -> bool {
        self.finalized && !self.codec_error && self.extrinsics_count > 0 && self.event_count > 0
    }
}

/// Persisted extrinsic and event counts for one block.
///
/// Used by the repair engine to probe completeness without loading rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCounts {
    pub number: u64,
    pub extrinsics_count: u32,
    pub event_count: u32,
}

impl BlockCounts {
    /// A block with zero extrinsics or zero events is incomplete.
    pub fn is_complete(&self) -> bool {
        self.extrinsics_count > 0 && self.event_count > 0
    }
}

// =============================================================================
// Extrinsics
// =============================================================================

/// Indexed extrinsic (transaction or inherent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extrinsic {
    /// Unique identifier: block_number-extrinsic_index.
    pub id: String,
    /// Block number containing this extrinsic.
    pub block_number: u64,
    /// Index within the block (0-based).
    pub index: u32,
    /// Extrinsic hash (signed extrinsics only).
    pub hash: Option<ExtrinsicHash>,
    /// Module name of the call (e.g., "balances").
    pub call_module: String,
    /// Call name (e.g., "transfer_keep_alive").
    pub call_module_function: String,
    /// Signer account (None for unsigned/inherent).
    pub signer: Option<AccountId>,
    /// Signature (hex), if signed.
    pub signature: Option<String>,
    /// Nonce (if signed).
    pub nonce: Option<u64>,
    /// Tip paid (in smallest unit).
    pub tip: u128,
    /// Call arguments as JSON.
    pub params: serde_json::Value,
    /// False when a `system.ExtrinsicFailed` event was emitted for this index.
    pub success: bool,
    /// Partial fee reported by the node.
    pub fee: u128,
}

impl Extrinsic {
    pub fn is_signed(&self) -> bool {
        self.signer.is_some()
    }
}

// =============================================================================
// Events
// =============================================================================

/// Phase of block execution in which an event was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPhase {
    ApplyExtrinsic(u32),
    Finalization,
    Initialization,
}

impl EventPhase {
    /// Index of the emitting extrinsic, if any.
    pub fn extrinsic_index(&self) -> Option<u32> {
        match self {
            EventPhase::ApplyExtrinsic(idx) => Some(*idx),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventPhase::ApplyExtrinsic(_) => "ApplyExtrinsic",
            EventPhase::Finalization => "Finalization",
            EventPhase::Initialization => "Initialization",
        }
    }

    /// Rebuild a phase from its stored name and extrinsic index.
    pub fn from_parts(name: &str, extrinsic_index: Option<u32>) -> Self {
        match (name, extrinsic_index) {
            ("Finalization", _) => EventPhase::Finalization,
            ("Initialization", _) => EventPhase::Initialization,
            (_, Some(idx)) => EventPhase::ApplyExtrinsic(idx),
            (_, None) => EventPhase::Initialization,
        }
    }
}

/// Indexed event emitted during block execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier: block_number-event_index.
    pub id: String,
    /// Block number containing this event.
    pub block_number: u64,
    /// Index within the block (0-based).
    pub index: u32,
    /// Execution phase.
    pub phase: EventPhase,
    /// Module name (e.g., "balances").
    pub module_id: String,
    /// Event variant name (e.g., "Transfer").
    pub event_id: String,
    /// Event data as JSON.
    pub params: serde_json::Value,
    /// Hash of the emitting extrinsic, if it has one.
    pub extrinsic_hash: Option<ExtrinsicHash>,
}

impl Event {
    pub fn extrinsic_index(&self) -> Option<u32> {
        self.phase.extrinsic_index()
    }

    /// Whether this is `system.ExtrinsicFailed` (case-insensitive).
    pub fn is_extrinsic_failed(&self) -> bool {
        self.module_id.eq_ignore_ascii_case("system")
            && self.event_id.eq_ignore_ascii_case("ExtrinsicFailed")
    }
}

/// Group events by the index of the extrinsic that emitted them.
///
/// Events outside the `ApplyExtrinsic` phase are left out. Within a group
/// events keep their block order.
pub fn group_by_extrinsic(events: &[Event]) -> HashMap<u32, Vec<Event>> {
    let mut map: HashMap<u32, Vec<Event>> = HashMap::new();
    for event in events {
        if let Some(idx) = event.extrinsic_index() {
            map.entry(idx).or_default().push(event.clone());
        }
    }
    map
}

/// Whether the extrinsic at `index` succeeded, given the grouped events.
pub fn extrinsic_succeeded(index: u32, events: &HashMap<u32, Vec<Event>>) -> bool {
    events
        .get(&index)
        .is_none_or(|evs| !evs.iter().any(Event::is_extrinsic_failed))
}

// =============================================================================
// Logs
// =============================================================================

/// Digest log entry of a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    /// Unique identifier: block_number-log_index.
    pub id: String,
    pub block_number: u64,
    pub index: u32,
    /// Digest item kind ("PreRuntime", "Seal", ...).
    pub log_type: String,
    /// Decoded item value.
    pub data: serde_json::Value,
    pub finalized: bool,
}

// =============================================================================
// Runtime Versions
// =============================================================================

/// A runtime spec version seen on chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeVersion {
    pub spec_version: u32,
    /// Runtime implementation name reported by the node.
    pub impl_name: String,
    /// Module (pallet) names present in this runtime.
    pub modules: Vec<String>,
    /// Hex-encoded SCALE metadata, back-filled once fetched.
    pub raw_metadata: Option<String>,
}

/// Metadata handed to the decoder for one spec version.
#[derive(Debug, Clone)]
pub struct RuntimeMetadata {
    pub spec_version: u32,
    /// Hex-encoded SCALE metadata blob.
    pub raw: Arc<str>,
}

// =============================================================================
// Decoder Output
// =============================================================================

/// An extrinsic as produced by the decoder, before fee/success derivation.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedExtrinsic {
    pub index: u32,
    pub hash: Option<ExtrinsicHash>,
    pub call_module: String,
    pub call_module_function: String,
    pub signer: Option<AccountId>,
    pub signature: Option<String>,
    pub nonce: Option<u64>,
    pub tip: u128,
    pub params: serde_json::Value,
}

/// An event as produced by the decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub index: u32,
    pub phase: EventPhase,
    pub module_id: String,
    pub event_id: String,
    pub params: serde_json::Value,
}

/// A digest log as produced by the decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLog {
    pub index: u32,
    pub log_type: String,
    pub data: serde_json::Value,
    /// Engine id and payload when the item is a `PreRuntime` digest.
    pub pre_runtime: Option<([u8; 4], Vec<u8>)>,
}

/// Everything written for one block in a single transaction.
#[derive(Debug, Clone)]
pub struct BlockData {
    pub block: Block,
    pub extrinsics: Vec<Extrinsic>,
    pub events: Vec<Event>,
    pub logs: Vec<Log>,
}

// =============================================================================
// Tests
// =============================================================================
