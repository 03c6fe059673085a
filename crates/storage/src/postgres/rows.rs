//! Database row representations and their domain conversions.

use chrono::{DateTime, Utc};
use sqlx::types::Json;

use chainsight_core::error::StorageResult;
use chainsight_core::models::{
    AccountId, Block, BlockCounts, BlockHash, Event, EventPhase, Extrinsic, ExtrinsicHash,
    RuntimeVersion,
};

use super::helpers::{bytes_to_hash32, bytes_to_optional_hash32, parse_u128};

pub(crate) const BLOCK_COLUMNS: &str = "number, hash, parent_hash, state_root, extrinsics_root, \
     logs_raw, extrinsics_raw, event_raw, extrinsics_count, event_count, spec_version, \
     validator, finalized, codec_error, timestamp";

pub(crate) const EXTRINSIC_COLUMNS: &str = "id, block_number, index, hash, call_module, \
     call_module_function, signer, signature, nonce, tip::TEXT AS tip, params, success, \
     fee::TEXT AS fee";

pub(crate) const EVENT_COLUMNS: &str =
    "id, block_number, index, phase, extrinsic_index, module_id, event_id, params, extrinsic_hash";

#[derive(sqlx::FromRow)]
pub(crate) struct BlockRow {
    number: i64,
    hash: Vec<u8>,
    parent_hash: Vec<u8>,
    state_root: Vec<u8>,
    extrinsics_root: Vec<u8>,
    logs_raw: Json<Vec<String>>,
    extrinsics_raw: Json<Vec<String>>,
    event_raw: String,
    extrinsics_count: i32,
    event_count: i32,
    spec_version: i32,
    validator: Option<Vec<u8>>,
    finalized: bool,
    codec_error: bool,
    timestamp: Option<DateTime<Utc>>,
}

impl BlockRow {
    pub(crate) fn into_block(self) -> StorageResult<Block> {
        Ok(Block {
            number: self.number as u64,
            hash: BlockHash(bytes_to_hash32(self.hash, "block.hash")?),
            parent_hash: BlockHash(bytes_to_hash32(self.parent_hash, "block.parent_hash")?),
            state_root: BlockHash(bytes_to_hash32(self.state_root, "block.state_root")?),
            extrinsics_root: BlockHash(bytes_to_hash32(
                self.extrinsics_root,
                "block.extrinsics_root",
            )?),
            logs_raw: self.logs_raw.0,
            extrinsics_raw: self.extrinsics_raw.0,
            event_raw: self.event_raw,
            extrinsics_count: self.extrinsics_count as u32,
            event_count: self.event_count as u32,
            spec_version: self.spec_version as u32,
            validator: bytes_to_optional_hash32(self.validator, "block.validator")?.map(AccountId),
            finalized: self.finalized,
            codec_error: self.codec_error,
            timestamp: self.timestamp,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct BlockCountsRow {
    number: i64,
    extrinsics_count: i32,
    event_count: i32,
}

impl From<BlockCountsRow> for BlockCounts {
    fn from(row: BlockCountsRow) -> Self {
        BlockCounts {
            number: row.number as u64,
            extrinsics_count: row.extrinsics_count as u32,
            event_count: row.event_count as u32,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct ExtrinsicRow {
    id: String,
    block_number: i64,
    index: i32,
    hash: Option<Vec<u8>>,
    call_module: String,
    call_module_function: String,
    signer: Option<Vec<u8>>,
    signature: Option<String>,
    nonce: Option<i64>,
    tip: String,
    params: serde_json::Value,
    success: bool,
    fee: String,
}

impl ExtrinsicRow {
    pub(crate) fn into_extrinsic(self) -> StorageResult<Extrinsic> {
        Ok(Extrinsic {
            hash: bytes_to_optional_hash32(self.hash, "extrinsic.hash")?.map(ExtrinsicHash),
            signer: bytes_to_optional_hash32(self.signer, "extrinsic.signer")?.map(AccountId),
            tip: parse_u128(&self.tip, "extrinsic.tip")?,
            fee: parse_u128(&self.fee, "extrinsic.fee")?,
            id: self.id,
            block_number: self.block_number as u64,
            index: self.index as u32,
            call_module: self.call_module,
            call_module_function: self.call_module_function,
            signature: self.signature,
            nonce: self.nonce.map(|n| n as u64),
            params: self.params,
            success: self.success,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct EventRow {
    id: String,
    block_number: i64,
    index: i32,
    phase: String,
    extrinsic_index: Option<i32>,
    module_id: String,
    event_id: String,
    params: serde_json::Value,
    extrinsic_hash: Option<Vec<u8>>,
}

impl EventRow {
    pub(crate) fn into_event(self) -> StorageResult<Event> {
        Ok(Event {
            extrinsic_hash: bytes_to_optional_hash32(self.extrinsic_hash, "event.extrinsic_hash")?
                .map(ExtrinsicHash),
            phase: EventPhase::from_parts(&self.phase, self.extrinsic_index.map(|i| i as u32)),
            id: self.id,
            block_number: self.block_number as u64,
            index: self.index as u32,
            module_id: self.module_id,
            event_id: self.event_id,
            params: self.params,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct RuntimeVersionRow {
    spec_version: i32,
    impl_name: String,
    modules: Vec<String>,
    raw_metadata: Option<String>,
}

impl From<RuntimeVersionRow> for RuntimeVersion {
    fn from(row: RuntimeVersionRow) -> Self {
        RuntimeVersion {
            spec_version: row.spec_version as u32,
            impl_name: row.impl_name,
            modules: row.modules,
            raw_metadata: row.raw_metadata,
        }
    }
}
