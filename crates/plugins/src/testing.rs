//! In-memory plugin store and record builders for plugin tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::Value as Json;

use chainsight_core::error::{StorageError, StorageResult};
use chainsight_core::models::{AccountId, Block, BlockHash, Event, EventPhase, Extrinsic};
use chainsight_core::ports::PluginStore;

pub struct MemoryStore {
    prefix: String,
    unique: Option<&'static str>,
    rows: Mutex<Vec<(String, Json)>>,
    migrations: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new(prefix: &str) -> Arc<Self> {
        Arc::new(Self {
            prefix: prefix.to_string(),
            unique: None,
            rows: Mutex::new(Vec::new()),
            migrations: Mutex::new(Vec::new()),
        })
    }

    /// Reject a second row with the same value in `column`.
    pub fn unique_on(prefix: &str, column: &'static str) -> Arc<Self> {
        Arc::new(Self {
            prefix: prefix.to_string(),
            unique: Some(column),
            rows: Mutex::new(Vec::new()),
            migrations: Mutex::new(Vec::new()),
        })
    }

    pub fn rows(&self, table: &str) -> Vec<Json> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, row)| row.clone())
            .collect()
    }

    pub fn migrations(&self) -> Vec<String> {
        self.migrations.lock().unwrap().clone()
    }
}

#[async_trait]
impl PluginStore for MemoryStore {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn apply_migration(&self, _index: usize, ddl: &str) -> StorageResult<()> {
        self.migrations
            .lock()
            .unwrap()
            .push(ddl.replace("{prefix}", &self.prefix));
        Ok(())
    }

    async fn insert(&self, table: &str, row: Json) -> StorageResult<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(column) = self.unique {
            let clash = rows
                .iter()
                .any(|(t, existing)| t == table && existing.get(column) == row.get(column));
            if clash {
                return Err(StorageError::ConstraintViolation(format!(
                    "duplicate key value violates unique constraint on {table}.{column}"
                )));
            }
        }
        rows.push((table.to_string(), row));
        Ok(())
    }
}

pub fn block(number: u64) -> Block {
    Block {
        number,
        hash: BlockHash([number as u8; 32]),
        parent_hash: BlockHash([0; 32]),
        state_root: BlockHash([0; 32]),
        extrinsics_root: BlockHash([0; 32]),
        logs_raw: Vec::new(),
        extrinsics_raw: Vec::new(),
        event_raw: String::new(),
        extrinsics_count: 2,
        event_count: 3,
        spec_version: 9430,
        validator: None,
        finalized: true,
        codec_error: false,
        timestamp: Utc.timestamp_opt(1_700_000_000, 0).single(),
    }
}

pub fn extrinsic(block: u64, index: u32, module: &str, call: &str, params: Json) -> Extrinsic {
    Extrinsic {
        id: format!("{block}-{index}"),
        block_number: block,
        index,
        hash: None,
        call_module: module.to_string(),
        call_module_function: call.to_string(),
        signer: Some(AccountId([0x11; 32])),
        signature: Some("0x00".into()),
        nonce: Some(1),
        tip: 0,
        params,
        success: true,
        fee: 125_000_000,
    }
}

pub fn event(block: u64, index: u32, module: &str, name: &str, params: Json) -> Event {
    Event {
        id: format!("{block}-{index}"),
        block_number: block,
        index,
        phase: EventPhase::ApplyExtrinsic(1),
        module_id: module.to_string(),
        event_id: name.to_string(),
        params,
        extrinsic_hash: None,
    }
}
