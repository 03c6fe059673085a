//! In-memory port implementations for service tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::{Value, json};

use crate::error::{
    ChainError, ChainResult, DomainError, DomainResult, PluginError, PluginResult, StorageError,
    StorageResult,
};
use crate::models::{
    AccountId, Block, BlockCounts, BlockData, BlockHash, DecodedEvent, DecodedExtrinsic,
    DecodedLog, Event, EventPhase, Extrinsic, ExtrinsicHash, Log, RuntimeMetadata,
    RuntimeVersion,
};
use crate::ports::{
    BlockDecoder, BlockStore, ChainBlock, ChainHeader, ChainNotification, ChainRpc, Counter,
    Daemon, MetadataStore, NotificationStream, PersistOutcome, Plugin, PluginStore,
    PluginStoreProvider, RuntimeVersionInfo,
};
use crate::services::{BlockIngestor, IngestConfig, RuntimeRegistry};

// =============================================================================
// Block Store
// =============================================================================

#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: Mutex<BTreeMap<u64, Block>>,
    extrinsics: Mutex<BTreeMap<u64, Vec<Extrinsic>>>,
    events: Mutex<BTreeMap<u64, Vec<Event>>>,
    logs: Mutex<BTreeMap<u64, Vec<Log>>>,
    runtime: Mutex<BTreeMap<u32, RuntimeVersion>>,
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn get_block(&self, number: u64) -> StorageResult<Option<Block>> {
        Ok(self.blocks.lock().unwrap().get(&number).cloned())
    }

    async fn nearest_spec_version(&self, number: u64) -> StorageResult<Option<u32>> {
        Ok(self
            .blocks
            .lock()
            .unwrap()
            .range(..=number)
            .next_back()
            .map(|(_, b)| b.spec_version))
    }

    async fn block_counts(&self, range: RangeInclusive<u64>) -> StorageResult<Vec<BlockCounts>> {
        Ok(self
            .blocks
            .lock()
            .unwrap()
            .range(range)
            .map(|(n, b)| BlockCounts {
                number: *n,
                extrinsics_count: b.extrinsics_count,
                event_count: b.event_count,
            })
            .collect())
    }

    async fn persist_block(&self, data: &BlockData) -> StorageResult<PersistOutcome> {
        let number = data.block.number;
        self.extrinsics
            .lock()
            .unwrap()
            .insert(number, data.extrinsics.clone());
        self.events.lock().unwrap().insert(number, data.events.clone());
        self.logs.lock().unwrap().insert(number, data.logs.clone());
        let previous = self.blocks.lock().unwrap().insert(number, data.block.clone());
        Ok(match previous {
            Some(_) => PersistOutcome::Updated,
            None => PersistOutcome::Created,
        })
    }

    async fn extrinsics(&self, block_number: u64) -> StorageResult<Vec<Extrinsic>> {
        Ok(self
            .extrinsics
            .lock()
            .unwrap()
            .get(&block_number)
            .cloned()
            .unwrap_or_default())
    }

    async fn events(&self, block_number: u64) -> StorageResult<Vec<Event>> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .get(&block_number)
            .cloned()
            .unwrap_or_default())
    }

    async fn runtime_versions(&self) -> StorageResult<Vec<RuntimeVersion>> {
        Ok(self.runtime.lock().unwrap().values().cloned().collect())
    }

    async fn insert_runtime_version(&self, version: &RuntimeVersion) -> StorageResult<()> {
        self.runtime
            .lock()
            .unwrap()
            .entry(version.spec_version)
            .or_insert_with(|| version.clone());
        Ok(())
    }

    async fn set_runtime_metadata(
        &self,
        spec_version: u32,
        raw: &str,
        modules: &[String],
    ) -> StorageResult<()> {
        let mut runtime = self.runtime.lock().unwrap();
        let version = runtime
            .get_mut(&spec_version)
            .ok_or_else(|| StorageError::NotFound(format!("spec {spec_version}")))?;
        version.raw_metadata = Some(raw.to_string());
        version.modules = modules.to_vec();
        Ok(())
    }
}

// =============================================================================
// Metadata Store
// =============================================================================

#[derive(Default)]
pub struct MemoryMetadataStore {
    counters: Mutex<HashMap<Counter, u64>>,
    metadata: Mutex<HashMap<String, String>>,
    missing: Mutex<BTreeSet<u64>>,
    heartbeats: Mutex<HashMap<Daemon, DateTime<Utc>>>,
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn counter(&self, counter: Counter) -> StorageResult<u64> {
        Ok(self.counters.lock().unwrap().get(&counter).copied().unwrap_or(0))
    }

    async fn set_counter(&self, counter: Counter, value: u64) -> StorageResult<()> {
        self.counters.lock().unwrap().insert(counter, value);
        Ok(())
    }

    async fn advance_counter(&self, counter: Counter, value: u64) -> StorageResult<u64> {
        let mut counters = self.counters.lock().unwrap();
        let entry = counters.entry(counter).or_insert(0);
        *entry = (*entry).max(value);
        Ok(*entry)
    }

    async fn set_metadata(&self, key: &str, value: &str) -> StorageResult<()> {
        self.metadata
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn metadata(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.metadata.lock().unwrap().get(key).cloned())
    }

    async fn increment_metadata(&self, key: &str, by: u64) -> StorageResult<()> {
        let mut metadata = self.metadata.lock().unwrap();
        let current: u64 = metadata.get(key).and_then(|v| v.parse().ok()).unwrap_or(0);
        metadata.insert(key.to_string(), (current + by).to_string());
        Ok(())
    }

    async fn add_missing(&self, block_number: u64) -> StorageResult<()> {
        self.missing.lock().unwrap().insert(block_number);
        Ok(())
    }

    async fn remove_missing(&self, block_number: u64) -> StorageResult<()> {
        self.missing.lock().unwrap().remove(&block_number);
        Ok(())
    }

    async fn missing_blocks(&self) -> StorageResult<Vec<u64>> {
        Ok(self.missing.lock().unwrap().iter().copied().collect())
    }

    async fn heartbeat(&self, daemon: Daemon) -> StorageResult<()> {
        self.heartbeats.lock().unwrap().insert(daemon, Utc::now());
        Ok(())
    }

    async fn last_heartbeat(&self, daemon: Daemon) -> StorageResult<Option<DateTime<Utc>>> {
        Ok(self.heartbeats.lock().unwrap().get(&daemon).copied())
    }
}

// =============================================================================
// Scripted Chain
// =============================================================================

/// A block served by [`ScriptedChain`] and understood by [`StubDecoder`].
///
/// Extrinsics, events and digests are JSON documents instead of SCALE.
#[derive(Debug, Clone)]
pub struct ScriptedBlock {
    pub number: u64,
    pub extrinsics: Vec<String>,
    pub events: Vec<Value>,
    pub events_override: Option<&'static str>,
    pub logs: Vec<String>,
}

impl ScriptedBlock {
    pub const FEE: u128 = 1_250_000;

    /// Timestamp inherent plus two signed balance transfers, all successful.
    pub fn standard(number: u64) -> Self {
        let extrinsics = vec![
            json!({
                "module": "timestamp",
                "function": "set",
                "signed": false,
                "params": { "now": 1_700_000_000_000u64 + number * 6_000 },
            }),
            json!({
                "module": "balances",
                "function": "transfer",
                "signed": true,
                "params": { "dest": format!("0x{}", "22".repeat(32)), "value": "1000" },
            }),
            json!({
                "module": "balances",
                "function": "transfer_keep_alive",
                "signed": true,
                "params": { "dest": format!("0x{}", "33".repeat(32)), "value": "2500" },
            }),
        ];
        let events = vec![
            json!({ "ext": 0, "module": "system", "event": "ExtrinsicSuccess" }),
            json!({ "ext": 1, "module": "balances", "event": "Transfer" }),
            json!({ "ext": 1, "module": "system", "event": "ExtrinsicSuccess" }),
            json!({ "ext": 2, "module": "system", "event": "ExtrinsicSuccess" }),
        ];
        Self {
            number,
            extrinsics: extrinsics.iter().map(Value::to_string).collect(),
            events,
            events_override: None,
            logs: vec![json!({ "aura": number }).to_string()],
        }
    }

    pub fn with_failed_extrinsic(mut self, index: u64) -> Self {
        for event in &mut self.events {
            if event["ext"] == json!(index) && event["module"] == "system" {
                event["event"] = json!("ExtrinsicFailed");
            }
        }
        self
    }

    pub fn with_undecodable_events(mut self) -> Self {
        self.events_override = Some("not-events");
        self
    }

    pub fn with_panicking_decoder(mut self) -> Self {
        self.events_override = Some("panic");
        self
    }

    pub fn without_digest(mut self) -> Self {
        self.logs.clear();
        self
    }

    fn raw_events(&self) -> String {
        match self.events_override {
            Some(raw) => raw.to_string(),
            None => Value::Array(self.events.clone()).to_string(),
        }
    }
}

pub fn hash_of(number: u64) -> BlockHash {
    let mut bytes = [0xaa; 32];
    bytes[..8].copy_from_slice(&number.to_le_bytes());
    BlockHash(bytes)
}

fn number_of(hash: &BlockHash) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.0[..8]);
    u64::from_le_bytes(bytes)
}

pub struct ScriptedChain {
    blocks: Mutex<HashMap<u64, ScriptedBlock>>,
    hash_failures: Mutex<HashMap<u64, u32>>,
    notifications: Mutex<Vec<ChainNotification>>,
    hash_calls: AtomicUsize,
    reconnects: AtomicUsize,
    fail_fees: AtomicBool,
    connected: AtomicBool,
}

impl ScriptedChain {
    pub const SPEC_VERSION: u32 = 1;

    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            hash_failures: Mutex::new(HashMap::new()),
            notifications: Mutex::new(Vec::new()),
            hash_calls: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
            fail_fees: AtomicBool::new(false),
            connected: AtomicBool::new(true),
        }
    }

    pub fn add_block(&self, block: ScriptedBlock) {
        self.blocks.lock().unwrap().insert(block.number, block);
    }

    /// Make the next `times` hash lookups for `number` fail.
    pub fn fail_hash(&self, number: u64, times: u32) {
        self.hash_failures.lock().unwrap().insert(number, times);
    }

    pub fn fail_fees(&self, fail: bool) {
        self.fail_fees.store(fail, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Queue a notification for the next subscription.
    pub fn push_notification(&self, notification: ChainNotification) {
        self.notifications.lock().unwrap().push(notification);
    }

    pub fn hash_calls(&self) -> usize {
        self.hash_calls.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    fn scripted(&self, hash: &BlockHash) -> Option<ScriptedBlock> {
        self.blocks.lock().unwrap().get(&number_of(hash)).cloned()
    }
}

#[async_trait]
impl ChainRpc for ScriptedChain {
    async fn block_hash(&self, number: u64) -> ChainResult<Option<BlockHash>> {
        self.hash_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(left) = self.hash_failures.lock().unwrap().get_mut(&number)
            && *left > 0
        {
            *left -= 1;
            return Err(ChainError::Timeout(100));
        }
        let known = self.blocks.lock().unwrap().contains_key(&number);
        Ok(known.then(|| hash_of(number)))
    }

    async fn block(&self, hash: &BlockHash) -> ChainResult<Option<ChainBlock>> {
        Ok(self.scripted(hash).map(|b| ChainBlock {
            header: ChainHeader {
                number: b.number,
                parent_hash: hash_of(b.number.saturating_sub(1)),
                state_root: BlockHash([0x51; 32]),
                extrinsics_root: BlockHash([0xe1; 32]),
                digest_logs: b.logs.clone(),
            },
            extrinsics: b.extrinsics.clone(),
        }))
    }

    async fn storage(&self, _key: &str, at: &BlockHash) -> ChainResult<Option<String>> {
        Ok(self.scripted(at).map(|b| b.raw_events()))
    }

    async fn runtime_version(
        &self,
        _at: Option<&BlockHash>,
    ) -> ChainResult<Option<RuntimeVersionInfo>> {
        Ok(Some(RuntimeVersionInfo {
            spec_version: Self::SPEC_VERSION,
            impl_name: "scripted".into(),
        }))
    }

    async fn metadata(&self, _at: &BlockHash) -> ChainResult<String> {
        Ok("0x6d657461".into())
    }

    async fn query_fee(&self, _extrinsic_hex: &str, _at: &BlockHash) -> ChainResult<u128> {
        if self.fail_fees.load(Ordering::SeqCst) {
            return Err(ChainError::RpcError("payment_queryInfo unavailable".into()));
        }
        Ok(ScriptedBlock::FEE)
    }

    async fn validators(&self, _at: &BlockHash) -> ChainResult<Vec<AccountId>> {
        Ok(vec![AccountId([1; 32]), AccountId([2; 32])])
    }

    async fn health(&self) -> ChainResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChainError::NotConnected)
        }
    }

    async fn subscribe(&self) -> ChainResult<NotificationStream> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ChainError::NotConnected);
        }
        let queued: Vec<_> = self.notifications.lock().unwrap().drain(..).collect();
        let stream = futures::stream::iter(queued.into_iter().map(Ok))
            .chain(futures::stream::pending());
        Ok(Box::pin(stream))
    }

    async fn reconnect(&self) -> ChainResult<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Stub Decoder
// =============================================================================

/// Decodes the JSON documents produced by [`ScriptedBlock`].
pub struct StubDecoder;

impl BlockDecoder for StubDecoder {
    fn decode_extrinsics(
        &self,
        raw: &[String],
        _metadata: &RuntimeMetadata,
    ) -> DomainResult<Vec<DecodedExtrinsic>> {
        raw.iter()
            .enumerate()
            .map(|(i, raw)| {
                let doc: Value = serde_json::from_str(raw)
                    .map_err(|e| DomainError::DecodingError(e.to_string()))?;
                let signed = doc["signed"].as_bool().unwrap_or(false);
                Ok(DecodedExtrinsic {
                    index: i as u32,
                    hash: signed.then(|| ExtrinsicHash([i as u8 + 1; 32])),
                    call_module: doc["module"].as_str().unwrap_or_default().to_string(),
                    call_module_function: doc["function"].as_str().unwrap_or_default().to_string(),
                    signer: signed.then_some(AccountId([9; 32])),
                    signature: signed.then(|| "0x01".to_string()),
                    nonce: signed.then_some(i as u64),
                    tip: 0,
                    params: doc["params"].clone(),
                })
            })
            .collect()
    }

    fn decode_events(
        &self,
        raw: &str,
        _metadata: &RuntimeMetadata,
    ) -> DomainResult<Vec<DecodedEvent>> {
        if raw == "panic" {
            panic!("scripted decoder panic");
        }
        let docs: Vec<Value> =
            serde_json::from_str(raw).map_err(|e| DomainError::DecodingError(e.to_string()))?;
        Ok(docs
            .iter()
            .enumerate()
            .map(|(i, doc)| DecodedEvent {
                index: i as u32,
                phase: match doc["ext"].as_u64() {
                    Some(ext) => EventPhase::ApplyExtrinsic(ext as u32),
                    None => EventPhase::Finalization,
                },
                module_id: doc["module"].as_str().unwrap_or_default().to_string(),
                event_id: doc["event"].as_str().unwrap_or_default().to_string(),
                params: doc.get("params").cloned().unwrap_or(Value::Null),
            })
            .collect())
    }

    fn decode_logs(&self, raw: &[String]) -> DomainResult<Vec<DecodedLog>> {
        raw.iter()
            .enumerate()
            .map(|(i, raw)| {
                let doc: Value = serde_json::from_str(raw)
                    .map_err(|e| DomainError::DecodingError(e.to_string()))?;
                let slot = doc["aura"].as_u64();
                Ok(DecodedLog {
                    index: i as u32,
                    log_type: "PreRuntime".into(),
                    data: doc,
                    pre_runtime: slot.map(|s| (*b"aura", s.to_le_bytes().to_vec())),
                })
            })
            .collect()
    }

    fn module_names(&self, _metadata: &RuntimeMetadata) -> DomainResult<Vec<String>> {
        Ok(vec!["System".into(), "Timestamp".into(), "Balances".into()])
    }
}

// =============================================================================
// Plugins
// =============================================================================

pub struct MemoryPluginStore {
    prefix: String,
    pub rows: Mutex<Vec<(String, Value)>>,
    pub migrations: Mutex<Vec<usize>>,
}

#[async_trait]
impl PluginStore for MemoryPluginStore {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn apply_migration(&self, index: usize, _ddl: &str) -> StorageResult<()> {
        let mut applied = self.migrations.lock().unwrap();
        if !applied.contains(&index) {
            applied.push(index);
        }
        Ok(())
    }

    async fn insert(&self, table: &str, row: Value) -> StorageResult<()> {
        self.rows.lock().unwrap().push((table.to_string(), row));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPluginStores {
    stores: Mutex<HashMap<String, Arc<MemoryPluginStore>>>,
}

impl MemoryPluginStores {
    pub fn store(&self, plugin: &str) -> Option<Arc<MemoryPluginStore>> {
        self.stores.lock().unwrap().get(plugin).cloned()
    }
}

impl PluginStoreProvider for MemoryPluginStores {
    fn store_for(&self, plugin: &str) -> Arc<dyn PluginStore> {
        let store = self
            .stores
            .lock()
            .unwrap()
            .entry(plugin.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryPluginStore {
                    prefix: plugin.to_string(),
                    rows: Mutex::new(Vec::new()),
                    migrations: Mutex::new(Vec::new()),
                })
            })
            .clone();
        store
    }
}

/// Records what it receives; subscribes to `balances` extrinsics and
/// `system` events.
pub struct RecordingPlugin {
    name: &'static str,
    unique: bool,
    failing_on: Option<u64>,
    failing_once_on: Mutex<Option<u64>>,
    store: OnceLock<Arc<dyn PluginStore>>,
    seen: Mutex<HashSet<String>>,
    extrinsics: Mutex<Vec<(String, usize)>>,
    event_fees: Mutex<Vec<(String, u128)>>,
    blocks: Mutex<BTreeSet<u64>>,
}

impl RecordingPlugin {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            unique: false,
            failing_on: None,
            failing_once_on: Mutex::new(None),
            store: OnceLock::new(),
            seen: Mutex::new(HashSet::new()),
            extrinsics: Mutex::new(Vec::new()),
            event_fees: Mutex::new(Vec::new()),
            blocks: Mutex::new(BTreeSet::new()),
        }
    }

    /// Reject repeated records with a unique-constraint error.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn failing_on(mut self, block: u64) -> Self {
        self.failing_on = Some(block);
        self
    }

    pub fn failing_once_on(self, block: u64) -> Self {
        *self.failing_once_on.lock().unwrap() = Some(block);
        self
    }

    pub fn extrinsics(&self) -> Vec<(String, usize)> {
        self.extrinsics.lock().unwrap().clone()
    }

    pub fn event_fees(&self) -> Vec<(String, u128)> {
        self.event_fees.lock().unwrap().clone()
    }

    pub fn blocks_seen(&self) -> Vec<u64> {
        self.blocks.lock().unwrap().iter().copied().collect()
    }

    pub fn is_initialized(&self) -> bool {
        self.store.get().is_some()
    }

    fn check(&self, block: u64, key: String) -> PluginResult<()> {
        self.blocks.lock().unwrap().insert(block);
        if self.failing_on == Some(block) {
            return Err(PluginError::InvalidParams("scripted failure".into()));
        }
        {
            let mut once = self.failing_once_on.lock().unwrap();
            if *once == Some(block) {
                *once = None;
                return Err(PluginError::InvalidParams("scripted transient failure".into()));
            }
        }
        if self.unique && !self.seen.lock().unwrap().insert(key.clone()) {
            return Err(PluginError::Storage(StorageError::ConstraintViolation(key)));
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for RecordingPlugin {
    fn name(&self) -> &'static str {
        self.name
    }

    fn init(&self, store: Arc<dyn PluginStore>) {
        let _ = self.store.set(store);
    }

    fn migrations(&self) -> &'static [&'static str] {
        &["CREATE TABLE IF NOT EXISTS {prefix}_records (id TEXT PRIMARY KEY)"]
    }

    fn subscribe_extrinsic(&self) -> &'static [&'static str] {
        &["balances"]
    }

    fn subscribe_event(&self) -> &'static [&'static str] {
        &["system"]
    }

    async fn process_extrinsic(
        &self,
        block: &Block,
        extrinsic: &Extrinsic,
        events: &[Event],
    ) -> PluginResult<()> {
        self.check(block.number, format!("ext:{}", extrinsic.id))?;
        self.extrinsics
            .lock()
            .unwrap()
            .push((extrinsic.id.clone(), events.len()));
        Ok(())
    }

    async fn process_event(&self, block: &Block, event: &Event, fee: u128) -> PluginResult<()> {
        self.check(block.number, format!("ev:{}", event.id))?;
        self.event_fees.lock().unwrap().push((event.id.clone(), fee));
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Ingestor wired to in-memory ports.
pub struct Harness {
    pub chain: Arc<ScriptedChain>,
    pub blocks: Arc<MemoryBlockStore>,
    pub meta: Arc<MemoryMetadataStore>,
    pub runtime: Arc<RuntimeRegistry>,
    pub ingestor: Arc<BlockIngestor>,
}

impl Harness {
    pub async fn new() -> Self {
        let chain = Arc::new(ScriptedChain::new());
        let blocks = Arc::new(MemoryBlockStore::default());
        let meta = Arc::new(MemoryMetadataStore::default());
        let decoder = Arc::new(StubDecoder);

        let runtime = Arc::new(
            RuntimeRegistry::load(chain.clone(), blocks.clone(), decoder.clone())
                .await
                .unwrap(),
        );
        let ingestor = Arc::new(BlockIngestor::new(
            chain.clone(),
            decoder,
            blocks.clone(),
            meta.clone(),
            runtime.clone(),
            IngestConfig::default(),
        ));

        Self {
            chain,
            blocks,
            meta,
            runtime,
            ingestor,
        }
    }
}
