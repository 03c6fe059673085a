//! Block ingestion pipeline.
//!
//! Materializes one block and its extrinsics, events and logs. Every call
//! for the same block number converges on the same persisted rows.
//!
//! # Flow
//!
//! 1. Skip blocks that are already finalized and complete
//! 2. Resolve the block hash
//! 3. Fetch body, event storage and runtime version
//! 4. Decode with the runtime's metadata (panics are caught)
//! 5. Derive success flags, fees, timestamp and validator
//! 6. Persist everything in one transaction
//! 7. Advance fill counters and clear the missing-block entry

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, trace, warn};

use crate::error::{ChainError, DomainError, IndexerError, IndexerResult};
use crate::metrics::{
    ProcessingTimer, record_block_ingested, record_codec_error, record_ingest_failure,
};
use crate::models::{
    AccountId, Block, BlockData, BlockHash, DecodedEvent, DecodedExtrinsic, DecodedLog, Event,
    Extrinsic, ExtrinsicHash, Log, RuntimeMetadata, extrinsic_succeeded, group_by_extrinsic,
    record_id,
};
use crate::ports::{
    BlockDecoder, BlockStore, ChainBlock, ChainRpc, Counter, MetadataStore, PersistOutcome, meta,
};
use crate::services::RuntimeRegistry;

/// Storage key of `System.Events`.
pub const EVENT_STORAGE_KEY: &str =
    "0x26aa394eea5630e07c48ae0c9558cef780d41e5e16056765bc8461851072c9d7";

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Storage key holding the encoded event list.
    pub event_storage_key: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            event_storage_key: EVENT_STORAGE_KEY.to_string(),
        }
    }
}

/// Result of a successful `ingest` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The stored block was already final; nothing was fetched.
    AlreadyComplete,
    /// The block was written. `created` is false when an existing row was overwritten.
    Ingested { created: bool },
    /// Extrinsics or events failed to decode; the block was stored with
    /// `codec_error` and zero counts and is tracked as missing.
    CodecError,
}

impl IngestOutcome {
    /// Whether the block now counts as filled.
    pub fn is_filled(&self) -> bool {
        !matches!(self, IngestOutcome::CodecError)
    }
}

// =============================================================================
// BlockIngestor
// =============================================================================

pub struct BlockIngestor {
    chain: Arc<dyn ChainRpc>,
    decoder: Arc<dyn BlockDecoder>,
    blocks: Arc<dyn BlockStore>,
    meta: Arc<dyn MetadataStore>,
    runtime: Arc<RuntimeRegistry>,
    config: IngestConfig,
}

/// Decoder output for one block.
struct DecodedBlock {
    extrinsics: Vec<DecodedExtrinsic>,
    events: Vec<DecodedEvent>,
    logs: Vec<DecodedLog>,
    failed: bool,
}

impl BlockIngestor {
    pub fn new(
        chain: Arc<dyn ChainRpc>,
        decoder: Arc<dyn BlockDecoder>,
        blocks: Arc<dyn BlockStore>,
        meta: Arc<dyn MetadataStore>,
        runtime: Arc<RuntimeRegistry>,
        config: IngestConfig,
    ) -> Self {
        Self {
            chain,
            decoder,
            blocks,
            meta,
            runtime,
            config,
        }
    }

    /// Ingest one block.
    ///
    /// RPC failures are returned to the caller, which retries later.
    /// A decoder panic is returned as [`IndexerError::Undecodable`].
    #[instrument(skip(self), fields(block = number))]
    pub async fn ingest(&self, number: u64, finalized: bool) -> IndexerResult<IngestOutcome> {
        if let Some(existing) = self.blocks.get_block(number).await?
            && existing.is_settled()
        {
            trace!("Block already complete, skipping");
            return Ok(IngestOutcome::AlreadyComplete);
        }

        let _timer = ProcessingTimer::new();

        let hash = self
            .chain
            .block_hash(number)
            .await
            .inspect_err(|_| record_ingest_failure("hash"))?
            .ok_or_else(|| {
                record_ingest_failure("hash");
                IndexerError::BlockHashUnavailable(number)
            })?;

        let body = self
            .chain
            .block(&hash)
            .await
            .inspect_err(|_| record_ingest_failure("fetch"))?
            .ok_or_else(|| {
                record_ingest_failure("fetch");
                ChainError::BlockFetchError {
                    hash: hash.to_hex(),
                    message: "node returned no block".into(),
                }
            })?;
        let event_raw = self
            .chain
            .storage(&self.config.event_storage_key, &hash)
            .await
            .inspect_err(|_| record_ingest_failure("events"))?
            .unwrap_or_default();
        let version = self
            .chain
            .runtime_version(Some(&hash))
            .await
            .inspect_err(|_| record_ingest_failure("runtime"))?;

        let spec_version = self
            .runtime
            .resolve_spec(number, version)
            .await
            .inspect_err(|_| record_ingest_failure("runtime"))?;
        let metadata = self
            .runtime
            .metadata_for(spec_version, &hash)
            .await
            .inspect_err(|_| record_ingest_failure("metadata"))?;

        let decoded = self.decode(number, &body, &event_raw, &metadata)?;

        let extrinsic_hashes: HashMap<u32, ExtrinsicHash> = decoded
            .extrinsics
            .iter()
            .filter_map(|ext| ext.hash.map(|h| (ext.index, h)))
            .collect();
        let events: Vec<Event> = decoded
            .events
            .into_iter()
            .map(|ev| Event {
                id: record_id(number, ev.index),
                block_number: number,
                index: ev.index,
                extrinsic_hash: ev
                    .phase
                    .extrinsic_index()
                    .and_then(|idx| extrinsic_hashes.get(&idx).copied()),
                phase: ev.phase,
                module_id: ev.module_id,
                event_id: ev.event_id,
                params: ev.params,
            })
            .collect();
        let grouped = group_by_extrinsic(&events);

        let mut extrinsics = Vec::with_capacity(decoded.extrinsics.len());
        for ext in decoded.extrinsics {
            let fee = match (&ext.hash, body.extrinsics.get(ext.index as usize)) {
                (Some(_), Some(raw)) => self.fee(number, ext.index, raw, &hash).await,
                _ => 0,
            };
            extrinsics.push(Extrinsic {
                id: record_id(number, ext.index),
                block_number: number,
                index: ext.index,
                hash: ext.hash,
                success: extrinsic_succeeded(ext.index, &grouped),
                call_module: ext.call_module,
                call_module_function: ext.call_module_function,
                signer: ext.signer,
                signature: ext.signature,
                nonce: ext.nonce,
                tip: ext.tip,
                params: ext.params,
                fee,
            });
        }

        let timestamp = block_timestamp(&extrinsics);
        let validator = match decoded.logs.iter().find_map(|log| log.pre_runtime.as_ref()) {
            Some((engine, data)) => {
                let validators = self
                    .chain
                    .validators(&hash)
                    .await
                    .inspect_err(|_| record_ingest_failure("validators"))?;
                resolve_validator(engine, data, &validators)
            }
            None => None,
        };

        let logs: Vec<Log> = decoded
            .logs
            .into_iter()
            .map(|log| Log {
                id: record_id(number, log.index),
                block_number: number,
                index: log.index,
                log_type: log.log_type,
                data: log.data,
                finalized,
            })
            .collect();

        let codec_error = decoded.failed || (validator.is_none() && number != 0);
        let data = BlockData {
            block: Block {
                number,
                hash,
                parent_hash: body.header.parent_hash,
                state_root: body.header.state_root,
                extrinsics_root: body.header.extrinsics_root,
                logs_raw: body.header.digest_logs,
                extrinsics_raw: body.extrinsics,
                event_raw,
                extrinsics_count: extrinsics.len() as u32,
                event_count: events.len() as u32,
                spec_version,
                validator,
                finalized,
                codec_error,
                timestamp,
            },
            extrinsics,
            events,
            logs,
        };

        let outcome = self
            .blocks
            .persist_block(&data)
            .await
            .inspect_err(|_| record_ingest_failure("persist"))?;

        if codec_error {
            record_codec_error();
        }

        if decoded.failed {
            self.meta.add_missing(number).await?;
            warn!(spec_version, "⚠️  Block stored with codec error");
            return Ok(IngestOutcome::CodecError);
        }

        self.after_persist(&data, finalized, outcome).await?;
        record_block_ingested(finalized);
        debug!(
            extrinsics = data.block.extrinsics_count,
            events = data.block.event_count,
            "⛓️  Block ingested"
        );

        Ok(IngestOutcome::Ingested {
            created: outcome == PersistOutcome::Created,
        })
    }

    /// First block number not yet covered by `FillFinalizedBlockNum`.
    ///
    /// A counter of 0 is ambiguous, so the genesis row decides: it counts
    /// as filled only once it is stored finalized and decoded.
    pub async fn next_unfilled(&self) -> IndexerResult<u64> {
        let filled = self.meta.counter(Counter::FillFinalized).await?;
        if filled > 0 {
            return Ok(filled + 1);
        }
        let genesis = self.blocks.get_block(0).await?;
        Ok(u64::from(genesis.is_some_and(|b| b.finalized && !b.codec_error)))
    }

    /// Counter and bookkeeping updates once the block is durable.
    async fn after_persist(
        &self,
        data: &BlockData,
        finalized: bool,
        outcome: PersistOutcome,
    ) -> IndexerResult<()> {
        let number = data.block.number;
        self.meta.advance_counter(Counter::FillAlready, number).await?;

        if finalized && number == self.next_unfilled().await? {
            self.meta
                .advance_counter(Counter::FillFinalized, number)
                .await?;
        }

        self.meta.remove_missing(number).await?;

        if outcome == PersistOutcome::Created {
            self.meta
                .increment_metadata(meta::COUNT_EXTRINSIC, u64::from(data.block.extrinsics_count))
                .await?;
            self.meta
                .increment_metadata(meta::COUNT_EVENT, u64::from(data.block.event_count))
                .await?;
        }
        Ok(())
    }

    /// Run the decoder with panics turned into `Undecodable`.
    fn decode(
        &self,
        number: u64,
        body: &ChainBlock,
        event_raw: &str,
        metadata: &RuntimeMetadata,
    ) -> IndexerResult<DecodedBlock> {
        let decoder = &*self.decoder;
        let result = catch_unwind(AssertUnwindSafe(|| {
            let extrinsics = decoder.decode_extrinsics(&body.extrinsics, metadata);
            let events = decoder.decode_events(event_raw, metadata);
            let logs = decoder.decode_logs(&body.header.digest_logs);
            (extrinsics, events, logs)
        }));

        let (extrinsics, events, logs) = result.map_err(|payload| {
            record_ingest_failure("decode");
            let message = panic_message(payload.as_ref());
            warn!(block = number, message = %message, "❌ Decoder panicked");
            IndexerError::Undecodable {
                block: number,
                message: DomainError::DecoderPanic(message).to_string(),
            }
        })?;

        let logs = logs.unwrap_or_else(|e| {
            debug!(block = number, error = %e, "Digest logs not decodable");
            Vec::new()
        });

        match (extrinsics, events) {
            (Ok(extrinsics), Ok(events)) => Ok(DecodedBlock {
                extrinsics,
                events,
                logs,
                failed: false,
            }),
            (extrinsics, events) => {
                if let Err(e) = &extrinsics {
                    warn!(block = number, error = %e, "Extrinsics not decodable");
                }
                if let Err(e) = &events {
                    warn!(block = number, error = %e, "Events not decodable");
                }
                Ok(DecodedBlock {
                    extrinsics: Vec::new(),
                    events: Vec::new(),
                    logs,
                    failed: true,
                })
            }
        }
    }

    /// Fee of one extrinsic; 0 when the node cannot estimate it.
    async fn fee(&self, number: u64, index: u32, raw: &str, at: &BlockHash) -> u128 {
        match self.chain.query_fee(raw, at).await {
            Ok(fee) => fee,
            Err(e) => {
                warn!(block = number, extrinsic = index, error = %e, "⚠️  Fee query failed");
                0
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Derived Fields
// =============================================================================

/// Block timestamp from the `timestamp.set` inherent.
pub fn block_timestamp(extrinsics: &[Extrinsic]) -> Option<DateTime<Utc>> {
    extrinsics
        .iter()
        .find(|ext| {
            ext.call_module.eq_ignore_ascii_case("timestamp")
                && ext.call_module_function.eq_ignore_ascii_case("set")
        })
        .and_then(|ext| param_u64(&ext.params, "now"))
        .and_then(|ms| DateTime::from_timestamp_millis(ms as i64))
}

/// Read an integer call parameter.
///
/// Accepts both a keyed object and a list of `{name, value}` pairs, with
/// the value as a number or a decimal string.
pub fn param_u64(params: &serde_json::Value, name: &str) -> Option<u64> {
    let value = match params {
        serde_json::Value::Object(map) => map.get(name),
        serde_json::Value::Array(items) => items
            .iter()
            .find(|item| item.get("name").and_then(|n| n.as_str()) == Some(name))
            .and_then(|item| item.get("value")),
        _ => None,
    }?;

    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

const AURA_ENGINE_ID: [u8; 4] = *b"aura";
const BABE_ENGINE_ID: [u8; 4] = *b"BABE";

/// Block author from a `PreRuntime` digest and the session validator set.
///
/// Aura carries the slot number; the author is `slot % validators`. BABE
/// pre-digests (primary, secondary plain, secondary VRF) carry the
/// authority index directly after the variant byte.
pub fn resolve_validator(
    engine: &[u8; 4],
    data: &[u8],
    validators: &[AccountId],
) -> Option<AccountId> {
    if validators.is_empty() {
        return None;
    }

    let index = match *engine {
        AURA_ENGINE_ID => {
            let slot = u64::from_le_bytes(data.get(..8)?.try_into().ok()?);
            (slot % validators.len() as u64) as usize
        }
        BABE_ENGINE_ID => {
            let (variant, rest) = data.split_first()?;
            if !(1..=3).contains(variant) {
                return None;
            }
            u32::from_le_bytes(rest.get(..4)?.try_into().ok()?) as usize
        }
        _ => return None,
    };

    validators.get(index).copied()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{Harness, ScriptedBlock};

    #[test]
    fn aura_validator_uses_slot_modulo() {
        let validators = vec![AccountId([1; 32]), AccountId([2; 32]), AccountId([3; 32])];
        let slot: u64 = 7;
        let author = resolve_validator(b"aura", &slot.to_le_bytes(), &validators);
        assert_eq!(author, Some(AccountId([2; 32])));
    }

    #[test]
    fn babe_validator_reads_authority_index() {
        let validators = vec![AccountId([1; 32]), AccountId([2; 32]), AccountId([3; 32])];
        let mut data = vec![2u8];
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&[0; 8]);
        assert_eq!(
            resolve_validator(b"BABE", &data, &validators),
            Some(AccountId([3; 32]))
        );

        // Unknown variant
        data[0] = 9;
        assert_eq!(resolve_validator(b"BABE", &data, &validators), None);
        // Out of range authority
        let mut out_of_range = vec![1u8];
        out_of_range.extend_from_slice(&10u32.to_le_bytes());
        assert_eq!(resolve_validator(b"BABE", &out_of_range, &validators), None);
    }

    #[test]
    fn validator_needs_a_validator_set() {
        assert_eq!(resolve_validator(b"aura", &[0; 8], &[]), None);
        assert_eq!(resolve_validator(b"pow_", &[0; 8], &[AccountId([1; 32])]), None);
    }

    #[test]
    fn param_u64_accepts_both_shapes() {
        let keyed = serde_json::json!({ "now": 1_700_000_000_000u64 });
        let listed = serde_json::json!([{ "name": "now", "value": "1700000000000" }]);
        assert_eq!(param_u64(&keyed, "now"), Some(1_700_000_000_000));
        assert_eq!(param_u64(&listed, "now"), Some(1_700_000_000_000));
        assert_eq!(param_u64(&keyed, "then"), None);
    }

    #[tokio::test]
    async fn ingest_persists_block_with_derived_fields() {
        let h = Harness::new().await;
        h.chain.add_block(ScriptedBlock::standard(5).with_failed_extrinsic(2));

        let outcome = h.ingestor.ingest(5, true).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Ingested { created: true });

        let block = h.blocks.get_block(5).await.unwrap().unwrap();
        assert!(block.finalized);
        assert!(!block.codec_error);
        assert!(block.validator.is_some());
        assert!(block.timestamp.is_some());
        assert_eq!(block.extrinsics_count, 3);

        let extrinsics = h.blocks.extrinsics(5).await.unwrap();
        assert!(extrinsics[0].success);
        assert!(!extrinsics[2].success);
        // Signed extrinsics get a fee keyed by their own index
        assert_eq!(extrinsics[1].fee, ScriptedBlock::FEE);
        assert_eq!(extrinsics[0].fee, 0);

        let events = h.blocks.events(5).await.unwrap();
        let failed = events.iter().find(|e| e.is_extrinsic_failed()).unwrap();
        assert_eq!(failed.extrinsic_hash, extrinsics[2].hash);

        assert_eq!(h.meta.counter(Counter::FillAlready).await.unwrap(), 5);
        assert_eq!(
            h.meta.metadata(meta::COUNT_EXTRINSIC).await.unwrap().as_deref(),
            Some("3")
        );
    }

    // Test critique: idempotence, le second appel ne touche pas le noeud
    #[tokio::test]
    async fn ingest_twice_is_idempotent() {
        let h = Harness::new().await;
        h.chain.add_block(ScriptedBlock::standard(5));

        h.ingestor.ingest(5, true).await.unwrap();
        let calls = h.chain.hash_calls();
        let first_rows = h.blocks.extrinsics(5).await.unwrap();

        let outcome = h.ingestor.ingest(5, true).await.unwrap();
        assert_eq!(outcome, IngestOutcome::AlreadyComplete);
        assert_eq!(h.chain.hash_calls(), calls);
        assert_eq!(h.blocks.extrinsics(5).await.unwrap(), first_rows);
        assert_eq!(h.blocks.events(5).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn unfinalized_reingest_replaces_rows() {
        let h = Harness::new().await;
        h.chain.add_block(ScriptedBlock::standard(8));

        h.ingestor.ingest(8, false).await.unwrap();
        let outcome = h.ingestor.ingest(8, true).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Ingested { created: false });

        assert_eq!(h.blocks.extrinsics(8).await.unwrap().len(), 3);
        assert!(h.blocks.get_block(8).await.unwrap().unwrap().finalized);
        // Statistics count the block once
        assert_eq!(
            h.meta.metadata(meta::COUNT_EVENT).await.unwrap().as_deref(),
            Some("4")
        );
    }

    #[tokio::test]
    async fn fill_finalized_advances_only_when_contiguous() {
        let h = Harness::new().await;
        h.meta.set_counter(Counter::FillFinalized, 10).await.unwrap();
        h.chain.add_block(ScriptedBlock::standard(11));
        h.chain.add_block(ScriptedBlock::standard(13));

        h.ingestor.ingest(13, true).await.unwrap();
        assert_eq!(h.meta.counter(Counter::FillFinalized).await.unwrap(), 10);

        h.ingestor.ingest(11, true).await.unwrap();
        assert_eq!(h.meta.counter(Counter::FillFinalized).await.unwrap(), 11);
        assert_eq!(h.meta.counter(Counter::FillAlready).await.unwrap(), 13);
    }

    // Test critique: sans bloc 0 stocké, le compteur 0 ne vaut pas "0 rempli"
    #[tokio::test]
    async fn missing_genesis_holds_fill_finalized() {
        let h = Harness::new().await;
        h.chain.add_block(ScriptedBlock::standard(1));

        h.ingestor.ingest(1, true).await.unwrap();
        assert!(h.blocks.get_block(1).await.unwrap().is_some());
        assert_eq!(h.meta.counter(Counter::FillFinalized).await.unwrap(), 0);
        assert_eq!(h.ingestor.next_unfilled().await.unwrap(), 0);

        h.chain.add_block(ScriptedBlock::standard(0));
        h.ingestor.ingest(0, false).await.unwrap();
        // Un bloc 0 non finalisé ne compte pas
        assert_eq!(h.ingestor.next_unfilled().await.unwrap(), 0);

        h.ingestor.ingest(0, true).await.unwrap();
        assert_eq!(h.ingestor.next_unfilled().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn decode_failure_is_recorded_not_raised() {
        let h = Harness::new().await;
        h.chain.add_block(ScriptedBlock::standard(9).with_undecodable_events());

        let outcome = h.ingestor.ingest(9, true).await.unwrap();
        assert_eq!(outcome, IngestOutcome::CodecError);

        let block = h.blocks.get_block(9).await.unwrap().unwrap();
        assert!(block.codec_error);
        assert_eq!(block.extrinsics_count, 0);
        assert_eq!(h.meta.missing_blocks().await.unwrap(), vec![9]);
        assert_eq!(h.meta.counter(Counter::FillAlready).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn decoder_panic_is_undecodable() {
        let h = Harness::new().await;
        h.chain.add_block(ScriptedBlock::standard(4).with_panicking_decoder());

        let err = h.ingestor.ingest(4, true).await.unwrap_err();
        assert!(matches!(err, IndexerError::Undecodable { block: 4, .. }));
        assert!(h.blocks.get_block(4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_hash_is_reported() {
        let h = Harness::new().await;
        let err = h.ingestor.ingest(77, true).await.unwrap_err();
        assert!(matches!(err, IndexerError::BlockHashUnavailable(77)));
    }

    #[tokio::test]
    async fn failed_fee_query_stores_zero() {
        let h = Harness::new().await;
        h.chain.add_block(ScriptedBlock::standard(6));
        h.chain.fail_fees(true);

        h.ingestor.ingest(6, true).await.unwrap();
        let extrinsics = h.blocks.extrinsics(6).await.unwrap();
        assert!(extrinsics.iter().all(|e| e.fee == 0));
    }

    #[tokio::test]
    async fn missing_validator_flags_codec_error_but_fills() {
        let h = Harness::new().await;
        h.chain.add_block(ScriptedBlock::standard(3).without_digest());

        let outcome = h.ingestor.ingest(3, true).await.unwrap();
        assert!(outcome.is_filled());
        let block = h.blocks.get_block(3).await.unwrap().unwrap();
        assert!(block.codec_error);
        assert!(h.meta.missing_blocks().await.unwrap().is_empty());
    }
}
