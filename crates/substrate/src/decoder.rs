//! Metadata-driven SCALE decoder.
//!
//! Parsed metadata is cached per spec version. Extrinsics are decoded
//! field by field against the metadata type registry; events go through
//! subxt's [`Events`] decoder.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{Value as Json, json};
use subxt::config::Hasher;
use subxt::config::substrate::BlakeTwo256;
use subxt::events::{Events, Phase};
use subxt::ext::codec::{Compact, Decode};
use subxt::ext::scale_value::Composite;
use subxt::ext::scale_value::scale::decode_as_type;
use subxt::{Metadata, PolkadotConfig};
use tracing::{debug, trace};

use chainsight_core::error::{DomainError, DomainResult};
use chainsight_core::models::{
    AccountId, DecodedEvent, DecodedExtrinsic, DecodedLog, EventPhase, ExtrinsicHash,
    RuntimeMetadata,
};
use chainsight_core::ports::BlockDecoder;

use crate::convert::{decode_hex, field, find_account, find_u128, to_json};

const SIGNED_BIT: u8 = 0b1000_0000;
const EXTRINSIC_VERSION: u8 = 4;

fn decoding(message: impl std::fmt::Display) -> DomainError {
    DomainError::DecodingError(message.to_string())
}

/// [`BlockDecoder`] backed by subxt metadata.
#[derive(Default)]
pub struct ScaleDecoder {
    cache: Mutex<HashMap<u32, Metadata>>,
}

impl ScaleDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parsed metadata for a spec version, decoding it on first use.
    fn metadata(&self, runtime: &RuntimeMetadata) -> DomainResult<Metadata> {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(metadata) = cache.get(&runtime.spec_version) {
            return Ok(metadata.clone());
        }

        let bytes = decode_hex(&runtime.raw).map_err(decoding)?;
        let metadata = Metadata::decode(&mut &bytes[..]).map_err(|e| {
            decoding(format!("metadata for spec {}: {e}", runtime.spec_version))
        })?;
        debug!(
            spec_version = runtime.spec_version,
            pallets = metadata.pallets().count(),
            "Runtime metadata parsed"
        );
        cache.insert(runtime.spec_version, metadata.clone());
        Ok(metadata)
    }

    fn decode_extrinsic(
        metadata: &Metadata,
        index: u32,
        raw: &str,
    ) -> DomainResult<DecodedExtrinsic> {
        let bytes = decode_hex(raw).map_err(decoding)?;
        let input = &mut &bytes[..];
        let types = metadata.types();

        let Compact(len) = Compact::<u32>::decode(input).map_err(decoding)?;
        if len as usize != input.len() {
            return Err(decoding(format!(
                "extrinsic {index}: length prefix {len} but {} bytes follow",
                input.len()
            )));
        }

        let remaining: &[u8] = *input;
        let (&version, rest) = remaining
            .split_first()
            .ok_or_else(|| decoding(format!("extrinsic {index}: empty")))?;
        *input = rest;
        if version & !SIGNED_BIT != EXTRINSIC_VERSION {
            return Err(decoding(format!(
                "extrinsic {index}: unsupported version {}",
                version & !SIGNED_BIT
            )));
        }

        let mut decoded = DecodedExtrinsic {
            index,
            hash: None,
            call_module: String::new(),
            call_module_function: String::new(),
            signer: None,
            signature: None,
            nonce: None,
            tip: 0,
            params: Json::Array(Vec::new()),
        };

        if version & SIGNED_BIT != 0 {
            let extrinsic = metadata.extrinsic();

            let address = decode_as_type(input, extrinsic.address_ty(), types)
                .map_err(|e| decoding(format!("extrinsic {index} address: {e}")))?;
            decoded.signer = find_account(&address).map(AccountId);

            let signature = decode_as_type(input, extrinsic.signature_ty(), types)
                .map_err(|e| decoding(format!("extrinsic {index} signature: {e}")))?;
            // MultiSignature renders as {"Sr25519": "0x..."}
            decoded.signature = Some(match to_json(&signature) {
                Json::String(s) => s,
                Json::Object(map) if map.len() == 1 => {
                    let inner = map.values().next().and_then(Json::as_str).map(str::to_string);
                    inner.unwrap_or_else(|| Json::Object(map).to_string())
                }
                other => other.to_string(),
            });

            for ext in extrinsic.signed_extensions() {
                let value = decode_as_type(input, ext.extra_ty(), types).map_err(|e| {
                    decoding(format!("extrinsic {index} {}: {e}", ext.identifier()))
                })?;
                match ext.identifier() {
                    "CheckNonce" => decoded.nonce = find_u128(&value).map(|n| n as u64),
                    "ChargeTransactionPayment" => decoded.tip = find_u128(&value).unwrap_or(0),
                    "ChargeAssetTxPayment" => {
                        decoded.tip = field(&value, "tip").and_then(find_u128).unwrap_or(0)
                    }
                    _ => {}
                }
            }

            decoded.hash = Some(ExtrinsicHash(BlakeTwo256::hash(&bytes).0));
        }

        let remaining: &[u8] = *input;
        let (&pallet_index, rest) = remaining
            .split_first()
            .ok_or_else(|| decoding(format!("extrinsic {index}: missing call")))?;
        let (&call_index, rest) = rest
            .split_first()
            .ok_or_else(|| decoding(format!("extrinsic {index}: missing call index")))?;
        *input = rest;

        let pallet = metadata
            .pallet_by_index(pallet_index)
            .ok_or_else(|| decoding(format!("extrinsic {index}: unknown pallet {pallet_index}")))?;
        let call = pallet.call_variant_by_index(call_index).ok_or_else(|| {
            decoding(format!(
                "extrinsic {index}: unknown call {call_index} in {}",
                pallet.name()
            ))
        })?;

        let mut params = Vec::with_capacity(call.fields.len());
        for f in &call.fields {
            let value = decode_as_type(input, f.ty.id, types).map_err(|e| {
                decoding(format!(
                    "extrinsic {index} {}.{}: {e}",
                    pallet.name(),
                    call.name
                ))
            })?;
            params.push(json!({
                "name": f.name.clone().unwrap_or_default(),
                "type": f.type_name.clone().unwrap_or_default(),
                "value": to_json(&value),
            }));
        }

        if !input.is_empty() {
            return Err(decoding(format!(
                "extrinsic {index}: {} trailing bytes",
                input.len()
            )));
        }

        decoded.call_module = pallet.name().to_string();
        decoded.call_module_function = call.name.clone();
        decoded.params = Json::Array(params);
        trace!(
            index,
            call = %format!("{}.{}", decoded.call_module, decoded.call_module_function),
            "Extrinsic decoded"
        );
        Ok(decoded)
    }
}

impl BlockDecoder for ScaleDecoder {
    fn decode_extrinsics(
        &self,
        raw: &[String],
        metadata: &RuntimeMetadata,
    ) -> DomainResult<Vec<DecodedExtrinsic>> {
        let metadata = self.metadata(metadata)?;
        raw.iter()
            .enumerate()
            .map(|(i, hex)| Self::decode_extrinsic(&metadata, i as u32, hex))
            .collect()
    }

    fn decode_events(
        &self,
        raw: &str,
        metadata: &RuntimeMetadata,
    ) -> DomainResult<Vec<DecodedEvent>> {
        let metadata = self.metadata(metadata)?;
        let bytes = decode_hex(raw).map_err(decoding)?;
        if bytes.is_empty() {
            return Ok(Vec::new());
        }

        let events = Events::<PolkadotConfig>::decode_from(bytes, metadata);
        let mut decoded = Vec::with_capacity(events.len() as usize);

        for event in events.iter() {
            let event = event.map_err(|e| decoding(format!("event: {e}")))?;
            let fields = event
                .field_values()
                .map_err(|e| decoding(format!("event {}: {e}", event.index())))?;

            let params = match fields {
                Composite::Named(named) => named
                    .iter()
                    .map(|(name, value)| json!({ "name": name, "value": to_json(value) }))
                    .collect(),
                Composite::Unnamed(values) => values
                    .iter()
                    .map(|value| json!({ "name": Json::Null, "value": to_json(value) }))
                    .collect(),
            };

            decoded.push(DecodedEvent {
                index: event.index(),
                phase: match event.phase() {
                    Phase::ApplyExtrinsic(idx) => EventPhase::ApplyExtrinsic(idx),
                    Phase::Finalization => EventPhase::Finalization,
                    Phase::Initialization => EventPhase::Initialization,
                },
                module_id: event.pallet_name().to_string(),
                event_id: event.variant_name().to_string(),
                params: Json::Array(params),
            });
        }

        Ok(decoded)
    }

    fn decode_logs(&self, raw: &[String]) -> DomainResult<Vec<DecodedLog>> {
        raw.iter()
            .enumerate()
            .map(|(i, hex)| {
                let bytes = decode_hex(hex).map_err(decoding)?;
                decode_digest_item(i as u32, &bytes)
            })
            .collect()
    }

    fn module_names(&self, metadata: &RuntimeMetadata) -> DomainResult<Vec<String>> {
        let metadata = self.metadata(metadata)?;
        Ok(metadata.pallets().map(|p| p.name().to_string()).collect())
    }
}

// =============================================================================
// Digest
// =============================================================================

fn engine_name(engine: &[u8; 4]) -> String {
    match std::str::from_utf8(engine) {
        Ok(s) if s.chars().all(|c| c.is_ascii_graphic()) => s.to_string(),
        _ => format!("0x{}", hex::encode(engine)),
    }
}

/// Decode one `DigestItem`.
pub fn decode_digest_item(index: u32, bytes: &[u8]) -> DomainResult<DecodedLog> {
    let input = &mut &bytes[..];
    let kind = u8::decode(input).map_err(decoding)?;

    let engine_item = |input: &mut &[u8]| -> DomainResult<([u8; 4], Vec<u8>)> {
        let engine = <[u8; 4]>::decode(input).map_err(decoding)?;
        let data = Vec::<u8>::decode(input).map_err(decoding)?;
        Ok((engine, data))
    };

    let (log_type, data, pre_runtime) = match kind {
        0 => {
            let data = Vec::<u8>::decode(input).map_err(decoding)?;
            ("Other", json!(format!("0x{}", hex::encode(data))), None)
        }
        4 | 5 | 6 => {
            let (engine, payload) = engine_item(input)?;
            let log_type = match kind {
                4 => "Consensus",
                5 => "Seal",
                _ => "PreRuntime",
            };
            let data = json!({
                "engine": engine_name(&engine),
                "data": format!("0x{}", hex::encode(&payload)),
            });
            (log_type, data, (kind == 6).then_some((engine, payload)))
        }
        8 => ("RuntimeEnvironmentUpdated", Json::Null, None),
        other => return Err(decoding(format!("digest item {index}: unknown kind {other}"))),
    };

    Ok(DecodedLog {
        index,
        log_type: log_type.to_string(),
        data,
        pre_runtime,
    })
}
