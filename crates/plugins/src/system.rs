//! Failed extrinsics plugin.
//!
//! Keeps the dispatch error of every `System::ExtrinsicFailed` event in
//! `system_extrinsic_errors`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as Json;
use tracing::debug;

use chainsight_core::error::PluginResult;
use chainsight_core::models::{Block, Event};
use chainsight_core::ports::{Plugin, PluginStore};

use crate::utils::{StoreCell, insert_row, param, parse_u32};

const NAME: &str = "system";

pub const MIGRATIONS: &[&str] = &[
    // Migration 0: extrinsic errors table
    r#"
CREATE TABLE IF NOT EXISTS {prefix}_extrinsic_errors (
    id BIGSERIAL PRIMARY KEY,
    extrinsic_index TEXT NOT NULL UNIQUE,
    extrinsic_hash TEXT,
    block_num BIGINT NOT NULL,
    spec_version INTEGER NOT NULL,
    kind TEXT NOT NULL,
    module_index INTEGER,
    dispatch_error JSONB NOT NULL
);
"#,
];

/// The dispatch error of a failed extrinsic.
#[derive(Debug, Clone, Serialize)]
pub struct ExtrinsicError {
    /// `block_number-extrinsic_index`, unique.
    pub extrinsic_index: String,
    pub extrinsic_hash: Option<String>,
    pub block_num: u64,
    pub spec_version: u32,
    /// Dispatch error variant (e.g., "Module", "BadOrigin").
    pub kind: String,
    /// Pallet index for module errors.
    pub module_index: Option<u32>,
    pub dispatch_error: Json,
}

/// Variant name and pallet index of a dispatch error.
fn classify(error: &Json) -> (String, Option<u32>) {
    match error {
        Json::String(kind) => (kind.clone(), None),
        Json::Object(map) => match map.iter().next() {
            Some((kind, inner)) => {
                let module = (kind == "Module")
                    .then(|| inner.get("index").and_then(parse_u32))
                    .flatten();
                (kind.clone(), module)
            }
            None => ("Unknown".to_string(), None),
        },
        _ => ("Unknown".to_string(), None),
    }
}

/// Records failed extrinsics.
#[derive(Default)]
pub struct SystemPlugin {
    store: StoreCell,
}

impl SystemPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Plugin for SystemPlugin {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&self, store: Arc<dyn PluginStore>) {
        self.store.set(NAME, store);
    }

    fn migrations(&self) -> &'static [&'static str] {
        MIGRATIONS
    }

    fn subscribe_event(&self) -> &'static [&'static str] {
        &["system"]
    }

    async fn process_event(&self, block: &Block, event: &Event, _fee: u128) -> PluginResult<()> {
        if !event.is_extrinsic_failed() {
            return Ok(());
        }
        let Some(index) = event.extrinsic_index() else {
            return Ok(());
        };
        let store = self.store.get(NAME)?;

        let dispatch_error = param(&event.params, &["dispatch_error"], 0)
            .cloned()
            .unwrap_or(Json::Null);
        let (kind, module_index) = classify(&dispatch_error);

        let row = ExtrinsicError {
            extrinsic_index: format!("{}-{}", block.number, index),
            extrinsic_hash: event.extrinsic_hash.as_ref().map(|h| h.to_hex()),
            block_num: block.number,
            spec_version: block.spec_version,
            kind,
            module_index,
            dispatch_error,
        };
        insert_row(store, "extrinsic_errors", &row).await?;
        debug!(extrinsic = %row.extrinsic_index, kind = %row.kind, "Extrinsic failed");
        Ok(())
    }
}
