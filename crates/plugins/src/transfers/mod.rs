//! Balance transfers plugin.
//!
//! # Indexed Calls
//!
//! - `balances.transfer`
//! - `balances.transfer_keep_alive`
//! - `balances.transfer_allow_death`
//! - `balances.transfer_all`
//!
//! # Database Tables
//!
//! - `transfers_transfers` - one row per transfer extrinsic

pub mod models;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use chainsight_core::error::PluginResult;
use chainsight_core::models::{Block, Event, Extrinsic};
use chainsight_core::ports::{Plugin, PluginStore};

use crate::utils::{StoreCell, insert_row, param, parse_address, parse_amount};

pub use models::Transfer;

const NAME: &str = "transfers";

const TRANSFER_CALLS: &[&str] = &[
    "transfer",
    "transfer_keep_alive",
    "transfer_allow_death",
    "transfer_all",
];

pub const MIGRATIONS: &[&str] = &[
    // Migration 0: transfers table
    r#"
CREATE TABLE IF NOT EXISTS {prefix}_transfers (
    id BIGSERIAL PRIMARY KEY,
    extrinsic_index TEXT NOT NULL UNIQUE,
    extrinsic_hash TEXT,
    block_num BIGINT NOT NULL,
    block_timestamp TIMESTAMPTZ,
    call TEXT NOT NULL,
    from_addr TEXT NOT NULL,
    to_addr TEXT NOT NULL,
    amount NUMERIC(39, 0) NOT NULL,
    fee NUMERIC(39, 0) NOT NULL,
    success BOOLEAN NOT NULL
);

CREATE INDEX IF NOT EXISTS {prefix}_transfers_num_from_to
    ON {prefix}_transfers (block_num, from_addr, to_addr);
"#,
];

/// Records `balances` transfer calls.
#[derive(Default)]
pub struct TransfersPlugin {
    store: StoreCell,
}

impl TransfersPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn build(&self, block: &Block, extrinsic: &Extrinsic, events: &[Event]) -> Option<Transfer> {
        let Some(from) = extrinsic.signer.as_ref() else {
            warn!(extrinsic = %extrinsic.id, "Unsigned transfer, skipping");
            return None;
        };

        let to = param(&extrinsic.params, &["dest", "to"], 0)
            .and_then(parse_address)
            .or_else(|| {
                warn!(extrinsic = %extrinsic.id, "Failed to parse 'dest' in transfer");
                None
            })?;

        // transfer_all carries no amount; the emitted event does
        let amount = param(&extrinsic.params, &["value", "amount"], 1)
            .and_then(parse_amount)
            .or_else(|| transferred_amount(events))
            .unwrap_or(0);

        Some(Transfer {
            extrinsic_index: extrinsic.id.clone(),
            extrinsic_hash: extrinsic.hash.as_ref().map(|h| h.to_hex()),
            block_num: block.number,
            block_timestamp: block.timestamp,
            call: extrinsic.call_module_function.to_lowercase(),
            from_addr: from.to_hex(),
            to_addr: to,
            amount: amount.to_string(),
            fee: extrinsic.fee.to_string(),
            success: extrinsic.success,
        })
    }
}

/// Amount of the first `balances.Transfer` event.
fn transferred_amount(events: &[Event]) -> Option<u128> {
    events
        .iter()
        .find(|e| {
            e.module_id.eq_ignore_ascii_case("balances")
                && e.event_id.eq_ignore_ascii_case("Transfer")
        })
        .and_then(|e| param(&e.params, &["amount", "value"], 2))
        .and_then(parse_amount)
}

fn is_transfer_call(extrinsic: &Extrinsic) -> bool {
    extrinsic.call_module.eq_ignore_ascii_case("balances")
        && TRANSFER_CALLS
            .iter()
            .any(|call| extrinsic.call_module_function.eq_ignore_ascii_case(call))
}

#[async_trait]
impl Plugin for TransfersPlugin {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&self, store: Arc<dyn PluginStore>) {
        self.store.set(NAME, store);
    }

    fn migrations(&self) -> &'static [&'static str] {
        MIGRATIONS
    }

    fn subscribe_extrinsic(&self) -> &'static [&'static str] {
        &["sudo", "system", "balances", "utility"]
    }

    async fn process_extrinsic(
        &self,
        block: &Block,
        extrinsic: &Extrinsic,
        events: &[Event],
    ) -> PluginResult<()> {
        if !is_transfer_call(extrinsic) {
            return Ok(());
        }
        let store = self.store.get(NAME)?;

        if let Some(transfer) = self.build(block, extrinsic, events) {
            insert_row(store, "transfers", &transfer).await?;
            debug!(
                extrinsic = %transfer.extrinsic_index,
                amount = %transfer.amount,
                "New transfer"
            );
        }
        Ok(())
    }
}
