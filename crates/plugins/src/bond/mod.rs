//! Staking bonds plugin.
//!
//! `bond`, `bond_extra` and `rebond` are stored as `bonded`; `unbond` is
//! stored as `unbonding` together with the end of its unbonding period.

pub mod models;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::TimeDelta;
use tracing::{debug, warn};

use chainsight_core::error::PluginResult;
use chainsight_core::models::{Block, Event, Extrinsic};
use chainsight_core::ports::{Plugin, PluginStore};

use crate::utils::{StoreCell, insert_row, param, param_count, parse_amount};

pub use models::{Bond, BondStatus};

const NAME: &str = "bond";

/// Unbonding period, in time.
pub const UNBONDING_DAYS: i64 = 14;

/// Unbonding period, in blocks.
pub const UNBONDING_BLOCKS: u64 = 403_200;

pub const MIGRATIONS: &[&str] = &[
    // Migration 0: bonds table
    r#"
CREATE TABLE IF NOT EXISTS {prefix}_bonds (
    id BIGSERIAL PRIMARY KEY,
    extrinsic_index TEXT NOT NULL UNIQUE,
    account TEXT NOT NULL,
    block_num BIGINT NOT NULL,
    amount NUMERIC(39, 0) NOT NULL,
    status TEXT NOT NULL,
    start_at TIMESTAMPTZ,
    unbonding_at TIMESTAMPTZ,
    unbonding_end TIMESTAMPTZ,
    unbonding_block_end BIGINT,
    unlock BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE INDEX IF NOT EXISTS {prefix}_bonds_account_start
    ON {prefix}_bonds (account, start_at);
"#,
];

fn status_of(call: &str) -> Option<BondStatus> {
    match call.to_ascii_lowercase().as_str() {
        "bond" | "bond_extra" | "rebond" => Some(BondStatus::Bonded),
        "unbond" => Some(BondStatus::Unbonding),
        _ => None,
    }
}

/// Records staking bond calls.
#[derive(Default)]
pub struct BondPlugin {
    store: StoreCell,
}

impl BondPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn build(&self, block: &Block, extrinsic: &Extrinsic, status: BondStatus) -> Option<Bond> {
        let Some(account) = extrinsic.signer.as_ref() else {
            warn!(extrinsic = %extrinsic.id, "Unsigned staking call, skipping");
            return None;
        };

        // Old runtimes bond(controller, value, payee); current ones bond(value, payee)
        let position = if param_count(&extrinsic.params) == 3 { 1 } else { 0 };
        let amount = param(&extrinsic.params, &["value", "max_additional"], position)
            .and_then(parse_amount)
            .or_else(|| {
                warn!(extrinsic = %extrinsic.id, "Failed to parse amount in staking call");
                None
            })?;

        let mut bond = Bond {
            extrinsic_index: extrinsic.id.clone(),
            account: account.to_hex(),
            block_num: block.number,
            amount: amount.to_string(),
            status,
            start_at: block.timestamp,
            unbonding_at: None,
            unbonding_end: None,
            unbonding_block_end: None,
        };
        if status == BondStatus::Unbonding {
            bond.unbonding_at = block.timestamp;
            bond.unbonding_end = block
                .timestamp
                .map(|ts| ts + TimeDelta::days(UNBONDING_DAYS));
            bond.unbonding_block_end = Some(block.number + UNBONDING_BLOCKS);
        }
        Some(bond)
    }
}

#[async_trait]
impl Plugin for BondPlugin {
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
        &["staking"]
    }

    async fn process_extrinsic(
        &self,
        block: &Block,
        extrinsic: &Extrinsic,
        _events: &[Event],
    ) -> PluginResult<()> {
        if !extrinsic.call_module.eq_ignore_ascii_case("staking") {
            return Ok(());
        }
        let Some(status) = status_of(&extrinsic.call_module_function) else {
            return Ok(());
        };
        let store = self.store.get(NAME)?;

        if let Some(bond) = self.build(block, extrinsic, status) {
            insert_row(store, "bonds", &bond).await?;
            debug!(extrinsic = %bond.extrinsic_index, status = ?status, "New bond record");
        }
        Ok(())
    }
}
