//! Staking rewards and slashes plugin.
//!
//! # Indexed Events
//!
//! - `Staking::Reward` / `Staking::Rewarded`
//! - `Staking::Slash` / `Staking::Slashed`

pub mod models;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use chainsight_core::error::PluginResult;
use chainsight_core::models::{Block, Event};
use chainsight_core::ports::{Plugin, PluginStore};

use crate::utils::{StoreCell, insert_row, param, param_or_last, parse_address, parse_amount};

pub use models::Reward;

const NAME: &str = "reward";

const REWARD_EVENTS: &[&str] = &["Reward", "Rewarded", "Slash", "Slashed"];

pub const MIGRATIONS: &[&str] = &[
    // Migration 0: rewards table
    r#"
CREATE TABLE IF NOT EXISTS {prefix}_rewards (
    id BIGSERIAL PRIMARY KEY,
    event_index TEXT NOT NULL UNIQUE,
    block_num BIGINT NOT NULL,
    event_idx INTEGER NOT NULL,
    extrinsic_idx INTEGER,
    extrinsic_hash TEXT,
    module_id TEXT NOT NULL,
    event_id TEXT NOT NULL,
    account TEXT NOT NULL,
    amount NUMERIC(39, 0) NOT NULL,
    params JSONB NOT NULL
);

CREATE INDEX IF NOT EXISTS {prefix}_rewards_account_event
    ON {prefix}_rewards (account, event_index);
"#,
];

/// Records staking reward and slash events.
#[derive(Default)]
pub struct RewardPlugin {
    store: StoreCell,
}

impl RewardPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

fn build(event: &Event) -> Option<Reward> {
    let account = param(&event.params, &["stash", "validator", "staker", "who"], 0)
        .and_then(parse_address)
        .or_else(|| {
            warn!(event = %event.id, "Failed to parse account in staking event");
            None
        })?;
    let amount = param_or_last(&event.params, &["amount", "value"])
        .and_then(parse_amount)
        .or_else(|| {
            warn!(event = %event.id, "Failed to parse amount in staking event");
            None
        })?;

    Some(Reward {
        event_index: event.id.clone(),
        block_num: event.block_number,
        event_idx: event.index,
        extrinsic_idx: event.extrinsic_index(),
        extrinsic_hash: event.extrinsic_hash.as_ref().map(|h| h.to_hex()),
        module_id: event.module_id.to_lowercase(),
        event_id: event.event_id.clone(),
        account,
        amount: amount.to_string(),
        params: event.params.clone(),
    })
}

#[async_trait]
impl Plugin for RewardPlugin {
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
        &["staking"]
    }

    async fn process_event(&self, _block: &Block, event: &Event, _fee: u128) -> PluginResult<()> {
        let wanted = event.module_id.eq_ignore_ascii_case("staking")
            && REWARD_EVENTS
                .iter()
                .any(|name| event.event_id.eq_ignore_ascii_case(name));
        if !wanted {
            return Ok(());
        }
        let store = self.store.get(NAME)?;

        if let Some(reward) = build(event) {
            insert_row(store, "rewards", &reward).await?;
            debug!(event = %reward.event_index, kind = %reward.event_id, "New staking reward");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryStore, block, event};
    use serde_json::json;

    fn stash() -> String {
        "0x".to_string() + &"33".repeat(32)
    }

    #[tokio::test]
    async fn records_named_rewarded_event() {
        let store = MemoryStore::new(NAME);
        let plugin = RewardPlugin::new();
        plugin.init(store.clone());

        let ev = event(
            50,
            7,
            "Staking",
            "Rewarded",
            json!([
                {"name": "stash", "value": stash()},
                {"name": "dest", "value": {"Staked": []}},
                {"name": "amount", "value": "31000"}
            ]),
        );
        plugin.process_event(&block(50), &ev, 0).await.unwrap();

        let rows = store.rows("reward_rewards");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["event_index"], "50-7");
        assert_eq!(rows[0]["account"], stash());
        assert_eq!(rows[0]["amount"], "31000");
        assert_eq!(rows[0]["extrinsic_idx"], 1);
    }

    #[tokio::test]
    async fn records_positional_slash_event() {
        let store = MemoryStore::new(NAME);
        let plugin = RewardPlugin::new();
        plugin.init(store.clone());

        let ev = event(
            51,
            2,
            "staking",
            "Slash",
            json!([{"name": "", "value": stash()}, {"name": "", "value": "10"}]),
        );
        plugin.process_event(&block(51), &ev, 0).await.unwrap();
        assert_eq!(store.rows("reward_rewards")[0]["amount"], "10");
    }

    #[tokio::test]
    async fn ignores_other_staking_events() {
        let store = MemoryStore::new(NAME);
        let plugin = RewardPlugin::new();
        plugin.init(store.clone());

        let ev = event(52, 1, "staking", "Bonded", json!([]));
        plugin.process_event(&block(52), &ev, 0).await.unwrap();
        assert!(store.rows("reward_rewards").is_empty());
    }

    #[tokio::test]
    async fn malformed_event_is_skipped() {
        let store = MemoryStore::new(NAME);
        let plugin = RewardPlugin::new();
        plugin.init(store.clone());

        let ev = event(53, 1, "staking", "Reward", json!([{"name": "", "value": "oops"}]));
        plugin.process_event(&block(53), &ev, 0).await.unwrap();
        assert!(store.rows("reward_rewards").is_empty());
    }
}
