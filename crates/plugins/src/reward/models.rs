//! Models for the reward plugin.

use serde::Serialize;

/// A staking reward or slash.
#[derive(Debug, Clone, Serialize)]
pub struct Reward {
    /// `block_number-event_index`, unique.
    pub event_index: String,
    pub block_num: u64,
    pub event_idx: u32,
    pub extrinsic_idx: Option<u32>,
    pub extrinsic_hash: Option<String>,
    pub module_id: String,
    /// `Reward`, `Rewarded`, `Slash` or `Slashed`.
    pub event_id: String,
    pub account: String,
    pub amount: String,
    pub params: serde_json::Value,
}
