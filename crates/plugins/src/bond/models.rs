//! Models for the bond plugin.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BondStatus {
    Bonded,
    Unbonding,
}

/// A staking bond, bond increase, rebond or unbond.
#[derive(Debug, Clone, Serialize)]
pub struct Bond {
    /// `block_number-extrinsic_index`, unique.
    pub extrinsic_index: String,
    pub account: String,
    pub block_num: u64,
    pub amount: String,
    pub status: BondStatus,
    pub start_at: Option<DateTime<Utc>>,
    pub unbonding_at: Option<DateTime<Utc>>,
    pub unbonding_end: Option<DateTime<Utc>>,
    pub unbonding_block_end: Option<u64>,
}
