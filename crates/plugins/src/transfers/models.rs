//! Models for the transfers plugin.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A balance transfer extrinsic.
#[derive(Debug, Clone, Serialize)]
pub struct Transfer {
    /// `block_number-extrinsic_index`, unique.
    pub extrinsic_index: String,
    pub extrinsic_hash: Option<String>,
    pub block_num: u64,
    pub block_timestamp: Option<DateTime<Utc>>,
    /// Call name (e.g., "transfer_keep_alive").
    pub call: String,
    pub from_addr: String,
    pub to_addr: String,
    /// Amount in the smallest unit, as a decimal string.
    pub amount: String,
    pub fee: String,
    pub success: bool,
}
