//! Shared utilities for the built-in plugins.
//!
//! Parameter lookup, value parsing and the store cell every plugin keeps
//! its prefixed storage handle in.

use std::sync::{Arc, OnceLock};

use serde::Serialize;
use serde_json::Value as Json;
use tracing::warn;

use chainsight_core::error::{PluginError, PluginResult};
use chainsight_core::ports::PluginStore;

// =============================================================================
// Parameter lookup
// =============================================================================

/// Value of a call or event parameter.
///
/// Params are lists of `{ "name", "value" }` objects. The first entry whose
/// name is one of `names` wins; without a match the entry at `index` is
/// used. Plain objects keyed by field name are accepted too.
pub fn param<'a>(params: &'a Json, names: &[&str], index: usize) -> Option<&'a Json> {
    match params {
        Json::Array(list) => names
            .iter()
            .find_map(|name| {
                list.iter()
                    .find(|p| p.get("name").and_then(Json::as_str) == Some(*name))
            })
            .or_else(|| list.get(index))
            .and_then(|p| p.get("value")),
        Json::Object(map) => names.iter().find_map(|name| map.get(*name)),
        _ => None,
    }
}

/// Like [`param`], falling back to the last parameter.
///
/// Amounts trail the account fields in every staking event layout.
pub fn param_or_last<'a>(params: &'a Json, names: &[&str]) -> Option<&'a Json> {
    let last = params.as_array().map_or(0, |l| l.len().saturating_sub(1));
    param(params, names, last)
}

/// Number of parameters in a params list.
pub fn param_count(params: &Json) -> usize {
    params.as_array().map_or(0, Vec::len)
}

// =============================================================================
// Value parsing
// =============================================================================

/// Parse an address into `0x` hex.
///
/// Handles the representations the decoder produces for addresses:
/// - Hex string: `"0x1234..."` (32-byte accounts and 20-byte keys)
/// - Wrapped object: `{ "Id": "0x..." }`, `{ "Address20": "0x..." }`
/// - Array wrapper: `["0x..."]`
/// - Byte array: `[b0, b1, ..., b31]`
pub fn parse_address(value: &Json) -> Option<String> {
    match value {
        Json::String(s) => {
            let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s)).ok()?;
            matches!(bytes.len(), 20 | 32).then(|| format!("0x{}", hex::encode(bytes)))
        }
        Json::Object(obj) => ["Id", "id", "Address32", "Address20"]
            .iter()
            .find_map(|key| obj.get(*key))
            .and_then(parse_address),
        Json::Array(arr) if arr.len() == 1 => parse_address(&arr[0]),
        Json::Array(arr) if arr.len() == 32 => {
            let bytes: Option<Vec<u8>> = arr
                .iter()
                .map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect();
            bytes.map(|b| format!("0x{}", hex::encode(b)))
        }
        _ => None,
    }
}

/// Parse an amount (u128) from JSON.
///
/// Balances are rendered as decimal strings since JSON numbers stop at u64.
pub fn parse_amount(value: &Json) -> Option<u128> {
    match value {
        Json::Number(n) => n.as_u64().map(u128::from),
        Json::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Parse a u32 from JSON.
pub fn parse_u32(value: &Json) -> Option<u32> {
    match value {
        Json::Number(n) => n.as_u64().and_then(|v| v.try_into().ok()),
        Json::String(s) => s.parse().ok(),
        _ => None,
    }
}

// =============================================================================
// Storage
// =============================================================================

/// Holds the store handed over at registration.
#[derive(Default)]
pub struct StoreCell(OnceLock<Arc<dyn PluginStore>>);

impl StoreCell {
    pub fn set(&self, plugin: &'static str, store: Arc<dyn PluginStore>) {
        if self.0.set(store).is_err() {
            warn!(plugin, "Plugin store already set, keeping the first one");
        }
    }

    pub fn get(&self, plugin: &'static str) -> PluginResult<&dyn PluginStore> {
        self.0
            .get()
            .map(Arc::as_ref)
            .ok_or(PluginError::NotInitialized(plugin))
    }
}

/// Serialize `row` and insert it into the plugin table `name`.
pub async fn insert_row<T: Serialize>(
    store: &dyn PluginStore,
    name: &str,
    row: &T,
) -> PluginResult<()> {
    let value =
        serde_json::to_value(row).map_err(|e| PluginError::InvalidParams(e.to_string()))?;
    store.insert(&store.table(name), value).await?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_param_by_name_then_position() {
        let params = json!([
            {"name": "dest", "type": "MultiAddress", "value": "0xaa"},
            {"name": "value", "type": "Compact<u128>", "value": "1000"}
        ]);
        assert_eq!(param(&params, &["value"], 0), Some(&json!("1000")));
        // Aucun nom ne correspond: repli sur la position
        assert_eq!(param(&params, &["amount"], 0), Some(&json!("0xaa")));
        assert_eq!(param(&params, &["amount"], 5), None);
    }

    #[test]
    fn test_param_or_last() {
        let params = json!([
            {"name": "", "value": "0xaa"},
            {"name": "", "value": "42"}
        ]);
        assert_eq!(param_or_last(&params, &["amount"]), Some(&json!("42")));
        assert_eq!(param_count(&params), 2);
        assert_eq!(param_or_last(&json!([]), &["amount"]), None);
    }

    #[test]
    fn test_param_on_object() {
        let params = json!({"who": "0xbb"});
        assert_eq!(param(&params, &["stash", "who"], 0), Some(&json!("0xbb")));
    }

    #[test]
    fn test_parse_address_formats() {
        let hex = "0x".to_string() + &"ab".repeat(32);
        assert_eq!(parse_address(&json!(hex)), Some(hex.clone()));
        assert_eq!(parse_address(&json!({"Id": hex})), Some(hex.clone()));
        assert_eq!(parse_address(&json!([hex])), Some(hex.clone()));

        let eth = "0x".to_string() + &"12".repeat(20);
        assert_eq!(parse_address(&json!({"Address20": eth})), Some(eth));

        let bytes: Vec<u8> = vec![0xab; 32];
        assert_eq!(parse_address(&json!(bytes)), Some(hex));
    }

    #[test]
    fn test_parse_address_rejects_invalid() {
        assert!(parse_address(&json!("0x1234")).is_none());
        assert!(parse_address(&json!("not_valid_hex")).is_none());
        assert!(parse_address(&json!({"Index": "3"})).is_none());
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount(&json!(12345)), Some(12345));
        let large = "340282366920938463463374607431768211455"; // u128::MAX
        assert_eq!(parse_amount(&json!(large)), Some(u128::MAX));
        assert_eq!(parse_amount(&json!(true)), None);
    }

    #[test]
    fn test_parse_u32() {
        assert_eq!(parse_u32(&json!("7")), Some(7));
        assert!(parse_u32(&json!(u64::MAX)).is_none());
    }
}
