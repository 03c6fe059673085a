//! SCALE value to JSON conversion and small SCALE readers.

use serde_json::{Map, Value as Json};
use subxt::ext::codec::{Compact, Decode};
use subxt::ext::scale_value::{Composite, Primitive, Value, ValueDef};

/// Convert a decoded value to JSON.
///
/// Byte arrays become `0x` hex strings, `Option` is flattened and other
/// enum variants become `{ "Variant": inner }`. Integers are rendered as
/// decimal strings so `u128` balances survive.
pub fn to_json<T>(value: &Value<T>) -> Json {
    match &value.value {
        ValueDef::Composite(composite) => composite_to_json(composite),
        ValueDef::Variant(variant) => {
            let inner = composite_to_json(&variant.values);
            match variant.name.as_str() {
                "None" => Json::Null,
                "Some" | "Id" => inner,
                name => {
                    let mut map = Map::new();
                    map.insert(name.to_string(), inner);
                    Json::Object(map)
                }
            }
        }
        ValueDef::Primitive(primitive) => primitive_to_json(primitive),
        ValueDef::BitSequence(bits) => Json::String(format!("{bits:?}")),
    }
}

fn composite_to_json<T>(composite: &Composite<T>) -> Json {
    match composite {
        Composite::Unnamed(values) => {
            if let Some(bytes) = byte_array(values) {
                return Json::String(format!("0x{}", hex::encode(bytes)));
            }
            // Newtype wrappers
            if values.len() == 1 {
                return to_json(&values[0]);
            }
            Json::Array(values.iter().map(to_json).collect())
        }
        Composite::Named(fields) => Json::Object(
            fields
                .iter()
                .map(|(name, v)| (name.clone(), to_json(v)))
                .collect(),
        ),
    }
}

fn primitive_to_json(primitive: &Primitive) -> Json {
    match primitive {
        Primitive::Bool(b) => Json::Bool(*b),
        Primitive::Char(c) => Json::String(c.to_string()),
        Primitive::String(s) => Json::String(s.clone()),
        Primitive::U128(n) => Json::String(n.to_string()),
        Primitive::I128(n) => Json::String(n.to_string()),
        Primitive::U256(n) => Json::String(format!("0x{}", hex::encode(n))),
        Primitive::I256(n) => Json::String(format!("0x{}", hex::encode(n))),
    }
}

/// Interpret an unnamed composite of `u8` primitives as raw bytes.
///
/// Only lengths of hashes, keys and signatures qualify, so short integer
/// tuples stay numeric.
fn byte_array<T>(values: &[Value<T>]) -> Option<Vec<u8>> {
    if !matches!(values.len(), 20 | 32 | 33 | 64 | 65) {
        return None;
    }
    values
        .iter()
        .map(|v| match &v.value {
            ValueDef::Primitive(Primitive::U128(n)) => u8::try_from(*n).ok(),
            _ => None,
        })
        .collect()
}

/// First 32-byte array found in the value, depth first.
///
/// Finds the account inside `MultiAddress::Id(AccountId32([u8; 32]))` and
/// plain `AccountId32` addresses alike.
pub fn find_account<T>(value: &Value<T>) -> Option<[u8; 32]> {
    let values: Vec<&Value<T>> = match &value.value {
        ValueDef::Composite(c) => c.values().collect(),
        ValueDef::Variant(v) => v.values.values().collect(),
        _ => return None,
    };

    if values.len() == 32 {
        let bytes: Option<Vec<u8>> = values
            .iter()
            .map(|v| match &v.value {
                ValueDef::Primitive(Primitive::U128(n)) => u8::try_from(*n).ok(),
                _ => None,
            })
            .collect();
        if let Some(bytes) = bytes {
            return bytes.try_into().ok();
        }
    }
    values.into_iter().find_map(find_account)
}

/// Unsigned integer held by the value, looking through newtype wrappers.
pub fn find_u128<T>(value: &Value<T>) -> Option<u128> {
    match &value.value {
        ValueDef::Primitive(Primitive::U128(n)) => Some(*n),
        ValueDef::Composite(c) if c.len() == 1 => c.values().next().and_then(find_u128),
        _ => None,
    }
}

/// Named field of a composite value.
pub fn field<'a, T>(value: &'a Value<T>, name: &str) -> Option<&'a Value<T>> {
    match &value.value {
        ValueDef::Composite(Composite::Named(fields)) => {
            fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
        }
        _ => None,
    }
}

/// Strip an optional `0x` and hex-decode.
pub fn decode_hex(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(s.strip_prefix("0x").unwrap_or(s))
}

/// SCALE `Vec<[u8; 32]>`, as stored under `Session.Validators`.
pub fn decode_account_list(bytes: &[u8]) -> Result<Vec<[u8; 32]>, String> {
    let input = &mut &bytes[..];
    let Compact(count) = Compact::<u32>::decode(input).map_err(|e| e.to_string())?;
    let expected = count as usize * 32;
    if input.len() != expected {
        return Err(format!(
            "expected {expected} bytes for {count} accounts, got {}",
            input.len()
        ));
    }
    Ok(input
        .chunks_exact(32)
        .filter_map(|chunk| chunk.try_into().ok())
        .collect())
}
