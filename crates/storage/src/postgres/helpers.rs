//! Conversion helpers shared by the Postgres adapters.

use chainsight_core::error::StorageError;
use chainsight_core::error::StorageResult;

/// SQLSTATE for `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

/// Map a sqlx error, keeping unique violations typed.
pub(crate) fn db_error(e: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &e
        && db.code().as_deref() == Some(UNIQUE_VIOLATION)
    {
        return StorageError::ConstraintViolation(db.message().to_string());
    }
    StorageError::QueryError(e.to_string())
}

pub(crate) fn tx_error(e: sqlx::Error) -> StorageError {
    StorageError::TransactionError(e.to_string())
}

/// Convert a byte vector to a 32-byte array.
pub(crate) fn bytes_to_hash32(bytes: Vec<u8>, field: &str) -> StorageResult<[u8; 32]> {
    bytes.try_into().map_err(|v: Vec<u8>| {
        StorageError::SerializationError(format!(
            "{field}: expected 32 bytes, got {}",
            v.len()
        ))
    })
}

pub(crate) fn bytes_to_optional_hash32(
    bytes: Option<Vec<u8>>,
    field: &str,
) -> StorageResult<Option<[u8; 32]>> {
    bytes.map(|b| bytes_to_hash32(b, field)).transpose()
}

/// Parse a `NUMERIC` column read back as text.
pub(crate) fn parse_u128(text: &str, field: &str) -> StorageResult<u128> {
    text.parse()
        .map_err(|_| StorageError::SerializationError(format!("{field}: invalid amount {text:?}")))
}

pub(crate) fn to_i64(value: u64, field: &str) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::SerializationError(format!("{field}: {value} out of range")))
}

/// Whether `name` can be spliced into SQL as a bare identifier.
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_length_hash_is_rejected() {
        let err = bytes_to_hash32(vec![1; 20], "block.hash").unwrap_err();
        assert!(err.to_string().contains("block.hash"));
        assert!(bytes_to_hash32(vec![1; 32], "block.hash").is_ok());
    }

    #[test]
    fn amounts_above_u64_parse() {
        assert_eq!(
            parse_u128("340282366920938463463374607431768211455", "fee").unwrap(),
            u128::MAX
        );
        assert!(parse_u128("1.5", "fee").is_err());
    }

    #[test]
    fn identifiers_are_strict() {
        assert!(is_identifier("transfers_transfers"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier("Transfers"));
        assert!(!is_identifier("a; DROP TABLE blocks"));
        assert!(!is_identifier(""));
    }
}
