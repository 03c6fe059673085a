//! Error taxonomy of the indexer.
//!
//! Transport failures ([`ChainError`]) are retried by whoever asked for the
//! block. Decode failures ([`DomainError`]) end up as a `codec_error` flag on
//! the block row. Write failures ([`StorageError`]) roll back the block's
//! transaction. Plugin failures ([`PluginError`]) abort dispatch of one block
//! unless they are duplicate-key errors.
//!
//! [`IndexerError`] wraps all of them for the services and the binary.

use thiserror::Error;

// =============================================================================
// Domain Errors
// =============================================================================

/// Decoding and domain rule violations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// Block was not found in storage.
    #[error("Block not found: {0}")]
    BlockNotFound(u64),

    /// Block hash failed validation.
    #[error("Invalid block hash: {0}")]
    InvalidBlockHash(String),

    /// Data decoding/deserialization failed.
    #[error("Decoding error: {0}")]
    DecodingError(String),

    /// The decoder panicked on the input.
    ///
    /// The block cannot currently be decoded with the known metadata.
    #[error("Decoder panicked: {0}")]
    DecoderPanic(String),

    /// Generic validation error.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

// =============================================================================
// Storage Errors
// =============================================================================

/// Database and repository errors.
///
/// These errors originate from storage operations like queries,
/// transactions, and data serialization.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Failed to establish database connection.
    #[error("Database connection error: {0}")]
    ConnectionError(String),

    /// SQL query execution failed.
    #[error("Query execution error: {0}")]
    QueryError(String),

    /// Requested record was not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Database constraint was violated (unique, foreign key, etc.).
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Database migration failed.
    #[error("Migration error: {0}")]
    MigrationError(String),

    /// Transaction commit/rollback failed.
    #[error("Transaction error: {0}")]
    TransactionError(String),

    /// Data serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A plugin tried to alter one of the shared chain tables.
    #[error("Table {0} is protected")]
    ProtectedTable(String),
}

impl StorageError {
    /// Whether this error is a unique-key violation.
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            StorageError::ConstraintViolation(_) => true,
            StorageError::QueryError(msg) => mentions_duplicate_key(msg),
            _ => false,
        }
    }
}

// =============================================================================
// Chain Errors
// =============================================================================

/// Blockchain RPC and connectivity errors.
///
/// These errors occur when communicating with the Substrate node
/// via WebSocket RPC.
#[derive(Debug, Error)]
pub enum ChainError {
    /// WebSocket connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The transport is currently disconnected.
    #[error("Not connected to node")]
    NotConnected,

    /// RPC request failed.
    #[error("RPC error: {0}")]
    RpcError(String),

    /// Head subscription failed or disconnected.
    #[error("Subscription error: {0}")]
    SubscriptionError(String),

    /// Runtime metadata could not be fetched or parsed.
    #[error("Metadata error: {0}")]
    MetadataError(String),

    /// Block could not be fetched.
    #[error("Block fetch error at hash {hash}: {message}")]
    BlockFetchError {
        /// Block hash that failed to fetch.
        hash: String,
        /// Error details.
        message: String,
    },

    /// Request timed out.
    #[error("Request timed out after {0} ms")]
    Timeout(u64),
}

impl ChainError {
    /// Whether this error comes from the transport rather than the node.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ChainError::ConnectionFailed(_) | ChainError::NotConnected | ChainError::Timeout(_)
        )
    }
}

// =============================================================================
// Plugin Errors
// =============================================================================

/// Errors returned by plugins.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Plugin storage failed.
    #[error("Plugin storage error: {0}")]
    Storage(#[from] StorageError),

    /// Record parameters did not have the expected shape.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Plugin was used before its store was handed over.
    #[error("Plugin {0} is not initialized")]
    NotInitialized(&'static str),
}

impl PluginError {
    /// Whether the error means the record was already written.
    ///
    /// Replaying a block must not fail on rows a previous dispatch created.
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            PluginError::Storage(e) => e.is_duplicate_key(),
            other => mentions_duplicate_key(&other.to_string()),
        }
    }
}

fn mentions_duplicate_key(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("duplicate key") || msg.contains("duplicate entry")
}

// =============================================================================
// Indexer Errors
// =============================================================================

/// Top-level indexer orchestration errors.
///
/// This is the main error type returned by the services. It wraps all
/// lower-level errors and adds indexer-specific variants.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Domain logic error.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Storage/database error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Blockchain connectivity error.
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The node returned no hash for this block number.
    #[error("Block hash unavailable for block {0}")]
    BlockHashUnavailable(u64),

    /// No spec version could be determined for the block.
    #[error("No runtime metadata for block {0}")]
    NoRuntimeMetadata(u64),

    /// The decoder cannot handle this block.
    #[error("Block {block} cannot be decoded: {message}")]
    Undecodable {
        /// Block number.
        block: u64,
        /// Decoder message.
        message: String,
    },

    /// A plugin failed with a non-duplicate error.
    #[error("Plugin {plugin} failed on block {block}: {source}")]
    Plugin {
        /// Plugin name.
        plugin: String,
        /// Block number being dispatched.
        block: u64,
        /// Underlying plugin error.
        #[source]
        source: PluginError,
    },

    /// Repair hit its retry ceiling with blocks left incomplete.
    #[error("Repair exhausted retries with {unresolved} unresolved block(s)")]
    RepairExhausted {
        /// Number of blocks still incomplete.
        unresolved: usize,
    },

    /// Graceful shutdown was requested.
    ///
    /// This is not really an error but uses the error type for control flow.
    #[error("Indexer shutdown requested")]
    ShutdownRequested,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for indexer operations.
pub type IndexerResult<T> = Result<T, IndexerError>;

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_errors_keep_their_cause() {
        // Un échec de persistance remonte avec le message SQL d'origine
        let err: IndexerError = DomainError::from(StorageError::TransactionError(
            "could not serialize access".into(),
        ))
        .into();
        assert!(err.to_string().contains("could not serialize access"));

        let err: IndexerError = ChainError::BlockFetchError {
            hash: "0xab".into(),
            message: "unknown block".into(),
        }
        .into();
        assert!(err.to_string().contains("0xab"));
    }

    #[test]
    fn test_duplicate_key_detection() {
        let typed = PluginError::Storage(StorageError::ConstraintViolation("uq".into()));
        assert!(typed.is_duplicate_key());

        let postgres = PluginError::Storage(StorageError::QueryError(
            "duplicate key value violates unique constraint \"transfers_pkey\"".into(),
        ));
        assert!(postgres.is_duplicate_key());

        let mysql_style = PluginError::InvalidParams("Error 1062: Duplicate entry '5-2'".into());
        assert!(mysql_style.is_duplicate_key());

        let other = PluginError::Storage(StorageError::QueryError("syntax error".into()));
        assert!(!other.is_duplicate_key());
    }

    #[test]
    fn test_transport_errors() {
        assert!(ChainError::NotConnected.is_transport());
        assert!(ChainError::Timeout(500).is_transport());
        assert!(!ChainError::RpcError("bad params".into()).is_transport());
    }

    #[test]
    fn test_plugin_error_names_plugin_and_block() {
        let err = IndexerError::Plugin {
            plugin: "transfers".into(),
            block: 42,
            source: PluginError::InvalidParams("dest".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("transfers") && msg.contains("42"));
    }
}
