//! Substrate JSON-RPC client.
//!
//! One WebSocket carries both request/response calls and the head
//! subscriptions. The transport can be replaced in place by
//! [`ChainRpc::reconnect`]; in-flight callers keep their clone of the old
//! client until they finish.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use subxt::backend::rpc::{RpcClient, RpcParams, rpc_params};
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace, warn};

use chainsight_core::error::{ChainError, ChainResult};
use chainsight_core::models::{AccountId, BlockHash};
use chainsight_core::ports::{
    ChainBlock, ChainHeader, ChainNotification, ChainRpc, NotificationStream, RuntimeVersionInfo,
};

use crate::convert::{decode_account_list, decode_hex};

/// `twox128("Session") ++ twox128("Validators")`.
pub const SESSION_VALIDATORS_KEY: &str =
    "0xcec5070d609dd3497f72bde07fc96ba088dcde934c658227ee1dfafcd6e16903";

/// Configuration for the Substrate client.
#[derive(Debug, Clone)]
pub struct SubstrateClientConfig {
    /// WebSocket URL (e.g., "ws://localhost:9944").
    pub ws_url: String,
    /// Upper bound on a single request.
    pub request_timeout: Duration,
    /// Storage key of the session validator set.
    pub validators_key: String,
}

impl Default for SubstrateClientConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:9944".to_string(),
            request_timeout: Duration::from_secs(30),
            validators_key: SESSION_VALIDATORS_KEY.to_string(),
        }
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeaderReply {
    parent_hash: String,
    number: String,
    state_root: String,
    extrinsics_root: String,
    #[serde(default)]
    digest: DigestReply,
}

#[derive(Debug, Default, Deserialize)]
struct DigestReply {
    #[serde(default)]
    logs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BlockReply {
    header: HeaderReply,
    extrinsics: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SignedBlockReply {
    block: BlockReply,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeVersionReply {
    spec_version: u32,
    impl_name: String,
}

impl From<RuntimeVersionReply> for RuntimeVersionInfo {
    fn from(reply: RuntimeVersionReply) -> Self {
        RuntimeVersionInfo {
            spec_version: reply.spec_version,
            impl_name: reply.impl_name,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeeInfoReply {
    partial_fee: serde_json::Value,
}

/// Parse a `0x`-prefixed hex quantity such as a header number.
pub fn parse_hex_number(s: &str) -> Option<u64> {
    u64::from_str_radix(s.strip_prefix("0x").unwrap_or(s), 16).ok()
}

fn parse_hash(s: &str, what: &str) -> ChainResult<BlockHash> {
    BlockHash::from_hex(s).map_err(|e| ChainError::RpcError(format!("{what}: {e}")))
}

/// `partialFee` is a decimal string on current nodes and a number on old ones.
fn parse_fee(value: &serde_json::Value) -> ChainResult<u128> {
    let parsed = match value {
        serde_json::Value::String(s) if s.starts_with("0x") => {
            u128::from_str_radix(&s[2..], 16).ok()
        }
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_u64().map(u128::from),
        _ => None,
    };
    parsed.ok_or_else(|| ChainError::RpcError(format!("invalid partialFee: {value}")))
}

impl HeaderReply {
    fn into_header(self) -> ChainResult<ChainHeader> {
        Ok(ChainHeader {
            number: parse_hex_number(&self.number)
                .ok_or_else(|| ChainError::RpcError(format!("invalid number {}", self.number)))?,
            parent_hash: parse_hash(&self.parent_hash, "parentHash")?,
            state_root: parse_hash(&self.state_root, "stateRoot")?,
            extrinsics_root: parse_hash(&self.extrinsics_root, "extrinsicsRoot")?,
            digest_logs: self.digest.logs,
        })
    }
}

/// Messages that indicate the socket itself is gone.
fn is_transport_failure(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["restart", "connection", "closed", "transport", "background task"]
        .iter()
        .any(|needle| message.contains(needle))
}

// =============================================================================
// Client
// =============================================================================

/// Substrate client adapter implementing the [`ChainRpc`] port.
pub struct SubstrateRpc {
    config: SubstrateClientConfig,
    client: RwLock<RpcClient>,
    connected: Arc<AtomicBool>,
}

impl SubstrateRpc {
    /// Connect to a Substrate node.
    #[instrument(skip_all, fields(url = %config.ws_url))]
    pub async fn connect(config: SubstrateClientConfig) -> ChainResult<Self> {
        debug!("Connecting to node");

        let client = RpcClient::from_url(&config.ws_url)
            .await
            .map_err(|e| ChainError::ConnectionFailed(e.to_string()))?;

        debug!("Connected successfully");

        Ok(Self {
            config,
            client: RwLock::new(client),
            connected: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn config(&self) -> &SubstrateClientConfig {
        &self.config
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, params: RpcParams) -> ChainResult<R> {
        let client = self.client.read().await.clone();
        trace!(method, "RPC request");

        let timeout = self.config.request_timeout;
        match tokio::time::timeout(timeout, client.request::<R>(method, params)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                let message = e.to_string();
                if is_transport_failure(&message) {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(ChainError::NotConnected);
                }
                Err(ChainError::RpcError(format!("{method}: {message}")))
            }
            Err(_) => Err(ChainError::Timeout(timeout.as_millis() as u64)),
        }
    }

    async fn subscription<R>(
        &self,
        client: &RpcClient,
        subscribe: &str,
        unsubscribe: &str,
    ) -> ChainResult<stream::BoxStream<'static, ChainResult<R>>>
    where
        R: DeserializeOwned + Send + 'static,
    {
        let sub = client
            .subscribe::<R>(subscribe, rpc_params![], unsubscribe)
            .await
            .map_err(|e| ChainError::SubscriptionError(format!("{subscribe}: {e}")))?;
        Ok(sub
            .map(|item| item.map_err(|e| ChainError::SubscriptionError(e.to_string())))
            .boxed())
    }
}

#[async_trait]
impl ChainRpc for SubstrateRpc {
    async fn block_hash(&self, number: u64) -> ChainResult<Option<BlockHash>> {
        let hash: Option<String> = self.call("chain_getBlockHash", rpc_params![number]).await?;
        hash.map(|h| parse_hash(&h, "blockHash")).transpose()
    }

    async fn block(&self, hash: &BlockHash) -> ChainResult<Option<ChainBlock>> {
        let reply: Option<SignedBlockReply> = self
            .call("chain_getBlock", rpc_params![hash.to_hex()])
            .await
            .map_err(|e| match e {
                ChainError::RpcError(message) => ChainError::BlockFetchError {
                    hash: hash.to_hex(),
                    message,
                },
                other => other,
            })?;

        reply
            .map(|signed| {
                Ok(ChainBlock {
                    header: signed.block.header.into_header()?,
                    extrinsics: signed.block.extrinsics,
                })
            })
            .transpose()
    }

    async fn storage(&self, key: &str, at: &BlockHash) -> ChainResult<Option<String>> {
        self.call("state_getStorage", rpc_params![key, at.to_hex()])
            .await
    }

    async fn runtime_version(
        &self,
        at: Option<&BlockHash>,
    ) -> ChainResult<Option<RuntimeVersionInfo>> {
        let params = match at {
            Some(hash) => rpc_params![hash.to_hex()],
            None => rpc_params![],
        };
        let reply: Option<RuntimeVersionReply> =
            self.call("state_getRuntimeVersion", params).await?;
        Ok(reply.map(Into::into))
    }

    async fn metadata(&self, at: &BlockHash) -> ChainResult<String> {
        self.call("state_getMetadata", rpc_params![at.to_hex()])
            .await
            .map_err(|e| ChainError::MetadataError(e.to_string()))
    }

    async fn query_fee(&self, extrinsic_hex: &str, at: &BlockHash) -> ChainResult<u128> {
        let reply: FeeInfoReply = self
            .call("payment_queryInfo", rpc_params![extrinsic_hex, at.to_hex()])
            .await?;
        parse_fee(&reply.partial_fee)
    }

    async fn validators(&self, at: &BlockHash) -> ChainResult<Vec<AccountId>> {
        let Some(raw) = self.storage(&self.config.validators_key, at).await? else {
            return Ok(Vec::new());
        };
        let bytes = decode_hex(&raw).map_err(|e| ChainError::RpcError(e.to_string()))?;
        let accounts = decode_account_list(&bytes)
            .map_err(|e| ChainError::RpcError(format!("Session.Validators: {e}")))?;
        Ok(accounts.into_iter().map(AccountId).collect())
    }

    async fn health(&self) -> ChainResult<()> {
        let _: serde_json::Value = self.call("system_health", rpc_params![]).await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn subscribe(&self) -> ChainResult<NotificationStream> {
        let client = self.client.read().await.clone();

        let versions = self
            .subscription::<RuntimeVersionReply>(
                &client,
                "state_subscribeRuntimeVersion",
                "state_unsubscribeRuntimeVersion",
            )
            .await?
            .map(|item| item.map(|v| ChainNotification::RuntimeVersion(v.into())))
            .boxed();

        let heads = self
            .subscription::<HeaderReply>(
                &client,
                "chain_subscribeNewHeads",
                "chain_unsubscribeNewHeads",
            )
            .await?
            .map(|item| {
                item.and_then(|h| h.into_header())
                    .map(|h| ChainNotification::NewHead(h.number))
            })
            .boxed();

        let finalized = self
            .subscription::<HeaderReply>(
                &client,
                "chain_subscribeFinalizedHeads",
                "chain_unsubscribeFinalizedHeads",
            )
            .await?
            .map(|item| {
                item.and_then(|h| h.into_header())
                    .map(|h| ChainNotification::FinalizedHead(h.number))
            })
            .boxed();

        self.connected.store(true, Ordering::SeqCst);
        debug!("📡 Subscribed to runtime version, new heads and finalized heads");

        let connected = self.connected.clone();
        let merged = stream::select_all([versions, heads, finalized]).chain(
            stream::once(async move {
                // All subscriptions ended: the socket is gone
                connected.store(false, Ordering::SeqCst);
            })
            .filter_map(|_| async { None::<ChainResult<ChainNotification>> }),
        );
        Ok(Box::pin(merged))
    }

    #[instrument(skip_all, fields(url = %self.config.ws_url))]
    async fn reconnect(&self) -> ChainResult<()> {
        match RpcClient::from_url(&self.config.ws_url).await {
            Ok(client) => {
                *self.client.write().await = client;
                self.connected.store(true, Ordering::SeqCst);
                debug!("Transport re-established");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Reconnect failed");
                self.connected.store(false, Ordering::SeqCst);
                Err(ChainError::ConnectionFailed(e.to_string()))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_numbers_are_hex() {
        assert_eq!(parse_hex_number("0x1b4"), Some(436));
        assert_eq!(parse_hex_number("0x0"), Some(0));
        assert_eq!(parse_hex_number("zz"), None);
    }

    #[test]
    fn header_reply_converts() {
        let zero = format!("0x{}", "00".repeat(32));
        let raw = serde_json::json!({
            "parentHash": zero,
            "number": "0x10",
            "stateRoot": zero,
            "extrinsicsRoot": zero,
            "digest": { "logs": ["0x0661757261"] }
        });
        let header: HeaderReply = serde_json::from_value(raw).unwrap();
        let header = header.into_header().unwrap();
        assert_eq!(header.number, 16);
        assert_eq!(header.digest_logs.len(), 1);
    }

    #[test]
    fn header_without_digest_is_accepted() {
        let zero = format!("0x{}", "11".repeat(32));
        let raw = serde_json::json!({
            "parentHash": zero,
            "number": "0x1",
            "stateRoot": zero,
            "extrinsicsRoot": zero,
        });
        let header: HeaderReply = serde_json::from_value(raw).unwrap();
        assert!(header.into_header().unwrap().digest_logs.is_empty());
    }

    #[test]
    fn fees_parse_in_every_encoding() {
        assert_eq!(parse_fee(&serde_json::json!("159200000")).unwrap(), 159_200_000);
        assert_eq!(parse_fee(&serde_json::json!(42)).unwrap(), 42);
        assert_eq!(parse_fee(&serde_json::json!("0x10")).unwrap(), 16);
        assert!(parse_fee(&serde_json::json!(null)).is_err());
    }

    #[test]
    fn runtime_version_reply_ignores_extra_fields() {
        let raw = serde_json::json!({
            "specName": "polkadot",
            "implName": "parity-polkadot",
            "specVersion": 1_002_000,
            "apis": []
        });
        let info: RuntimeVersionInfo = serde_json::from_value::<RuntimeVersionReply>(raw)
            .unwrap()
            .into();
        assert_eq!(info.spec_version, 1_002_000);
        assert_eq!(info.impl_name, "parity-polkadot");
    }

    #[test]
    fn transport_failures_are_recognised() {
        assert!(is_transport_failure("The background task closed connection closed; restart required"));
        assert!(!is_transport_failure("Method not found"));
    }
}
