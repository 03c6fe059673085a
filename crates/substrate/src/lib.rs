//! Substrate adapters for the chainsight indexer.
//!
//! This crate implements two ports from `chainsight-core`:
//!
//! - [`ChainRpc`] over a JSON-RPC WebSocket ([`SubstrateRpc`])
//! - [`BlockDecoder`] on top of runtime metadata ([`ScaleDecoder`])
//!
//! # Usage
//!
//! ```ignore
//! use chainsight_substrate::{ScaleDecoder, SubstrateClientConfig, SubstrateRpc};
//!
//! let rpc = SubstrateRpc::connect(SubstrateClientConfig {
//!     ws_url: "ws://localhost:9944".to_string(),
//!     ..Default::default()
//! })
//! .await?;
//! let mut heads = rpc.subscribe().await?;
//! ```
//!
//! The decoder keeps one parsed metadata per spec version, so decoding a
//! block only pays the metadata parse once per runtime upgrade.
//!
//! [`ChainRpc`]: chainsight_core::ports::ChainRpc
//! [`BlockDecoder`]: chainsight_core::ports::BlockDecoder

mod client;
mod convert;
mod decoder;

pub use client::{SESSION_VALIDATORS_KEY, SubstrateClientConfig, SubstrateRpc};
pub use decoder::{ScaleDecoder, decode_digest_item};
