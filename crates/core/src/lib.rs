//! Core domain layer for the chainsight indexer.
//!
//! This crate contains the domain models, port traits (interfaces), and
//! services of the Substrate chain indexer. It is the innermost layer and
//! has no dependency on the database or the node client.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    chainsight (binary)                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  chainsight-plugins   │   chainsight-substrate              │
//! │  (transfers, bond...) │   (RPC client, SCALE decoder)       │
//! ├───────────────────────┴─────────────────────────────────────┤
//! │                   chainsight-storage                        │
//! │                     (PostgreSQL)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │                 chainsight-core  ← YOU ARE HERE             │
//! │               (models, ports, services)                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`models`] - Domain models (Block, Extrinsic, Event, Log, RuntimeVersion)
//! - [`ports`] - Interface traits for adapters to implement
//! - [`services`] - Ingestion, catch-up, subscriber, repair and plugin dispatch
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus metrics definitions
//!
//! # Key Concepts
//!
//! ## Counters
//!
//! The chain-reported heads (`blockNum`, `finalized_blockNum`) are written
//! only by the subscriber. The fill counters (`FillAlreadyBlockNum`,
//! `FillFinalizedBlockNum`) move only after a block is durably stored; the
//! finalized one is the high-water mark of *contiguous* completeness and is
//! what plugins follow.
//!
//! ## Plugins
//!
//! A [`ports::Plugin`] subscribes to module names. After a block is stored
//! and finalized, the [`services::PluginDispatcher`] replays its extrinsics
//! and events to every subscribed plugin. Replays are idempotent: duplicate
//! key errors from plugin tables are treated as "already processed".
//!
//! ## Lifecycle
//!
//! 1. Subscribe to runtime version, new heads and finalized heads
//! 2. Each finalized head wakes the fill loop (collapsed, started once)
//! 3. The fill loop ingests `[fill + 1, finalized - margin]` on a worker pool
//! 4. The fill counter advances over the contiguous successful prefix
//! 5. The plugin loop dispatches blocks behind the fill counter

pub mod error;
pub mod metrics;
pub mod models;
pub mod ports;
pub mod services;
