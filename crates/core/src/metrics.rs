//! Metrics definitions for the indexer.
//!
//! This module defines all metrics used throughout the indexer.
//! Metrics are collected using the `metrics` crate and can be exported
//! to Prometheus via `metrics-exporter-prometheus`.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Instant;

/// Initialize all metric descriptions.
/// Call this once at startup before any metrics are recorded.
pub fn init_metrics() {
    describe_counter!(
        "blocks_ingested_total",
        "Total number of blocks durably ingested"
    );
    describe_histogram!(
        "block_ingest_duration_seconds",
        "Time taken to fetch, decode and persist a block in seconds"
    );
    describe_counter!(
        "codec_errors_total",
        "Total number of blocks stored with a codec error"
    );
    describe_counter!(
        "ingest_failures_total",
        "Total number of failed ingest attempts, by pipeline stage"
    );
    describe_counter!(
        "plugin_errors_total",
        "Total number of non-duplicate plugin errors"
    );
    describe_counter!(
        "repair_rounds_total",
        "Total number of repair retry rounds, by phase"
    );
    describe_counter!(
        "reconnects_total",
        "Total number of explicit node reconnects"
    );
    describe_gauge!("chain_best_block", "Best block number reported by the node");
    describe_gauge!(
        "chain_finalized_block",
        "Finalized block number reported by the node"
    );
    describe_gauge!(
        "fill_finalized_block",
        "Highest contiguously ingested finalized block"
    );
}

/// Record a successfully ingested block.
pub fn record_block_ingested(finalized: bool) {
    counter!("blocks_ingested_total", "finalized" => finalized.to_string()).increment(1);
}

/// Record block ingest duration.
pub fn record_ingest_duration(duration_secs: f64) {
    histogram!("block_ingest_duration_seconds").record(duration_secs);
}

/// Record a block stored with `codec_error`.
pub fn record_codec_error() {
    counter!("codec_errors_total").increment(1);
}

/// Record a failed ingest attempt.
///
/// # Arguments
/// * `stage` - Pipeline stage that failed ("hash", "fetch", "runtime", "persist", ...)
pub fn record_ingest_failure(stage: &'static str) {
    counter!("ingest_failures_total", "stage" => stage).increment(1);
}

/// Record a plugin error that aborted a dispatch.
pub fn record_plugin_error(plugin: &str) {
    counter!("plugin_errors_total", "plugin" => plugin.to_string()).increment(1);
}

/// Record one repair retry round.
///
/// # Arguments
/// * `phase` - "blocks" or "plugins"
pub fn record_repair_round(phase: &'static str) {
    counter!("repair_rounds_total", "phase" => phase).increment(1);
}

/// Record an explicit reconnect to the node.
pub fn record_reconnect() {
    counter!("reconnects_total").increment(1);
}

/// Record the best head reported by the node.
pub fn set_best_block(number: u64) {
    gauge!("chain_best_block").set(number as f64);
}

/// Record the finalized head reported by the node.
pub fn set_finalized_block(number: u64) {
    gauge!("chain_finalized_block").set(number as f64);
}

/// Record the fill high-water mark.
pub fn set_fill_finalized_block(number: u64) {
    gauge!("fill_finalized_block").set(number as f64);
}

/// A timer that automatically records duration when dropped.
pub struct ProcessingTimer {
    start: Instant,
}

impl ProcessingTimer {
    /// Start a new processing timer.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for ProcessingTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessingTimer {
    fn drop(&mut self) {
        record_ingest_duration(self.start.elapsed().as_secs_f64());
    }
}
