//! Repair / backfill engine.
//!
//! Converges a window of block numbers to "fully ingested" independently
//! of the live subscriber, then replays the repaired blocks to plugins.
//! Both phases retry up to a fixed ceiling; whatever is still incomplete
//! afterwards is reported, never silently marked done.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::error::{IndexerError, IndexerResult};
use crate::metrics::record_repair_round;
use crate::ports::{BlockStore, Daemon, MetadataStore};
use crate::services::{BlockIngestor, IngestOutcome, PluginDispatcher, WorkerPool};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct RepairConfig {
    /// Blocks per page.
    pub page_size: u64,
    /// Retry ceiling for each convergence loop.
    pub max_retries: u32,
    pub block_workers: usize,
    pub plugin_workers: usize,
    /// Pause between retry rounds.
    pub round_delay: Duration,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_retries: 1_000,
            block_workers: 16,
            plugin_workers: 8,
            round_delay: Duration::from_millis(200),
        }
    }
}

// =============================================================================
// Completion Map
// =============================================================================

/// Block number → "is complete", local to one page of one repair run.
#[derive(Debug, Default)]
pub struct CompletionMap {
    inner: Mutex<BTreeMap<u64, bool>>,
}

impl CompletionMap {
    pub fn new(entries: impl IntoIterator<Item = (u64, bool)>) -> Self {
        Self {
            inner: Mutex::new(entries.into_iter().collect()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, bool>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn mark(&self, number: u64, complete: bool) {
        self.lock().insert(number, complete);
    }

    /// Incomplete block numbers, ascending.
    pub fn incomplete(&self) -> Vec<u64> {
        self.lock()
            .iter()
            .filter(|(_, done)| !**done)
            .map(|(n, _)| *n)
            .collect()
    }

    /// Complete block numbers, ascending.
    pub fn complete(&self) -> Vec<u64> {
        self.lock()
            .iter()
            .filter(|(_, done)| **done)
            .map(|(n, _)| *n)
            .collect()
    }
}

// =============================================================================
// Report
// =============================================================================

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RepairReport {
    pub pages: usize,
    /// Blocks found incomplete and then ingested.
    pub repaired: usize,
    /// Blocks the decoder cannot handle; done without data.
    pub skipped: Vec<u64>,
    /// Blocks still incomplete after the retry ceiling.
    pub unresolved_blocks: Vec<u64>,
    /// Blocks whose plugin dispatch never succeeded.
    pub unresolved_plugins: Vec<u64>,
    pub dispatched: usize,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.unresolved_blocks.is_empty() && self.unresolved_plugins.is_empty()
    }

    /// Turn unresolved blocks into [`IndexerError::RepairExhausted`].
    pub fn into_result(self) -> IndexerResult<Self> {
        if self.is_clean() {
            Ok(self)
        } else {
            Err(IndexerError::RepairExhausted {
                unresolved: self.unresolved_blocks.len() + self.unresolved_plugins.len(),
            })
        }
    }
}

/// Pages of at most `page_size` numbers covering `[head - size, head]`, highest first.
pub fn pages(head: u64, size: u64, page_size: u64) -> Vec<RangeInclusive<u64>> {
    let page_size = page_size.max(1);
    let low = head.saturating_sub(size);
    let mut pages = Vec::new();
    let mut high = head;
    loop {
        let start = high.saturating_sub(page_size - 1).max(low);
        pages.push(start..=high);
        if start == low {
            break;
        }
        high = start - 1;
    }
    pages
}

// =============================================================================
// RepairEngine
// =============================================================================

pub struct RepairEngine {
    ingestor: Arc<BlockIngestor>,
    dispatcher: Option<Arc<PluginDispatcher>>,
    blocks: Arc<dyn BlockStore>,
    meta: Arc<dyn MetadataStore>,
    config: RepairConfig,
}

impl RepairEngine {
    pub fn new(
        ingestor: Arc<BlockIngestor>,
        dispatcher: Option<Arc<PluginDispatcher>>,
        blocks: Arc<dyn BlockStore>,
        meta: Arc<dyn MetadataStore>,
        config: RepairConfig,
    ) -> Self {
        Self {
            ingestor,
            dispatcher,
            blocks,
            meta,
            config,
        }
    }

    /// Repair `[head - size, head]`.
    #[instrument(skip(self))]
    pub async fn repair(&self, head: u64, size: u64) -> IndexerResult<RepairReport> {
        let pages = pages(head, size, self.config.page_size);
        info!(pages = pages.len(), "🔧 Starting repair");

        let block_pool = WorkerPool::new("repair-blocks", self.config.block_workers);
        let plugin_pool = WorkerPool::new("repair-plugins", self.config.plugin_workers);
        let mut report = RepairReport::default();

        for page in pages {
            let map = self.probe(page.clone()).await?;
            let initially_incomplete = map.incomplete().len();

            self.converge_blocks(&map, &block_pool, &mut report).await;
            report.repaired += initially_incomplete.saturating_sub(map.incomplete().len());
            report.unresolved_blocks.extend(map.incomplete());

            if let Some(dispatcher) = &self.dispatcher {
                let plugin_map = CompletionMap::new(
                    map.complete()
                        .into_iter()
                        .filter(|n| !report.skipped.contains(n))
                        .map(|n| (n, false)),
                );
                self.converge_plugins(dispatcher, &plugin_map, &plugin_pool, &mut report)
                    .await;
                report.unresolved_plugins.extend(plugin_map.incomplete());
            }

            report.pages += 1;
            if let Err(e) = self.meta.heartbeat(Daemon::Repair).await {
                warn!(error = %e, "⚠️  Heartbeat write failed");
            }
            debug!(
                start = page.start(),
                end = page.end(),
                incomplete = initially_incomplete,
                "Page repaired"
            );
        }

        block_pool.close();
        plugin_pool.close();

        if report.is_clean() {
            info!(repaired = report.repaired, "✅ Repair complete");
        } else {
            warn!(
                unresolved_blocks = ?report.unresolved_blocks,
                unresolved_plugins = ?report.unresolved_plugins,
                "❌ Repair exhausted retries"
            );
        }
        Ok(report)
    }

    /// Completion map of a page from persisted counts.
    ///
    /// Incomplete blocks are also recorded in the missing-block set.
    async fn probe(&self, page: RangeInclusive<u64>) -> IndexerResult<CompletionMap> {
        let counts = self.blocks.block_counts(page.clone()).await?;
        let map = CompletionMap::new(page.map(|n| (n, false)));
        for c in counts {
            map.mark(c.number, c.is_complete());
        }
        for number in map.incomplete() {
            self.meta.add_missing(number).await?;
        }
        Ok(map)
    }

    async fn converge_blocks(
        &self,
        map: &CompletionMap,
        pool: &WorkerPool,
        report: &mut RepairReport,
    ) {
        for round in 0..self.config.max_retries {
            let pending = map.incomplete();
            if pending.is_empty() {
                return;
            }
            record_repair_round("blocks");
            debug!(round, pending = pending.len(), "Repairing blocks");

            let ingestor = self.ingestor.clone();
            let results = pool
                .run_batch(pending, move |n| {
                    let ingestor = ingestor.clone();
                    async move { ingestor.ingest(n, true).await }
                })
                .await;

            for (number, result) in results {
                match result {
                    Ok(IngestOutcome::CodecError) => {}
                    Ok(_) => map.mark(number, true),
                    Err(IndexerError::Undecodable { message, .. }) => {
                        warn!(block = number, message = %message, "⏭️  Skipping undecodable block");
                        map.mark(number, true);
                        report.skipped.push(number);
                    }
                    Err(e) => debug!(block = number, error = %e, "Block not repaired yet"),
                }
            }

            if !self.config.round_delay.is_zero() && !map.incomplete().is_empty() {
                tokio::time::sleep(self.config.round_delay).await;
            }
        }
    }

    async fn converge_plugins(
        &self,
        dispatcher: &Arc<PluginDispatcher>,
        map: &CompletionMap,
        pool: &WorkerPool,
        report: &mut RepairReport,
    ) {
        for round in 0..self.config.max_retries {
            let pending = map.incomplete();
            if pending.is_empty() {
                return;
            }
            record_repair_round("plugins");
            debug!(round, pending = pending.len(), "Replaying blocks to plugins");

            let dispatcher = dispatcher.clone();
            let results = pool
                .run_batch(pending, move |n| {
                    let dispatcher = dispatcher.clone();
                    async move { dispatcher.dispatch_block(n).await }
                })
                .await;

            for (number, result) in results {
                match result {
                    Ok(_) => {
                        map.mark(number, true);
                        report.dispatched += 1;
                    }
                    Err(e) => debug!(block = number, error = %e, "Dispatch not complete yet"),
                }
            }

            if !self.config.round_delay.is_zero() && !map.incomplete().is_empty() {
                tokio::time::sleep(self.config.round_delay).await;
            }
        }
    }
}
