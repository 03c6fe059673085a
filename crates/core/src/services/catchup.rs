//! Catch-up loops driven by finalized heads.
//!
//! A finalized-head notification only signals that newer data exists. The
//! signal goes through a capacity-1 channel, so a burst of notifications
//! collapses into one pending wake-up. A single background loop, started
//! once, drains the signal and works through the pending range batch by
//! batch on a bounded [`WorkerPool`].

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::{IndexerError, IndexerResult};
use crate::metrics::set_fill_finalized_block;
use crate::ports::{Counter, Daemon, MetadataStore};
use crate::services::pool::contiguous_high;
use crate::services::{BlockIngestor, IngestOutcome, PluginDispatcher, WorkerPool};

/// Finalized heads this close to the tip are not ingested yet.
pub const FINALIZATION_SAFETY_MARGIN: u64 = 3;
/// Plugins stay this far behind the fill counter.
pub const PLUGIN_SAFETY_MARGIN: u64 = 6;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Upper bound on block numbers submitted in one batch.
    pub max_batch: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self { max_batch: 2_000 }
    }
}

// =============================================================================
// Jobs
// =============================================================================

/// A unit of catch-up work: which numbers are pending, how to process one,
/// and how to record progress.
#[async_trait]
pub trait CatchUpJob: Send + Sync + 'static {
    fn daemon(&self) -> Daemon;

    /// Next range to work on, `None` when caught up.
    async fn pending_range(&self) -> IndexerResult<Option<RangeInclusive<u64>>>;

    async fn process(&self, number: u64) -> IndexerResult<()>;

    /// Record that every number up to `high` is done.
    async fn commit(&self, high: u64) -> IndexerResult<()>;
}

/// Plugin progress has no stored row to disambiguate a counter of 0, so
/// block 0 is dispatched again until the counter moves past it. Replays
/// are absorbed as duplicate keys.
fn next_after(counter: u64) -> u64 {
    if counter == 0 { 0 } else { counter + 1 }
}

/// Ingests finalized blocks behind the chain's finalized head.
pub struct BlockFillJob {
    ingestor: Arc<BlockIngestor>,
    meta: Arc<dyn MetadataStore>,
    margin: u64,
}

impl BlockFillJob {
    pub fn new(ingestor: Arc<BlockIngestor>, meta: Arc<dyn MetadataStore>) -> Self {
        Self {
            ingestor,
            meta,
            margin: FINALIZATION_SAFETY_MARGIN,
        }
    }

    pub fn with_margin(mut self, margin: u64) -> Self {
        self.margin = margin;
        self
    }
}

#[async_trait]
impl CatchUpJob for BlockFillJob {
    fn daemon(&self) -> Daemon {
        Daemon::Substrate
    }

    async fn pending_range(&self) -> IndexerResult<Option<RangeInclusive<u64>>> {
        let finalized = self.meta.counter(Counter::FinalizedBlock).await?;

        let Some(end) = finalized.checked_sub(self.margin) else {
            return Ok(None);
        };
        let start = self.ingestor.next_unfilled().await?;
        Ok((start <= end).then_some(start..=end))
    }

    async fn process(&self, number: u64) -> IndexerResult<()> {
        match self.ingestor.ingest(number, true).await? {
            IngestOutcome::CodecError => Err(IndexerError::Undecodable {
                block: number,
                message: "stored with codec error".into(),
            }),
            _ => Ok(()),
        }
    }

    async fn commit(&self, high: u64) -> IndexerResult<()> {
        let value = self.meta.advance_counter(Counter::FillFinalized, high).await?;
        set_fill_finalized_block(value);
        Ok(())
    }
}

/// Dispatches filled blocks to plugins.
pub struct PluginCatchUpJob {
    dispatcher: Arc<PluginDispatcher>,
    meta: Arc<dyn MetadataStore>,
    margin: u64,
}

impl PluginCatchUpJob {
    pub fn new(dispatcher: Arc<PluginDispatcher>, meta: Arc<dyn MetadataStore>) -> Self {
        Self {
            dispatcher,
            meta,
            margin: PLUGIN_SAFETY_MARGIN,
        }
    }

    pub fn with_margin(mut self, margin: u64) -> Self {
        self.margin = margin;
        self
    }
}

#[async_trait]
impl CatchUpJob for PluginCatchUpJob {
    fn daemon(&self) -> Daemon {
        Daemon::Plugins
    }

    async fn pending_range(&self) -> IndexerResult<Option<RangeInclusive<u64>>> {
        let dispatched = self.meta.counter(Counter::PluginsFinalized).await?;
        let filled = self.meta.counter(Counter::FillFinalized).await?;
        let persisted = self.meta.counter(Counter::FillAlready).await?;

        let Some(end) = filled.checked_sub(self.margin) else {
            return Ok(None);
        };
        // Never run ahead of what storage actually holds
        let end = end.min(persisted);
        let start = next_after(dispatched);
        Ok((start <= end).then_some(start..=end))
    }

    async fn process(&self, number: u64) -> IndexerResult<()> {
        self.dispatcher.dispatch_block(number).await.map(|_| ())
    }

    async fn commit(&self, high: u64) -> IndexerResult<()> {
        self.meta
            .advance_counter(Counter::PluginsFinalized, high)
            .await?;
        Ok(())
    }
}

// =============================================================================
// Draining
// =============================================================================

/// Work through the pending range until caught up or stalled.
///
/// Each batch commits its contiguous successful prefix. A batch that
/// leaves a hole stops the drain; the next signal retries from the hole.
/// Returns the number of blocks committed.
#[instrument(skip_all, fields(daemon = job.daemon().as_str()))]
pub async fn drain(
    job: Arc<dyn CatchUpJob>,
    meta: &dyn MetadataStore,
    pool: &WorkerPool,
    config: &FetchConfig,
    shutdown: &watch::Receiver<bool>,
) -> IndexerResult<u64> {
    let mut committed = 0;
    let mut last_start = None;

    while !*shutdown.borrow() {
        let Some(range) = job.pending_range().await? else {
            break;
        };
        let start = *range.start();
        // A fully processed batch must move the range forward
        if last_start == Some(start) {
            debug!(start, "No progress since last batch, waiting for next signal");
            break;
        }
        last_start = Some(start);
        let end = (*range.end()).min(start.saturating_add(config.max_batch.max(1) - 1));
        debug!(start, end, "Processing batch");

        let worker = job.clone();
        let results = pool
            .run_batch(start..=end, move |n| {
                let job = worker.clone();
                async move { job.process(n).await }
            })
            .await;

        for (number, result) in &results {
            if let Err(e) = result {
                warn!(block = number, error = %e, "⚠️  Block not processed");
            }
        }

        let Some(high) = contiguous_high(start, &results) else {
            break;
        };
        job.commit(high).await?;
        committed += high - start + 1;

        if let Err(e) = meta.heartbeat(job.daemon()).await {
            warn!(error = %e, "⚠️  Heartbeat write failed");
        }

        if high < end {
            break;
        }
    }

    Ok(committed)
}

// =============================================================================
// Trigger
// =============================================================================

/// Collapsing wake-up signal plus the once-only fetch loop it feeds.
pub struct FetchTrigger {
    tx: mpsc::Sender<()>,
    rx: Mutex<Option<mpsc::Receiver<()>>>,
    started: AtomicBool,
}

impl FetchTrigger {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            started: AtomicBool::new(false),
        }
    }

    /// Signal that newer finalized data exists.
    ///
    /// Returns `false` when a wake-up was already pending.
    pub fn signal(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Spawn the fetch loop unless it is already running.
    pub fn start_once(
        &self,
        job: Arc<dyn CatchUpJob>,
        meta: Arc<dyn MetadataStore>,
        pool: Arc<WorkerPool>,
        config: FetchConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        if self.started.swap(true, Ordering::AcqRel) {
            return None;
        }

        let rx = self
            .rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()?;

        info!(daemon = job.daemon().as_str(), "⚡ Fetch loop started");
        Some(tokio::spawn(fetch_loop(job, meta, pool, config, rx, shutdown)))
    }
}

impl Default for FetchTrigger {
    fn default() -> Self {
        Self::new()
    }
}

async fn fetch_loop(
    job: Arc<dyn CatchUpJob>,
    meta: Arc<dyn MetadataStore>,
    pool: Arc<WorkerPool>,
    config: FetchConfig,
    mut signals: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            signal = signals.recv() => {
                if signal.is_none() {
                    break;
                }
                match drain(job.clone(), meta.as_ref(), &pool, &config, &shutdown).await {
                    Ok(0) => {}
                    Ok(committed) => debug!(committed, "Catch-up batch committed"),
                    Err(e) => warn!(error = %e, "⚠️  Catch-up failed, waiting for next head"),
                }
            }
        }
    }
    debug!(daemon = job.daemon().as_str(), "Fetch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::BlockStore;
    use crate::services::testing::{Harness, MemoryPluginStores, RecordingPlugin, ScriptedBlock};
    use crate::services::PluginRegistryBuilder;
    use std::time::Duration;

    #[test]
    fn trigger_collapses_bursts() {
        let trigger = FetchTrigger::new();
        assert!(trigger.signal());
        assert!(!trigger.signal());
        assert!(!trigger.signal());
    }

    #[tokio::test]
    async fn fill_range_respects_margin() {
        let h = Harness::new().await;
        let job = BlockFillJob::new(h.ingestor.clone(), h.meta.clone());

        h.meta.set_counter(Counter::FinalizedBlock, 2).await.unwrap();
        assert_eq!(job.pending_range().await.unwrap(), None);

        h.meta.set_counter(Counter::FinalizedBlock, 105).await.unwrap();
        h.meta.set_counter(Counter::FillFinalized, 100).await.unwrap();
        assert_eq!(job.pending_range().await.unwrap(), Some(101..=102));
    }

    // Test critique: scénario bout en bout, 105 finalisé, fill à 100, marge 3
    #[tokio::test]
    async fn finalized_head_fills_up_to_margin() {
        let h = Harness::new().await;
        for n in 95..=110 {
            h.chain.add_block(ScriptedBlock::standard(n));
        }
        h.meta.set_counter(Counter::FillFinalized, 100).await.unwrap();
        h.meta.set_counter(Counter::FinalizedBlock, 105).await.unwrap();

        let job: Arc<dyn CatchUpJob> = Arc::new(BlockFillJob::new(h.ingestor.clone(), h.meta.clone()));
        let pool = WorkerPool::new("fill", 10);
        let (_tx, rx) = watch::channel(false);

        let committed = drain(job, h.meta.as_ref(), &pool, &FetchConfig::default(), &rx)
            .await
            .unwrap();

        assert_eq!(committed, 2);
        assert_eq!(h.meta.counter(Counter::FillFinalized).await.unwrap(), 102);
        assert!(h.blocks.get_block(101).await.unwrap().is_some());
        assert!(h.blocks.get_block(102).await.unwrap().is_some());
        assert!(h.blocks.get_block(103).await.unwrap().is_none());
        assert!(h.meta.last_heartbeat(Daemon::Substrate).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn hole_stops_drain_at_contiguous_prefix() {
        let h = Harness::new().await;
        for n in 1..=20 {
            if n != 6 {
                h.chain.add_block(ScriptedBlock::standard(n));
            }
        }
        h.meta.set_counter(Counter::FillFinalized, 1).await.unwrap();
        h.meta.set_counter(Counter::FinalizedBlock, 13).await.unwrap();

        let job: Arc<dyn CatchUpJob> = Arc::new(BlockFillJob::new(h.ingestor.clone(), h.meta.clone()));
        let pool = WorkerPool::new("fill", 4);
        let (_tx, rx) = watch::channel(false);

        drain(job, h.meta.as_ref(), &pool, &FetchConfig::default(), &rx)
            .await
            .unwrap();

        assert_eq!(h.meta.counter(Counter::FillFinalized).await.unwrap(), 5);
        // Blocks past the hole are stored but not counted as contiguous
        assert!(h.blocks.get_block(9).await.unwrap().is_some());
        assert_eq!(h.meta.counter(Counter::FillAlready).await.unwrap(), 10);
    }

    // Test critique: chaîne neuve, tête finalisée à 3, le drain doit rendre la main
    #[tokio::test]
    async fn fresh_chain_fills_genesis_then_stops() {
        let h = Harness::new().await;
        for n in 0..=3 {
            h.chain.add_block(ScriptedBlock::standard(n));
        }
        h.meta.set_counter(Counter::FinalizedBlock, 3).await.unwrap();

        let job: Arc<dyn CatchUpJob> = Arc::new(BlockFillJob::new(h.ingestor.clone(), h.meta.clone()));
        let pool = WorkerPool::new("fill", 4);
        let (_tx, rx) = watch::channel(false);

        let committed = tokio::time::timeout(
            Duration::from_secs(3),
            drain(job.clone(), h.meta.as_ref(), &pool, &FetchConfig::default(), &rx),
        )
        .await
        .expect("drain must not spin on block 0")
        .unwrap();

        assert_eq!(committed, 1);
        assert!(h.blocks.get_block(0).await.unwrap().unwrap().finalized);
        assert_eq!(job.pending_range().await.unwrap(), None);
        assert_eq!(h.chain.hash_calls(), 1);

        // Un second signal ne refait rien
        let committed = drain(job, h.meta.as_ref(), &pool, &FetchConfig::default(), &rx)
            .await
            .unwrap();
        assert_eq!(committed, 0);
    }

    #[tokio::test]
    async fn failed_genesis_is_retried_first() {
        let h = Harness::new().await;
        for n in 1..=10 {
            h.chain.add_block(ScriptedBlock::standard(n));
        }
        h.meta.set_counter(Counter::FinalizedBlock, 8).await.unwrap();

        let job: Arc<dyn CatchUpJob> = Arc::new(BlockFillJob::new(h.ingestor.clone(), h.meta.clone()));
        let pool = WorkerPool::new("fill", 4);
        let (_tx, rx) = watch::channel(false);

        drain(job.clone(), h.meta.as_ref(), &pool, &FetchConfig::default(), &rx)
            .await
            .unwrap();

        // Les blocs 1..=5 sont stockés mais le compteur attend le bloc 0
        assert!(h.blocks.get_block(1).await.unwrap().is_some());
        assert_eq!(h.meta.counter(Counter::FillFinalized).await.unwrap(), 0);
        assert_eq!(job.pending_range().await.unwrap(), Some(0..=5));

        h.chain.add_block(ScriptedBlock::standard(0));
        drain(job.clone(), h.meta.as_ref(), &pool, &FetchConfig::default(), &rx)
            .await
            .unwrap();
        assert_eq!(h.meta.counter(Counter::FillFinalized).await.unwrap(), 5);
        assert_eq!(job.pending_range().await.unwrap(), None);
    }

    // Test critique: pour tout n <= FillFinalized, ligne finalisée, comptes
    // cohérents avec les lignes stockées, absent de l'ensemble manquant
    #[tokio::test]
    async fn filled_prefix_is_complete() {
        let h = Harness::new().await;
        for n in 0..=15 {
            match n {
                6 => {}
                9 => h.chain.add_block(ScriptedBlock::standard(n).with_undecodable_events()),
                4 => h.chain.add_block(ScriptedBlock::standard(n).with_failed_extrinsic(1)),
                _ => h.chain.add_block(ScriptedBlock::standard(n)),
            }
        }
        h.meta.set_counter(Counter::FinalizedBlock, 15).await.unwrap();

        let job: Arc<dyn CatchUpJob> = Arc::new(BlockFillJob::new(h.ingestor.clone(), h.meta.clone()));
        let pool = WorkerPool::new("fill", 4);
        let (_tx, rx) = watch::channel(false);

        drain(job.clone(), h.meta.as_ref(), &pool, &FetchConfig::default(), &rx)
            .await
            .unwrap();
        assert_eq!(h.meta.counter(Counter::FillFinalized).await.unwrap(), 5);

        // Le trou se comble, le bloc 9 reste en erreur de codec
        h.chain.add_block(ScriptedBlock::standard(6));
        drain(job, h.meta.as_ref(), &pool, &FetchConfig::default(), &rx)
            .await
            .unwrap();
        let filled = h.meta.counter(Counter::FillFinalized).await.unwrap();
        assert_eq!(filled, 8);

        let missing = h.meta.missing_blocks().await.unwrap();
        for n in 0..=filled {
            let block = h.blocks.get_block(n).await.unwrap().unwrap();
            assert!(block.finalized, "block {n} not finalized");
            assert_eq!(
                block.extrinsics_count as usize,
                h.blocks.extrinsics(n).await.unwrap().len(),
                "block {n} extrinsic count"
            );
            assert_eq!(
                block.event_count as usize,
                h.blocks.events(n).await.unwrap().len(),
                "block {n} event count"
            );
            assert!(!missing.contains(&n), "block {n} still missing");
        }
        assert!(h.blocks.get_block(9).await.unwrap().unwrap().codec_error);
        assert!(missing.contains(&9));
    }

    #[tokio::test]
    async fn plugin_catch_up_stays_behind_fill() {
        let h = Harness::new().await;
        for n in 0..=12 {
            h.chain.add_block(ScriptedBlock::standard(n));
            h.ingestor.ingest(n, true).await.unwrap();
        }
        assert_eq!(h.meta.counter(Counter::FillFinalized).await.unwrap(), 12);

        let plugin = Arc::new(RecordingPlugin::new("transfers"));
        let mut builder = PluginRegistryBuilder::new(Arc::new(MemoryPluginStores::default()));
        builder.register(plugin.clone());
        let dispatcher = Arc::new(PluginDispatcher::new(
            Arc::new(builder.build()),
            h.blocks.clone(),
        ));

        h.meta.set_counter(Counter::PluginsFinalized, 2).await.unwrap();
        let job = PluginCatchUpJob::new(dispatcher, h.meta.clone());
        assert_eq!(job.pending_range().await.unwrap(), Some(3..=6));

        // The fill high-water mark can lag behind the plugin bound
        h.meta.set_counter(Counter::FillAlready, 4).await.unwrap();
        assert_eq!(job.pending_range().await.unwrap(), Some(3..=4));

        let job: Arc<dyn CatchUpJob> = Arc::new(job);
        let pool = WorkerPool::new("plugins", 10);
        let (_tx, rx) = watch::channel(false);
        drain(job, h.meta.as_ref(), &pool, &FetchConfig::default(), &rx)
            .await
            .unwrap();

        assert_eq!(h.meta.counter(Counter::PluginsFinalized).await.unwrap(), 4);
        assert_eq!(plugin.blocks_seen(), vec![3, 4]);
    }

    #[tokio::test]
    async fn start_once_spawns_a_single_loop() {
        let h = Harness::new().await;
        let trigger = FetchTrigger::new();
        let job: Arc<dyn CatchUpJob> = Arc::new(BlockFillJob::new(h.ingestor.clone(), h.meta.clone()));
        let pool = Arc::new(WorkerPool::new("fill", 2));
        let (tx, rx) = watch::channel(false);

        let first = trigger.start_once(
            job.clone(),
            h.meta.clone(),
            pool.clone(),
            FetchConfig::default(),
            rx.clone(),
        );
        let second = trigger.start_once(job, h.meta.clone(), pool, FetchConfig::default(), rx);
        assert!(first.is_some());
        assert!(second.is_none());

        tx.send(true).unwrap();
        first.unwrap().await.unwrap();
    }
}
