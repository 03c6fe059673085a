//! Chain head subscriber.
//!
//! Owns the long-lived subscription to the node and turns notifications
//! into counter updates and catch-up signals.
//!
//! # States
//!
//! `Connecting → Subscribed → Streaming → (Reconnecting | Closed)`
//!
//! While streaming, a heartbeat pings the node at a fixed interval. A failed
//! ping while the transport reports a dead connection forces a reconnect and
//! resubscribe. Read errors on single frames are logged and skipped.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use crate::error::{IndexerError, IndexerResult};
use crate::metrics::{record_reconnect, set_best_block, set_finalized_block};
use crate::ports::{ChainNotification, ChainRpc, Counter, MetadataStore, NotificationStream, meta};
use crate::services::{CatchUpJob, FetchConfig, FetchTrigger, RuntimeRegistry, WorkerPool};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Interval between `system_health` pings.
    pub heartbeat_interval: Duration,
    /// Write best/finalized counters and runtime metadata fields.
    ///
    /// Only the process that owns block ingestion does this.
    pub track_heads: bool,
    pub fetch: FetchConfig,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(3),
            track_heads: true,
            fetch: FetchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Connecting,
    Subscribed,
    Streaming,
    Reconnecting,
    Closed,
}

/// Why the streaming phase ended.
enum StreamEnd {
    Shutdown,
    Disconnected,
}

// =============================================================================
// ChainSubscriber
// =============================================================================

pub struct ChainSubscriber {
    chain: Arc<dyn ChainRpc>,
    meta: Arc<dyn MetadataStore>,
    runtime: Arc<RuntimeRegistry>,
    job: Arc<dyn CatchUpJob>,
    pool: Arc<WorkerPool>,
    trigger: FetchTrigger,
    fetch_loop: Mutex<Option<JoinHandle<()>>>,
    config: SubscriberConfig,
    state: watch::Sender<SubscriberState>,
}

impl ChainSubscriber {
    pub fn new(
        chain: Arc<dyn ChainRpc>,
        meta: Arc<dyn MetadataStore>,
        runtime: Arc<RuntimeRegistry>,
        job: Arc<dyn CatchUpJob>,
        pool: Arc<WorkerPool>,
        config: SubscriberConfig,
    ) -> Self {
        let (state, _) = watch::channel(SubscriberState::Connecting);
        Self {
            chain,
            meta,
            runtime,
            job,
            pool,
            trigger: FetchTrigger::new(),
            fetch_loop: Mutex::new(None),
            config,
            state,
        }
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SubscriberState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SubscriberState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            trace!(from = ?previous, to = ?state, "Subscriber state");
        }
    }

    /// Run until shutdown.
    ///
    /// Always returns [`IndexerError::ShutdownRequested`] once the shutdown
    /// signal fires; transport failures are retried with backoff.
    #[instrument(skip_all, fields(daemon = self.job.daemon().as_str()))]
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> IndexerResult<()> {
        info!("⛓️  Starting chain subscriber");

        // Exponential backoff configuration
        const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
        const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
        let mut retry_delay = INITIAL_RETRY_DELAY;

        loop {
            if *shutdown_rx.borrow() {
                self.set_state(SubscriberState::Closed);
                return Err(IndexerError::ShutdownRequested);
            }

            self.set_state(SubscriberState::Connecting);
            match self.chain.subscribe().await {
                Ok(stream) => {
                    self.set_state(SubscriberState::Subscribed);
                    debug!("📡 Subscriptions established");
                    retry_delay = INITIAL_RETRY_DELAY;

                    match self.stream(stream, &mut shutdown_rx).await {
                        StreamEnd::Shutdown => {
                            self.set_state(SubscriberState::Closed);
                            debug!("Subscriptions closed");
                            return Err(IndexerError::ShutdownRequested);
                        }
                        StreamEnd::Disconnected => {
                            warn!("⚠️  Subscription lost, reconnecting...");
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in_ms = retry_delay.as_millis(),
                        "⚠️  Failed to subscribe, retrying..."
                    );
                }
            }

            self.set_state(SubscriberState::Reconnecting);
            tokio::select! {
                _ = tokio::time::sleep(retry_delay) => {
                    debug!(retry_delay_ms = retry_delay.as_millis(), "🔄 Reconnecting to chain...");
                    retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
                    record_reconnect();
                    if let Err(e) = self.chain.reconnect().await {
                        warn!(error = %e, "⚠️  Reconnect failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        self.set_state(SubscriberState::Closed);
                        return Err(IndexerError::ShutdownRequested);
                    }
                }
            }
        }
    }

    async fn stream(
        &self,
        mut stream: NotificationStream,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> StreamEnd {
        self.set_state(SubscriberState::Streaming);

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        // Dropping the stream unsubscribes.
                        drop(stream);
                        return StreamEnd::Shutdown;
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.chain.health().await
                        && !self.chain.is_connected()
                    {
                        warn!(error = %e, "💔 Heartbeat failed on a dead connection");
                        return StreamEnd::Disconnected;
                    }
                }
                item = stream.next() => match item {
                    Some(Ok(notification)) => {
                        if let Err(e) = self.handle(notification, shutdown_rx).await {
                            warn!(error = %e, "⚠️  Notification not handled");
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "⚠️  Read error, continuing");
                    }
                    None => return StreamEnd::Disconnected,
                }
            }
        }
    }

    /// Apply one notification.
    pub async fn handle(
        &self,
        notification: ChainNotification,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> IndexerResult<()> {
        match notification {
            ChainNotification::RuntimeVersion(info) => {
                self.runtime.register(&info).await?;
                if self.config.track_heads {
                    self.meta.set_metadata(meta::IMPL_NAME, &info.impl_name).await?;
                    self.meta
                        .set_metadata(meta::SPEC_VERSION, &info.spec_version.to_string())
                        .await?;
                }
            }
            ChainNotification::NewHead(number) => {
                trace!(block = number, "New head");
                if self.config.track_heads {
                    self.meta.set_counter(Counter::BestBlock, number).await?;
                    set_best_block(number);
                }
            }
            ChainNotification::FinalizedHead(number) => {
                trace!(block = number, "Finalized head");
                if self.config.track_heads {
                    self.meta.set_counter(Counter::FinalizedBlock, number).await?;
                    set_finalized_block(number);
                }
                if !self.trigger.signal() {
                    trace!("Catch-up already pending");
                }
                if let Some(handle) = self.trigger.start_once(
                    self.job.clone(),
                    self.meta.clone(),
                    self.pool.clone(),
                    self.config.fetch.clone(),
                    shutdown_rx.clone(),
                ) {
                    *self
                        .fetch_loop
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
                }
                self.meta.heartbeat(self.job.daemon()).await?;
            }
        }
        Ok(())
    }

    /// Stop accepting new catch-up work.
    pub fn close_pool(&self) {
        self.pool.close();
    }

    /// Wait for the fetch loop to finish its in-flight batch.
    ///
    /// Returns `false` if it is still running after `timeout`.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let handle = self
            .fetch_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match handle {
            Some(handle) => tokio::time::timeout(timeout, handle).await.is_ok(),
            None => true,
        }
    }
}
