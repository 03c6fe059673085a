//! chainsight - Substrate chain indexer.
//!
//! # Usage
//!
//! ```bash
//! # Follow the chain head and ingest finalized blocks
//! chainsight start substrate
//!
//! # Dispatch ingested blocks to the plugins
//! chainsight start plugins
//!
//! # Re-check and backfill the 10,000 blocks below #2,000,000
//! chainsight start repair 2000000 10000
//!
//! # Maintenance
//! chainsight migrate
//! chainsight purge -y
//! chainsight status
//! ```
//!
//! Every flag has an environment fallback and `.env` is loaded first:
//!
//! ```bash
//! DATABASE_URL=postgres://localhost/chainsight WS_URL=ws://localhost:9944 chainsight start substrate
//! ```

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};
use tracing_subscriber::{EnvFilter, fmt};

use chainsight_core::error::IndexerError;
use chainsight_core::metrics::init_metrics;
use chainsight_core::ports::{
    BlockDecoder, BlockStore, ChainRpc, Counter, Daemon, MetadataStore, is_alive, meta,
};
use chainsight_core::services::{
    BlockFillJob, BlockIngestor, CatchUpJob, ChainSubscriber, EVENT_STORAGE_KEY, IngestConfig,
    PluginCatchUpJob, PluginDispatcher, PluginRegistry, PluginRegistryBuilder, RepairConfig,
    RepairEngine, RuntimeRegistry, SubscriberConfig, WorkerPool,
};
use chainsight_storage::{
    Database, DatabaseConfig, PgBlockStore, PgMetadataStore, PgPluginStores,
    postgres::DEFAULT_DATABASE_URL,
};
use chainsight_substrate::{ScaleDecoder, SubstrateClientConfig, SubstrateRpc};

/// How long in-flight batches get to finish on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Plugin catch-up workers.
const PLUGIN_WORKERS: usize = 10;

/// chainsight CLI - Substrate chain indexer.
#[derive(Parser, Debug)]
#[command(name = "chainsight")]
#[command(about = "chainsight - Substrate chain indexer")]
#[command(version)]
struct Cli {
    /// Substrate node WebSocket URL.
    #[arg(long, env = "WS_URL", default_value = "ws://127.0.0.1:9944", global = true)]
    ws_url: String,

    /// PostgreSQL database URL.
    #[arg(long, env = "DATABASE_URL", default_value = DEFAULT_DATABASE_URL, global = true)]
    database_url: String,

    /// Network name; scopes counters, metadata and the missing-block set.
    #[arg(long, env = "NETWORK_NODE", default_value = "polkadot", global = true)]
    network: String,

    /// Prometheus metrics port.
    #[arg(long, env = "METRICS_PORT", default_value = "9090", global = true)]
    metrics_port: u16,

    /// Enable JSON log output.
    #[arg(long, env = "JSON_LOGS", global = true)]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Storage key of the encoded event list (`System.Events`).
    #[arg(long, env = "EVENT_STORAGE_KEY", default_value = EVENT_STORAGE_KEY, global = true)]
    event_storage_key: String,

    /// Concurrent block ingestions while following the chain.
    #[arg(long, env = "FILL_WORKERS", default_value = "10", global = true)]
    fill_workers: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a long-running daemon.
    Start {
        #[command(subcommand)]
        daemon: StartCommand,
    },
    /// Apply database and plugin migrations, then exit.
    Migrate,
    /// Delete all indexed data of the network. Schema and migrations are kept.
    Purge {
        /// Skip the confirmation prompt.
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Print counters, missing blocks and daemon health.
    Status,
}

#[derive(Subcommand, Debug)]
enum StartCommand {
    /// Follow the chain head and ingest finalized blocks.
    Substrate,
    /// Dispatch ingested blocks to the plugins.
    Plugins,
    /// Re-check `[head - size, head]` and backfill what is incomplete.
    Repair { head: u64, size: u64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    match &cli.command {
        Command::Start { daemon } => start(&cli, daemon).await,
        Command::Migrate => migrate(&cli).await,
        Command::Purge { yes } => purge(&cli, *yes).await,
        Command::Status => status(&cli).await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// start
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a daemon needs, wired together.
struct Indexer {
    db: Database,
    chain: Arc<dyn ChainRpc>,
    blocks: Arc<dyn BlockStore>,
    meta: Arc<dyn MetadataStore>,
    runtime: Arc<RuntimeRegistry>,
    ingestor: Arc<BlockIngestor>,
    registry: Arc<PluginRegistry>,
}

async fn start(cli: &Cli, daemon: &StartCommand) -> Result<()> {
    let metrics_enabled = init_exporter(cli.metrics_port);

    // ─────────────────────────────────────────────────────────────────────────
    // 🚀 STARTUP
    // ─────────────────────────────────────────────────────────────────────────
    info!(network = %cli.network, "🚀 Starting chainsight");
    debug!(ws_url = %cli.ws_url, "Substrate endpoint");
    debug!(database_url = %mask_password(&cli.database_url), "Database endpoint");

    let db_config = match daemon {
        StartCommand::Repair { .. } => {
            let repair = RepairConfig::default();
            DatabaseConfig::for_repair(&cli.database_url, repair.block_workers + repair.plugin_workers)
        }
        StartCommand::Plugins => DatabaseConfig::for_indexer(&cli.database_url, PLUGIN_WORKERS),
        StartCommand::Substrate => DatabaseConfig::for_indexer(&cli.database_url, cli.fill_workers),
    };
    let indexer = bootstrap(cli, &db_config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ─────────────────────────────────────────────────────────────────────────
    // ⚡ SERVICES START
    // ─────────────────────────────────────────────────────────────────────────
    let result = match daemon {
        StartCommand::Substrate => {
            let job = Arc::new(BlockFillJob::new(indexer.ingestor.clone(), indexer.meta.clone()));
            let pool = WorkerPool::new("fill", cli.fill_workers);
            let subscriber = subscriber(&indexer, job, pool, true);
            follow(subscriber, shutdown_tx, shutdown_rx, metrics_enabled, cli.metrics_port).await
        }
        StartCommand::Plugins => {
            info!(plugins = ?indexer.registry.names(), "📦 Plugins registered");
            let dispatcher = Arc::new(PluginDispatcher::new(
                indexer.registry.clone(),
                indexer.blocks.clone(),
            ));
            let job = Arc::new(PluginCatchUpJob::new(dispatcher, indexer.meta.clone()));
            let pool = WorkerPool::new("plugins", PLUGIN_WORKERS);
            let subscriber = subscriber(&indexer, job, pool, false);
            follow(subscriber, shutdown_tx, shutdown_rx, metrics_enabled, cli.metrics_port).await
        }
        StartCommand::Repair { head, size } => repair(&indexer, *head, *size).await,
    };

    indexer.db.close().await;
    info!("🛑 Shutdown complete");
    result
}

/// Connect the database and the node and build the services.
async fn bootstrap(cli: &Cli, db_config: &DatabaseConfig) -> Result<Indexer> {
    // ─────────────────────────────────────────────────────────────────────────
    // 🗄️ DATABASE
    // ─────────────────────────────────────────────────────────────────────────
    info!("🗄️  Connecting to database...");
    let db = Database::connect(db_config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.context("Failed to run migrations")?;
    info!("🗄️  Database ready (migrations applied)");

    // ─────────────────────────────────────────────────────────────────────────
    // 📦 PLUGINS
    // ─────────────────────────────────────────────────────────────────────────
    let registry = plugin_registry(&db).await?;

    // ─────────────────────────────────────────────────────────────────────────
    // 📡 SUBSTRATE CONNECTION
    // ─────────────────────────────────────────────────────────────────────────
    info!("📡 Connecting to Substrate node...");
    let chain: Arc<dyn ChainRpc> = Arc::new(
        SubstrateRpc::connect(SubstrateClientConfig {
            ws_url: cli.ws_url.clone(),
            ..Default::default()
        })
        .await
        .context("Failed to connect to Substrate node")?,
    );

    let blocks: Arc<dyn BlockStore> = Arc::new(PgBlockStore::new(&db));
    let meta: Arc<dyn MetadataStore> = Arc::new(PgMetadataStore::new(&db, cli.network.clone()));
    let decoder: Arc<dyn BlockDecoder> = Arc::new(ScaleDecoder::new());

    let runtime = Arc::new(
        RuntimeRegistry::load(chain.clone(), blocks.clone(), decoder.clone())
            .await
            .context("Failed to load runtime versions")?,
    );

    // The chain's current runtime must be known before any block is decoded
    let Some(version) = chain
        .runtime_version(None)
        .await
        .context("Failed to query runtime version")?
    else {
        bail!("Node returned no runtime version");
    };
    runtime
        .register(&version)
        .await
        .context("Failed to register current runtime")?;
    info!(
        spec_version = version.spec_version,
        impl_name = %version.impl_name,
        "🔗 Chain connected"
    );

    let ingestor = Arc::new(BlockIngestor::new(
        chain.clone(),
        decoder,
        blocks.clone(),
        meta.clone(),
        runtime.clone(),
        IngestConfig {
            event_storage_key: cli.event_storage_key.clone(),
        },
    ));

    Ok(Indexer {
        db,
        chain,
        blocks,
        meta,
        runtime,
        ingestor,
        registry,
    })
}

/// Register the built-in plugins and apply their migrations.
async fn plugin_registry(db: &Database) -> Result<Arc<PluginRegistry>> {
    let mut builder = PluginRegistryBuilder::new(Arc::new(PgPluginStores::new(db)));
    for plugin in chainsight_plugins::builtin_plugins() {
        builder.register(plugin);
    }
    let registry = builder.build();
    registry
        .run_migrations()
        .await
        .context("Failed to run plugin migrations")?;
    Ok(Arc::new(registry))
}

fn subscriber(
    indexer: &Indexer,
    job: Arc<dyn CatchUpJob>,
    pool: WorkerPool,
    track_heads: bool,
) -> Arc<ChainSubscriber> {
    Arc::new(ChainSubscriber::new(
        indexer.chain.clone(),
        indexer.meta.clone(),
        indexer.runtime.clone(),
        job,
        Arc::new(pool),
        SubscriberConfig {
            track_heads,
            ..Default::default()
        },
    ))
}

/// Run a subscriber until Ctrl+C or SIGTERM, then drain it.
async fn follow(
    subscriber: Arc<ChainSubscriber>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    metrics_enabled: bool,
    metrics_port: u16,
) -> Result<()> {
    let handle = {
        let subscriber = subscriber.clone();
        tokio::spawn(
            async move {
                match subscriber.run(shutdown_rx).await {
                    Ok(()) | Err(IndexerError::ShutdownRequested) => {}
                    Err(e) => error!(error = ?e, "❌ Subscriber error"),
                }
            }
            .instrument(info_span!("subscriber")),
        )
    };

    // ─────────────────────────────────────────────────────────────────────────
    // ✅ READY
    // ─────────────────────────────────────────────────────────────────────────
    info!("✅ chainsight ready");
    if metrics_enabled {
        info!("   📊 Metrics:  http://localhost:{}/metrics", metrics_port);
    } else {
        info!("   📊 Metrics:  disabled");
    }
    info!("   Press Ctrl+C to stop");

    shutdown_signal().await;

    // ─────────────────────────────────────────────────────────────────────────
    // 🛑 SHUTDOWN
    // ─────────────────────────────────────────────────────────────────────────
    info!("🛑 Shutting down...");
    broadcast_shutdown(&shutdown_tx);

    match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
        Ok(_) => debug!("Subscriber stopped"),
        Err(_) => warn!("⚠️  Subscriber shutdown timed out"),
    }
    if subscriber.drain(DRAIN_TIMEOUT).await {
        debug!("In-flight batch drained");
    } else {
        warn!("⚠️  In-flight batch did not finish in time");
    }
    subscriber.close_pool();

    Ok(())
}

/// Run one repair pass, stopping early on Ctrl+C or SIGTERM.
async fn repair(indexer: &Indexer, head: u64, size: u64) -> Result<()> {
    let dispatcher = Arc::new(PluginDispatcher::new(
        indexer.registry.clone(),
        indexer.blocks.clone(),
    ));
    let engine = RepairEngine::new(
        indexer.ingestor.clone(),
        Some(dispatcher),
        indexer.blocks.clone(),
        indexer.meta.clone(),
        RepairConfig::default(),
    );

    info!(head, size, "🔧 Repair requested");
    let report = tokio::select! {
        report = engine.repair(head, size).instrument(info_span!("repair")) => {
            report.context("Repair failed")?
        }
        _ = shutdown_signal() => {
            warn!("🛑 Repair interrupted");
            return Ok(());
        }
    };

    info!(
        pages = report.pages,
        repaired = report.repaired,
        dispatched = report.dispatched,
        skipped = report.skipped.len(),
        "✅ Repair finished"
    );
    if !report.skipped.is_empty() {
        warn!(blocks = ?report.skipped, "⚠️  Undecodable blocks skipped");
    }
    if !report.is_clean() {
        error!(
            blocks = ?report.unresolved_blocks,
            plugins = ?report.unresolved_plugins,
            "❌ Retry ceiling reached with incomplete blocks"
        );
    }
    report.into_result()?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Maintenance commands
// ─────────────────────────────────────────────────────────────────────────────

async fn maintenance_db(cli: &Cli) -> Result<Database> {
    debug!(database_url = %mask_password(&cli.database_url), "Database endpoint");
    Database::connect(&DatabaseConfig::for_maintenance(&cli.database_url))
        .await
        .context("Failed to connect to database")
}

async fn migrate(cli: &Cli) -> Result<()> {
    let db = maintenance_db(cli).await?;
    db.migrate().await.context("Failed to run migrations")?;
    info!("🗄️  Database migrations applied");

    let registry = plugin_registry(&db).await?;
    info!(plugins = registry.len(), "📦 Plugin migrations applied");

    db.close().await;
    Ok(())
}

async fn purge(cli: &Cli, skip_confirmation: bool) -> Result<()> {
    let db = maintenance_db(cli).await?;

    warn!("⚠️  PURGE MODE: This will delete ALL indexed data of '{}'!", cli.network);
    warn!("   - All blocks, extrinsics, events and logs");
    warn!("   - All plugin tables");
    warn!("   - Counters, metadata and the missing-block set");
    warn!("   - Schema, runtime versions and migrations will be preserved");

    if !skip_confirmation {
        print!("\n🔴 Are you sure you want to purge all data? [y/N] ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            info!("❌ Purge cancelled");
            db.close().await;
            return Ok(());
        }
    }

    info!("🗑️  Purging database...");
    let stats = db
        .purge(&cli.network)
        .await
        .context("Failed to purge database")?;

    info!("✅ Database purged successfully");
    info!("   📦 Blocks removed: {}", stats.blocks_removed);
    info!("   📝 Extrinsics removed: {}", stats.extrinsics_removed);
    info!("   📣 Events removed: {}", stats.events_removed);
    info!(
        "   🧹 Tables truncated: {} shard, {} plugin",
        stats.shard_tables, stats.plugin_tables
    );
    info!("   The indexer will start from block 0 on next run");

    db.close().await;
    Ok(())
}

async fn status(cli: &Cli) -> Result<()> {
    let db = maintenance_db(cli).await?;
    let store = PgMetadataStore::new(&db, cli.network.clone());

    println!("network: {}", store.network());
    for key in [meta::IMPL_NAME, meta::SPEC_VERSION, meta::COUNT_EXTRINSIC, meta::COUNT_EVENT] {
        let value = store.metadata(key).await?.unwrap_or_else(|| "-".to_string());
        println!("{key:>28}: {value}");
    }
    for counter in Counter::ALL {
        println!("{:>28}: {}", counter.key(), store.counter(counter).await?);
    }
    println!("{:>28}: {}", "missing blocks", store.missing_count().await?);

    let now = chrono::Utc::now();
    for daemon in Daemon::ALL {
        let last = store.last_heartbeat(daemon).await?;
        let health = if is_alive(last, now) { "alive" } else { "down" };
        let seen = last.map_or_else(|| "never".to_string(), |t| t.to_rfc3339());
        println!("{:>28}: {health} (last beat {seen})", daemon.as_str());
    }

    db.close().await;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Install the Prometheus exporter. Failures don't stop the daemon.
fn init_exporter(port: u16) -> bool {
    match format!("0.0.0.0:{port}").parse::<std::net::SocketAddr>() {
        Ok(addr) => match PrometheusBuilder::new().with_http_listener(addr).install() {
            Ok(()) => {
                init_metrics();
                true
            }
            Err(e) => {
                warn!("⚠️  Failed to start metrics exporter: {}. Continuing without metrics.", e);
                false
            }
        },
        Err(e) => {
            warn!("⚠️  Invalid metrics address: {}. Continuing without metrics.", e);
            false
        }
    }
}

/// Initialize tracing subscriber.
fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .init();
    }
}

/// Mask password in database URL for logging.
fn mask_password(url_str: &str) -> String {
    match url::Url::parse(url_str) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("****"));
            }
            url.to_string()
        }
        Err(_) => url_str.to_string(),
    }
}

/// Tell the subscriber to stop. Returns whether it was still listening.
fn broadcast_shutdown(tx: &watch::Sender<bool>) -> bool {
    let delivered = tx.send(true).is_ok();
    if !delivered {
        debug!("Subscriber already stopped before shutdown signal");
    }
    delivered
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
