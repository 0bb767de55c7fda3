//! Tributary - EVM chain ingestion and normalization pipeline.
//!
//! # Usage
//!
//! ```bash
//! # Start with default config
//! tributary
//!
//! # Start with environment overrides
//! DATABASE_URL=postgres://localhost/tributary RPC_URL=http://localhost:8545 tributary
//!
//! # Walk the chain without a database
//! tributary --dry-run --start-block 15000000
//! ```

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};
use tracing_subscriber::{EnvFilter, fmt};

use tributary_core::error::IndexerError;
use tributary_core::metrics::init_metrics;
use tributary_core::ports::{BlockWriter, NodeClient};
use tributary_core::services::{ImportCoordinator, IndexerConfig, RewardSchedule};
use tributary_rpc::{JsonRpcNode, RpcClientConfig, TraceApi};
use tributary_storage::{Database, DatabaseConfig, MemoryWriter, PgBlockWriter};

const MAINNET_CHAIN_ID: u64 = 1;

/// Tributary CLI - EVM chain indexer.
#[derive(Parser, Debug)]
#[command(name = "tributary")]
#[command(about = "Tributary - EVM chain ingestion and normalization pipeline")]
#[command(version)]
struct Cli {
    /// Ethereum JSON-RPC HTTP URL.
    #[arg(long, env = "RPC_URL", default_value = "http://127.0.0.1:8545")]
    rpc_url: String,

    /// Call trace API exposed by the node: debug (Geth) or parity (Erigon, Reth).
    #[arg(long, env = "TRACE_API", default_value = "debug")]
    trace_api: TraceApi,

    /// PostgreSQL database URL.
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "postgres://localhost/tributary"
    )]
    database_url: String,

    /// Prometheus metrics port.
    #[arg(long, env = "METRICS_PORT", default_value = "9090")]
    metrics_port: u16,

    /// Enable JSON log output.
    #[arg(long, env = "JSON_LOGS")]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Expected chain id. Defaults to whatever the node reports.
    #[arg(long, env = "CHAIN_ID")]
    chain_id: Option<u64>,

    /// First block imported into an empty store. Ignored once a cursor exists.
    #[arg(long, env = "START_BLOCK", default_value = "0")]
    start_block: u64,

    /// Deepest reorg resolved without operator action.
    #[arg(long, env = "MAX_REORG_DEPTH", default_value = "64")]
    max_reorg_depth: u64,

    /// Attempts per block before ingestion halts.
    #[arg(long, env = "MAX_ATTEMPTS", default_value = "5")]
    max_attempts: u32,

    /// Constant block reward in wei for chains other than mainnet.
    #[arg(long, env = "BLOCK_REWARD")]
    block_reward: Option<u128>,

    /// Keep everything in memory; nothing is written to the database.
    #[arg(long)]
    dry_run: bool,

    /// Run database migrations and exit.
    #[arg(long)]
    migrate_only: bool,

    /// Purge all indexed data from the database and exit.
    ///
    /// This will delete all blocks, transactions, traces, token rows and
    /// balance deltas, and reset the import queue and cursor.
    /// Schema/migrations are preserved.
    #[arg(long)]
    purge: bool,

    /// Skip confirmation prompt for destructive operations (like --purge).
    #[arg(long, short = 'y')]
    yes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    // Prometheus metrics exporter (optional - failures don't crash the app)
    let metrics_enabled =
        match format!("0.0.0.0:{}", cli.metrics_port).parse::<std::net::SocketAddr>() {
            Ok(metrics_addr) => {
                match PrometheusBuilder::new()
                    .with_http_listener(metrics_addr)
                    .install()
                {
                    Ok(()) => {
                        init_metrics();
                        true
                    }
                    Err(e) => {
                        warn!(
                            "⚠️  Failed to start metrics exporter: {}. Continuing without metrics.",
                            e
                        );
                        false
                    }
                }
            }
            Err(e) => {
                warn!("⚠️  Invalid metrics address: {}. Continuing without metrics.", e);
                false
            }
        };

    // ─────────────────────────────────────────────────────────────────────────
    // 🚀 STARTUP
    // ─────────────────────────────────────────────────────────────────────────
    info!("🚀 Starting Tributary Indexer");
    debug!(rpc_url = %cli.rpc_url, trace_api = %cli.trace_api, "Node endpoint");
    debug!(database_url = %mask_password(&cli.database_url), "Database endpoint");

    if cli.dry_run && (cli.migrate_only || cli.purge) {
        anyhow::bail!("--dry-run cannot be combined with --migrate-only or --purge");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 🗄️ DATABASE
    // ─────────────────────────────────────────────────────────────────────────
    let db = if cli.dry_run {
        info!("🧪 Dry run: blocks are kept in memory only");
        None
    } else {
        info!("🗄️  Connecting to database...");
        let db = Database::connect(&DatabaseConfig::for_indexer(&cli.database_url))
            .await
            .context("Failed to connect to database")?;

        db.migrate().await.context("Failed to run migrations")?;

        if cli.migrate_only {
            info!("🛑 --migrate-only flag set, exiting");
            db.close().await;
            return Ok(());
        }

        if cli.purge {
            let result = handle_purge(&db, cli.yes).await;
            db.close().await;
            return result;
        }

        Some(Arc::new(db))
    };

    // ─────────────────────────────────────────────────────────────────────────
    // 📡 NODE CONNECTION
    // ─────────────────────────────────────────────────────────────────────────
    info!("📡 Connecting to node...");
    let node = JsonRpcNode::connect(RpcClientConfig {
        url: cli.rpc_url.clone(),
        trace_api: cli.trace_api,
    })
    .context("Failed to create node client")?;

    let connected = node
        .chain_id()
        .await
        .context("Failed to query node chain id")?;
    let head = node
        .latest_block_number()
        .await
        .context("Failed to query node head")?;

    let chain_id = cli.chain_id.unwrap_or(connected);
    if chain_id != connected {
        anyhow::bail!(
            "Node serves chain {} but --chain-id is {}",
            connected,
            chain_id
        );
    }
    info!(chain_id, head, "🔗 Chain connected");

    let indexer_config = IndexerConfig {
        chain_id,
        start_block: cli.start_block,
        max_reorg_depth: cli.max_reorg_depth,
        max_attempts: cli.max_attempts,
        reward_schedule: reward_schedule(chain_id, cli.block_reward),
        ..Default::default()
    };
    let node = Arc::new(node);

    // ─────────────────────────────────────────────────────────────────────────
    // ⚡ SERVICES START
    // ─────────────────────────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let indexer_handle = match &db {
        Some(db) => {
            let writer = Arc::new(PgBlockWriter::new(db.clone()));
            spawn_indexer(indexer_config, node, writer, shutdown_tx.clone(), shutdown_rx)
        }
        None => {
            let writer = Arc::new(MemoryWriter::new());
            spawn_indexer(indexer_config, node, writer, shutdown_tx.clone(), shutdown_rx)
        }
    };

    // ─────────────────────────────────────────────────────────────────────────
    // ✅ READY
    // ─────────────────────────────────────────────────────────────────────────
    info!("✅ Tributary ready");
    if metrics_enabled {
        info!(
            "   📊 Metrics:  http://localhost:{}/metrics",
            cli.metrics_port
        );
    } else {
        info!("   📊 Metrics:  disabled");
    }
    info!("   Press Ctrl+C to stop");

    // A halted indexer flips the channel itself, so wait on either side.
    let mut halted_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = halted_rx.wait_for(|stop| *stop) => {}
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 🛑 SHUTDOWN
    // ─────────────────────────────────────────────────────────────────────────
    info!("🛑 Shutting down...");
    let _ = shutdown_tx.send(true);

    let outcome = match tokio::time::timeout(Duration::from_secs(30), indexer_handle).await {
        Ok(Ok(outcome)) => {
            debug!("Indexer stopped");
            outcome
        }
        Ok(Err(e)) => Err(anyhow::anyhow!("Indexer task panicked: {e}")),
        Err(_) => {
            warn!("⚠️  Indexer shutdown timed out");
            Ok(())
        }
    };

    if let Some(db) = db {
        if !db.is_healthy().await {
            warn!("⚠️  Database unreachable at shutdown");
        }
        db.close().await;
    }

    info!("🛑 Shutdown complete");
    outcome
}

/// Spawn the import coordinator on its own task.
///
/// Any halt other than a requested shutdown flips the shutdown channel so
/// the process exits instead of idling with a stopped pipeline.
fn spawn_indexer<W>(
    config: IndexerConfig,
    node: Arc<JsonRpcNode>,
    writer: Arc<W>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<Result<()>>
where
    W: BlockWriter + 'static,
{
    let coordinator = ImportCoordinator::new(config, node, writer);
    tokio::spawn(
        async move {
            let result = coordinator.run(shutdown_rx).await;
            match result {
                Ok(()) | Err(IndexerError::ShutdownRequested) => Ok(()),
                Err(e) => {
                    match &e {
                        IndexerError::ChainMismatch { .. } => {
                            error!(error = %e, "❌ Store belongs to another chain");
                        }
                        IndexerError::ReorgTooDeep { .. } | IndexerError::Fatal { .. } => {
                            error!(error = %e, "❌ Ingestion halted");
                            error!("   Manual action required: inspect the block above, then restart");
                        }
                        _ => error!(error = ?e, "❌ Indexer error"),
                    }
                    let _ = shutdown_tx.send(true);
                    Err(e.into())
                }
            }
        }
        .instrument(info_span!("indexer")),
    )
}

/// Reward schedule for the connected chain.
///
/// Mainnet uses its historical eras; other chains pay `block_reward` per
/// block when given, nothing otherwise.
fn reward_schedule(chain_id: u64, block_reward: Option<u128>) -> RewardSchedule {
    match (chain_id, block_reward) {
        (_, Some(reward)) => RewardSchedule::constant(U256::from(reward)),
        (MAINNET_CHAIN_ID, None) => RewardSchedule::mainnet(),
        (_, None) => RewardSchedule::none(),
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
            .with_file(false)
            .with_line_number(false)
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

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("⚠️  Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("⚠️  Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Handle the --purge command.
async fn handle_purge(db: &Database, skip_confirmation: bool) -> Result<()> {
    warn!("⚠️  PURGE MODE: This will delete ALL indexed data!");
    warn!("   - All blocks, transactions, receipts and traces");
    warn!("   - Contracts, token transfers, events, rewards and balance deltas");
    warn!("   - The import queue and cursor will be reset");
    warn!("   - Schema and migrations will be preserved");

    if !skip_confirmation {
        print!("\n🔴 Are you sure you want to purge all data? [y/N] ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            info!("❌ Purge cancelled");
            return Ok(());
        }
    }

    info!("🗑️  Purging database...");
    let stats = db.purge().await.context("Failed to purge database")?;

    info!("✅ Database purged successfully");
    info!("   📦 Blocks removed: {}", stats.blocks_removed);
    info!("   📝 Transactions removed: {}", stats.transactions_removed);
    info!("   💰 Balance deltas removed: {}", stats.deltas_removed);
    info!("   The indexer will start from --start-block on next run");

    Ok(())
}
