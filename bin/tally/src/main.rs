//! Tally - ERC-20 transfer indexer and balance aggregator.
//!
//! # Usage
//!
//! ```bash
//! # Index a token on a local node
//! tally --token-address 0x5fbdb2315678afecb367f032d93f642f64180aa3
//!
//! # Start with environment overrides
//! RPC_URL=http://localhost:8545 TOKEN_ADDRESS=0x... LOOKBACK_BLOCKS=3000 tally
//!
//! # Broadcast a signed transaction and follow it until mined
//! tally --token-address 0x... --send-raw 0xf86c...
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};
use tracing_subscriber::{EnvFilter, fmt};

use tally_core::error::IndexerError;
use tally_core::metrics::init_metrics;
use tally_core::models::{Address, TransactionState};
use tally_core::ports::TransferSource;
use tally_core::services::{
    BackfillWindow, IndexerConfig, Observers, ReceiverAccounting, TrackerConfig,
    TransactionNotices, TransactionTracker, TransferIndexer,
};
use tally_evm::{EvmClient, EvmClientConfig};
use tally_graphql::{ConfirmationPolicy, ServerConfig, build_schema_with_token, serve_with_shutdown};

/// Tally CLI - ERC-20 transfer indexer.
#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(about = "Tally - ERC-20 transfer indexer and balance aggregator")]
#[command(version)]
struct Cli {
    /// EVM node HTTP JSON-RPC URL.
    #[arg(long, env = "RPC_URL", default_value = "http://127.0.0.1:8545")]
    rpc_url: String,

    /// Token contract address whose transfers are indexed.
    #[arg(long, env = "TOKEN_ADDRESS", value_parser = parse_address)]
    token_address: Address,

    /// Number of blocks before head to backfill.
    #[arg(long, env = "LOOKBACK_BLOCKS", default_value = "500")]
    lookback_blocks: u64,

    /// Blocks below the latest one whose transfers and segments stay in memory.
    /// Balances are kept in full. Never smaller than the lookback.
    #[arg(long, env = "RETENTION_BLOCKS", default_value = "10000")]
    retention_blocks: u64,

    /// Blocks per backfill query.
    #[arg(long, env = "BATCH_SIZE", default_value = "100")]
    batch_size: u64,

    /// Depth below head a transfer must reach to be listed as confirmed.
    #[arg(long, env = "CONFIRMATIONS", default_value = "20")]
    confirmations: u64,

    /// Seconds between polls of the chain head.
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value = "4")]
    poll_interval_secs: u64,

    /// GraphQL server port.
    #[arg(long, env = "GRAPHQL_PORT", default_value = "4000")]
    graphql_port: u16,

    /// Prometheus metrics port.
    #[arg(long, env = "METRICS_PORT", default_value = "9090")]
    metrics_port: u16,

    /// Enable JSON log output.
    #[arg(long, env = "JSON_LOGS")]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Debit receivers instead of crediting them.
    ///
    /// Reproduces the balances shown by the legacy demo site. These do not
    /// match on-chain balances.
    #[arg(long, env = "PARITY_RECEIVER_DEBIT")]
    parity_receiver_debit: bool,

    /// Fold transfers seen by both backfill and the live feed twice.
    #[arg(long, env = "NO_DEDUP")]
    no_dedup: bool,

    /// Broadcast this signed raw transaction (hex), track it until mined, and exit.
    #[arg(long)]
    send_raw: Option<String>,

    /// Seconds to wait for a broadcast transaction to be mined.
    #[arg(long, env = "MINING_TIMEOUT_SECS", default_value = "300")]
    mining_timeout_secs: u64,
}

/// Parse a 20-byte hex address.
fn parse_address(s: &str) -> Result<Address, String> {
    Address::from_hex(s).map_err(|e| format!("Invalid address '{}': {}", s, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    // Prometheus metrics exporter (optional - failures don't crash the app)
    let metrics_enabled = match format!("0.0.0.0:{}", cli.metrics_port).parse::<std::net::SocketAddr>() {
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
                    warn!("⚠️  Failed to start metrics exporter: {}. Continuing without metrics.", e);
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
    info!("🚀 Starting Tally");
    debug!(rpc_url = %mask_password(&cli.rpc_url), "RPC endpoint");

    // ─────────────────────────────────────────────────────────────────────────
    // 📡 NODE CONNECTION
    // ─────────────────────────────────────────────────────────────────────────
    info!("📡 Connecting to node...");
    let evm_config = EvmClientConfig {
        rpc_url: cli.rpc_url.clone(),
        token: cli.token_address,
        poll_interval: Duration::from_secs(cli.poll_interval_secs.max(1)),
        ..Default::default()
    };

    let client = EvmClient::connect(evm_config)
        .await
        .context("Failed to connect to node")?;

    if let Some(raw) = &cli.send_raw {
        return handle_send_raw(&client, raw, cli.mining_timeout_secs).await;
    }

    let client = Arc::new(client);
    let head = client
        .head_block()
        .await
        .context("Failed to read chain head")?;

    info!(token = %cli.token_address, head, "🔗 Chain connected");

    let indexer_config = IndexerConfig {
        batch_size: cli.batch_size,
        receiver_accounting: if cli.parity_receiver_debit {
            ReceiverAccounting::Debit
        } else {
            ReceiverAccounting::Credit
        },
        deduplicate: !cli.no_dedup,
        retention_blocks: Some(cli.retention_blocks.max(cli.lookback_blocks)),
        ..Default::default()
    };

    let indexer = Arc::new(TransferIndexer::new(indexer_config, client.clone()));

    // ─────────────────────────────────────────────────────────────────────────
    // ⚡ SERVICES START
    // ─────────────────────────────────────────────────────────────────────────
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let mut graphql_shutdown_rx = shutdown_tx.subscribe();

    let graphql_config = ServerConfig {
        host: "0.0.0.0".to_string(),
        port: cli.graphql_port,
        enable_playground: true,
    };

    // Includes DoS protection: depth limit (15), complexity limit (500)
    let schema = build_schema_with_token(
        indexer.clone(),
        client.clone(),
        ConfirmationPolicy(cli.confirmations),
    );
    let graphql_port = cli.graphql_port;
    let graphql_handle = tokio::spawn(
        async move {
            let shutdown_signal = async move {
                while !*graphql_shutdown_rx.borrow() {
                    if graphql_shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            };

            if let Err(e) = serve_with_shutdown(schema, graphql_config, shutdown_signal).await {
                error!(error = %e, "❌ Server error");
            }
            debug!("Server stopped");
        }
        .instrument(info_span!("graphql")),
    );

    // Backfill covers up to `head`; live picks up at the next block.
    let live = indexer
        .live_start(head.saturating_add(1))
        .await
        .context("Failed to subscribe to transfers")?;

    let window = BackfillWindow::recent(head, cli.lookback_blocks);
    let backfill_indexer = indexer.clone();
    let indexer_handle = tokio::spawn(
        async move {
            match backfill_indexer
                .backfill_with_shutdown(window.start, window.end, &mut shutdown_rx)
                .await
            {
                Ok(_) | Err(IndexerError::ShutdownRequested) => {}
                Err(e) => error!(error = %e, "❌ Backfill halted"),
            }
        }
        .instrument(info_span!("indexer")),
    );

    // ─────────────────────────────────────────────────────────────────────────
    // ✅ READY
    // ─────────────────────────────────────────────────────────────────────────
    info!("✅ Tally ready");
    info!("   ⚡ GraphQL:  http://localhost:{}/graphql", graphql_port);
    if metrics_enabled {
        info!(
            "   📊 Metrics:  http://localhost:{}/metrics",
            cli.metrics_port
        );
    } else {
        info!("   📊 Metrics:  disabled");
    }
    info!("   Press Ctrl+C to stop");

    shutdown_signal().await;

    // ─────────────────────────────────────────────────────────────────────────
    // 🛑 SHUTDOWN
    // ─────────────────────────────────────────────────────────────────────────
    info!("🛑 Shutting down...");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(Duration::from_secs(30), indexer_handle).await {
        Ok(_) => debug!("Indexer stopped"),
        Err(_) => warn!("⚠️  Indexer shutdown timed out"),
    }

    match tokio::time::timeout(Duration::from_secs(10), live.stopped()).await {
        Ok(()) => debug!("Live subscription stopped"),
        Err(_) => warn!("⚠️  Live subscription shutdown timed out"),
    }

    match tokio::time::timeout(Duration::from_secs(10), graphql_handle).await {
        Ok(_) => debug!("GraphQL stopped"),
        Err(_) => warn!("⚠️  GraphQL shutdown timed out"),
    }

    info!("🛑 Shutdown complete");
    Ok(())
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

/// Mask password in RPC URL for logging.
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

/// Handle the --send-raw command.
async fn handle_send_raw(client: &EvmClient, raw: &str, mining_timeout_secs: u64) -> Result<()> {
    let raw = hex::decode(raw.strip_prefix("0x").unwrap_or(raw))
        .context("Raw transaction is not valid hex")?;

    let tracker = TransactionTracker::spawn(TrackerConfig {
        mining_timeout: Some(Duration::from_secs(mining_timeout_secs)),
        ..Default::default()
    });

    let notices = Arc::new(TransactionNotices::default());
    let announce = |state: TransactionState| {
        let notices = notices.clone();
        move || {
            if let Some(notice) = notices.for_state(state) {
                info!("📣 {}: {}", notice.title, notice.description);
            }
        }
    };
    let on_mining = announce(TransactionState::Mining);
    let on_mined = announce(TransactionState::Mined);
    let on_failed = announce(TransactionState::Failed);

    tracker.set_observers(
        Observers::new()
            .on_pending(announce(TransactionState::Pending))
            .on_mining(move |tx| {
                on_mining();
                info!(hash = %tx.hash(), "   Transaction hash");
            })
            .on_mined(move |receipt, _| {
                on_mined();
                info!(block = receipt.block.number, "   Included in block");
            })
            .on_failed(move |error| {
                on_failed();
                warn!(error = %error, "   Failure cause");
            }),
    )?;

    tracker
        .send(|| async {
            client
                .send_raw_transaction(&raw)
                .await
                .map_err(|e| tally_core::error::TransactionError::SigningRejected(e.to_string()))
        })
        .await?;

    match tracker.snapshot().error {
        Some(error) => Err(error).context("Transaction did not make it"),
        None => Ok(()),
    }
}
