use chrono::Utc;
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use paysplit::application::adapters::ChannelAdapters;
use paysplit::application::engine::{DivideOptions, DivisionEngine};
use paysplit::application::reconciler::ReconciliationScheduler;
use paysplit::config::AppConfig;
use paysplit::domain::ports::{DivisionLedgerRef, OrderStoreRef, ReceiverRegistryRef};
use paysplit::domain::receiver::ChannelCode;
use paysplit::domain::split::RemainderPolicy;
use paysplit::infrastructure::channels::{FinalizeMode, SandboxConfig, sandbox_backed};
use paysplit::infrastructure::in_memory::InMemoryStore;
use paysplit::infrastructure::registry::{CachedRegistry, InMemoryReceiverRegistry};
use paysplit::interfaces::csv::reader::CsvReader;
use paysplit::interfaces::csv::report_writer::ReportWriter;
use paysplit::logging::{LogFormat, init_logging};
use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input orders CSV file
    orders: PathBuf,

    /// Receiver bindings CSV file. Without it every order is finalized.
    #[arg(long)]
    receivers: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Reconciliation sweeps to run after the divisions
    #[arg(long, default_value_t = 1)]
    sweeps: u32,

    /// What happens to the amount no receiver is owed
    #[arg(long, value_enum)]
    remainder: Option<RemainderPolicy>,

    /// Whether the sandbox channel needs an explicit finalize call
    #[arg(long, value_enum)]
    finalize_mode: Option<FinalizeMode>,

    /// Sandbox channel accepts splits now and confirms them on query
    #[arg(long)]
    confirm_later: bool,

    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

fn open_store(db_path: Option<&Path>) -> Result<(OrderStoreRef, DivisionLedgerRef)> {
    match db_path {
        #[cfg(feature = "storage-rocksdb")]
        Some(path) => {
            let store =
                paysplit::infrastructure::rocksdb::RocksDBStore::open(path).into_diagnostic()?;
            Ok((Arc::new(store.clone()), Arc::new(store)))
        }
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(_) => {
            eprintln!(
                "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
            );
            let store = InMemoryStore::new();
            Ok((Arc::new(store.clone()), Arc::new(store)))
        }
        None => {
            let store = InMemoryStore::new();
            Ok((Arc::new(store.clone()), Arc::new(store)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).into_diagnostic()?;
    if let Some(remainder) = cli.remainder {
        config.engine.remainder = remainder;
    }
    if let Some(mode) = cli.finalize_mode {
        config.sandbox.finalize_mode = mode;
    }
    if cli.confirm_later {
        config.sandbox.confirm_later = true;
    }
    if let Some(format) = cli.log_format {
        config.log.format = format;
    }
    init_logging(config.log.format, &config.log.level);

    let (orders, ledger) = open_store(cli.db_path.as_deref())?;

    // Receiver bindings
    let registry = InMemoryReceiverRegistry::new();
    let mut channels = BTreeSet::new();
    if let Some(path) = &cli.receivers {
        let file = File::open(path).into_diagnostic()?;
        for binding in CsvReader::new(file).bindings() {
            match binding {
                Ok(binding) => {
                    channels.insert(binding.channel.clone());
                    if let Err(e) = registry.upsert(binding).await {
                        tracing::error!(error = %e, "Error registering receiver");
                    }
                }
                Err(e) => tracing::error!(error = %e, "Error reading receiver"),
            }
        }
    }
    let registry: ReceiverRegistryRef = if config.registry.cache_ttl_ms > 0 {
        Arc::new(CachedRegistry::new(
            Arc::new(registry),
            Duration::from_millis(config.registry.cache_ttl_ms),
        ))
    } else {
        Arc::new(registry)
    };

    // Orders
    let file = File::open(&cli.orders).into_diagnostic()?;
    let mut order_ids = Vec::new();
    let mut seen = HashSet::new();
    for order in CsvReader::new(file).orders() {
        match order {
            Ok(order) => {
                channels.insert(order.channel.clone());
                if seen.insert(order.id.clone()) {
                    order_ids.push(order.id.clone());
                }
                orders.insert(order).await?;
            }
            Err(e) => tracing::error!(error = %e, "Error reading order"),
        }
    }

    let adapters = channels
        .into_iter()
        .fold(ChannelAdapters::new(), |adapters, channel: ChannelCode| {
            let mut sandbox = SandboxConfig::new(channel);
            sandbox.finalize_mode = config.sandbox.finalize_mode;
            sandbox.native_idempotency = config.sandbox.native_idempotency;
            sandbox.confirm_later = config.sandbox.confirm_later;
            sandbox.rejected_accounts = config.sandbox.rejected_accounts.iter().cloned().collect();
            adapters.with(sandbox_backed(sandbox))
        });

    tracing::info!(
        channels = ?adapters.channels().collect::<Vec<_>>(),
        orders = order_ids.len(),
        "dividing orders"
    );

    let engine = Arc::new(DivisionEngine::new(
        orders.clone(),
        ledger.clone(),
        registry,
        adapters.clone(),
        config.engine.clone(),
    ));

    let mut tasks = JoinSet::new();
    for order_id in order_ids.iter().cloned() {
        let engine = engine.clone();
        tasks.spawn(async move {
            let outcome = engine.divide_order(&order_id, &DivideOptions::default()).await;
            (order_id, outcome)
        });
    }
    while let Some(joined) = tasks.join_next().await {
        let (order_id, outcome) = joined.into_diagnostic()?;
        match outcome {
            Ok(outcome) => tracing::info!(
                order_id = %order_id,
                status = outcome.status.as_str(),
                batch_id = %outcome.batch.id,
                "division attempt finished"
            ),
            Err(e) => tracing::error!(
                order_id = %order_id,
                kind = %e.kind(),
                error = %e,
                "Error dividing order"
            ),
        }
    }

    let scheduler = ReconciliationScheduler::new(
        orders.clone(),
        ledger,
        adapters,
        config.reconcile.clone(),
        config.engine.channel_timeout(),
    );
    for _ in 0..cli.sweeps {
        let report = scheduler.sweep_once(Utc::now()).await?;
        tracing::info!(
            scanned = report.scanned,
            succeeded = report.succeeded,
            failed = report.failed,
            still_unknown = report.still_unknown,
            manual_review = report.manual_review,
            abandoned = report.abandoned,
            "reconciliation sweep finished"
        );
    }

    // Output one row per batch
    let stdout = io::stdout();
    let mut writer = ReportWriter::new(stdout.lock())?;
    for order_id in &order_ids {
        if let Some(order) = orders.get(order_id).await? {
            let history = engine.history(order_id).await?;
            writer.write_history(&order, &history)?;
        }
    }
    writer.finish()?;

    Ok(())
}
