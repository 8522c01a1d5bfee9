use clap::Parser;
use posguard::config::{AppConfig, LoggingConfig};
use posguard::{
    EngineContext, ExitCoordinator, LockManager, MemoryPositionStore, NaiveAccounting,
    OrderMonitor, PaperExchange, RedisStore, ShutdownFlag, WorkerRuntime,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Position lifecycle worker.
///
/// Consumes lifecycle queues, coordinates through the shared store, and
/// runs against the built-in paper venue; real venue adapters plug in
/// through the library API.
#[derive(Parser, Debug)]
#[command(name = "posguard", version, about)]
struct Cli {
    /// Configuration directory
    #[arg(long, default_value = "config")]
    config_dir: String,

    /// Override the configured process name
    #[arg(long)]
    process_name: Option<String>,

    /// Override the consumed queues (repeatable)
    #[arg(long = "queue")]
    queues: Vec<String>,

    /// Initial mark price for the paper venue
    #[arg(long, default_value = "100")]
    mark_price: Decimal,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config_dir)?;
    if let Some(process_name) = cli.process_name {
        config.worker.process_name = process_name;
    }
    if !cli.queues.is_empty() {
        config.worker.queues = cli.queues;
    }
    config
        .validate()
        .map_err(|errors| anyhow::anyhow!("invalid configuration: {}", errors.join("; ")))?;

    init_logging(&config.logging);
    info!(
        process = %config.worker.process_name,
        queues = ?config.worker.queues,
        "starting position lifecycle worker"
    );

    let store = Arc::new(RedisStore::connect(&config.store).await?);
    let ctx = EngineContext::new(
        store.clone(),
        Arc::new(MemoryPositionStore::new()),
        Arc::new(PaperExchange::new(cli.mark_price)),
        Arc::new(NaiveAccounting),
    );
    let locks = Arc::new(LockManager::new(
        store,
        config.worker.process_name.clone(),
        config.locking.clone(),
    ));
    let monitor = OrderMonitor::new(ctx.clone(), config.monitor.clone());
    let exit = ExitCoordinator::new(
        ctx.clone(),
        locks.clone(),
        OrderMonitor::new(ctx.clone(), config.monitor.clone()),
        config.exit.clone(),
        config.worker.process_name.clone(),
    );

    let shutdown = ShutdownFlag::new();
    shutdown.listen_for_signals();

    let worker = WorkerRuntime::new(ctx, locks, monitor, exit, config.worker, shutdown);
    let stats = worker.run().await?;
    info!(
        processed = stats.processed,
        requeued = stats.requeued,
        dropped = stats.dropped,
        "worker exited cleanly"
    );
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
