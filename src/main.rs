use std::{path::PathBuf, sync::Arc};

use ::tracing::{error, info, info_span, warn};
use anyhow::Result;
use clap::Parser;
use config::BenchConfig;
use state_store::StoreClient;
use transfers::{ReadModifyWrite, RetryingAggregator, StrategyKind, TransferStrategy};
use workload::Economy;

mod config;
mod integration_test;
mod tracing;
mod workload;
use crate::tracing::setup_tracing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,

    #[arg(
        long = "strategy",
        value_name = "strategy",
        help = "Transfer strategy to run, overrides workload.strategies. Repeatable"
    )]
    strategies: Vec<StrategyKind>,
}

fn build_strategy(kind: StrategyKind, non_negative: bool) -> Arc<dyn TransferStrategy> {
    match kind {
        StrategyKind::ReadModifyWrite if non_negative => Arc::new(ReadModifyWrite::non_negative()),
        kind => kind.build(),
    }
}

async fn log_total(economy: &Economy, aggregator: &RetryingAggregator, stage: &str) {
    match economy.total_balance(aggregator).await {
        Ok(total) => info!(stage, total, "sum of all balances"),
        Err(err) => error!(stage, "failed to sum balances: {err}"),
    }
}

async fn run(config: BenchConfig) -> Result<()> {
    let metrics_provider = metrics::init_provider(
        config.telemetry.enable_metrics,
        config.telemetry.endpoint.as_ref(),
        config.telemetry.metrics_interval,
        env!("CARGO_PKG_VERSION"),
    )?;

    let client = StoreClient::open(config.store.connection_options(), config.faults.options())?;
    let economy = Economy::init(client, &config.workload).await?;
    let aggregator = RetryingAggregator::new(config.workload.aggregate_max_attempts);
    log_total(&economy, &aggregator, "initial").await;

    for kind in &config.workload.strategies {
        let strategy = build_strategy(*kind, config.workload.non_negative);
        economy
            .run_transfers(strategy, config.workload.runs)
            .await?;
        log_total(&economy, &aggregator, &format!("after {kind}")).await;
    }

    warn!("timings are indicative only, this is not a benchmark");

    if let Some(provider) = metrics_provider {
        if let Err(err) = provider.shutdown() {
            error!("Error shutting down meter provider: {:?}", err);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let mut config = match cli.config {
        Some(path) => match BenchConfig::from_path(&path.to_string_lossy()) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Error loading config {}: {:?}", path.display(), err);
                std::process::exit(1);
            }
        },
        None => BenchConfig::default(),
    };
    if !cli.strategies.is_empty() {
        config.workload.strategies = cli.strategies;
    }

    setup_tracing(&config);

    let root_span = info_span!("occ-bank", env = config.env, store = ?config.store);
    let _guard = root_span.enter();

    if let Err(err) = run(config).await {
        error!("Error running workload: {:?}", err);
        std::process::exit(1);
    }
}
