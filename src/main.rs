//! playoffd - Contest Scheduler Daemon
//!
//! Poll-and-process loop over the contest core: advance overdue contest
//! lifecycles (settling the ones whose tournament ended), then drive every
//! open payout job until its transfers are terminal. No push, no long-lived
//! background tasks beyond this loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use dotenv::dotenv;
use tokio::time::interval;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use playoff_backend::{
    db::Db,
    lifecycle::{ContestLifecycleStore, LifecycleAdvancer},
    payout::{
        DbDestinationResolver, HttpPaymentProvider, PayoutExecutionService, PayoutJobService,
        PayoutStore, DEFAULT_BATCH_SIZE,
    },
    settlement::{SettlementService, StoredScoreStrategy, StrategyRegistry},
};

#[derive(Debug, Parser)]
#[command(name = "playoffd", about = "Contest lifecycle and payout scheduler")]
struct Args {
    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "./playoff.db")]
    database_path: String,

    /// Payment provider base URL
    #[arg(long, env = "PROVIDER_BASE_URL", default_value = "https://api.payments.example.com")]
    provider_base_url: String,

    /// Payment provider API key
    #[arg(long, env = "PROVIDER_API_KEY", hide_env_values = true)]
    provider_api_key: String,

    /// Seconds between scheduler passes
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 30)]
    poll_interval_secs: u64,

    /// Transfers claimed per job per pass
    #[arg(long, env = "PAYOUT_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    payout_batch_size: usize,

    /// Comma-separated sports served by the stored-score strategy
    #[arg(long, env = "SPORTS", default_value = "nfl", value_delimiter = ',')]
    sports: Vec<String>,

    /// Run one scheduler pass and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "playoffd=info,playoff_backend=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    info!(db = %args.database_path, interval_secs = args.poll_interval_secs, "playoffd starting");

    let db = Db::open(&args.database_path).context("open database")?;

    let mut registry = StrategyRegistry::new();
    for sport in &args.sports {
        registry.register(sport, Arc::new(StoredScoreStrategy));
    }
    info!(sports = ?registry.sports(), "strategies registered");

    let store = ContestLifecycleStore::new(db.clone());
    let settlement = SettlementService::new(db.clone(), Arc::new(registry));
    let advancer = LifecycleAdvancer::new(store, settlement);

    let provider = HttpPaymentProvider::new(&args.provider_base_url, &args.provider_api_key)
        .context("build payment provider")?;
    let payout_store = PayoutStore::new(db.clone());
    let execution = PayoutExecutionService::new(
        db.clone(),
        Arc::new(provider),
        Arc::new(DbDestinationResolver),
    );
    let jobs = PayoutJobService::new(db, payout_store, execution)
        .with_batch_size(args.payout_batch_size);

    let mut ticker = interval(Duration::from_secs(args.poll_interval_secs.max(1)));
    loop {
        ticker.tick().await;

        match advancer.advance_all(Utc::now()).await {
            Ok(inspected) => info!(inspected, "lifecycle pass done"),
            Err(e) => error!(error = %e, "lifecycle pass failed"),
        }

        match jobs.process_open_jobs().await {
            Ok(count) => info!(jobs = count, "payout pass done"),
            Err(e) => error!(error = %e, "payout pass failed"),
        }

        if args.once {
            info!("single pass requested, exiting");
            return Ok(());
        }
    }
}
