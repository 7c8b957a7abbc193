//! Process entry point. Grounded on `data_analyzer::main`'s shape (clap
//! derive, `env_logger`, a `Register`, a list of `FooCtx::setup_and_run`
//! calls, then `wait_termination`); the coordination channel and lease are
//! wired to their in-process implementations (§4.8), matching a
//! single-worker deployment — a Redis pub/sub-backed `CoordinationChannel`
//! and lease are a thin swap-in, not shipped here (see DESIGN.md).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use env_logger::Env;
use log::info;
use tokio::signal;
use tokio::signal::unix::{signal, SignalKind};

use auction_engine::actors::prometheus_exporter::PrometheusExporterHandle;
use auction_engine::actors::scheduler::SchedulerCtx;
use auction_engine::actors::socket_layer::SocketLayerCtx;
use auction_engine::actors::sync_worker::SyncWorkerCtx;
use auction_engine::cache::redis_store::RedisStore;
use auction_engine::cache::AtomicAuctionStore;
use auction_engine::configuration::Configuration;
use auction_engine::coordinator::{AlwaysPrimaryLease, Coordinator, LocalCoordinationChannel};
use auction_engine::events::{EventBus, LocalEventBus};
use auction_engine::ledger::mongo_store::MongoLedgerStore;
use auction_engine::ledger::LedgerStore;
use auction_engine::register::Register;

const PRIMARY_LEASE_TTL: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Config file
    #[clap(short, long, default_value = "./Config.toml")]
    config: String,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    info!("starting auction_engine");

    let config = Configuration::new(&Args::parse().config)?;

    let cache: Arc<dyn AtomicAuctionStore> =
        Arc::new(RedisStore::new_with_url(&config.get_hot_cache_config().url).await?);
    let ledger: Arc<dyn LedgerStore> = Arc::new(
        MongoLedgerStore::new_with_url(
            &config.get_ledger_config().url,
            &config.get_ledger_config().database_name,
        )
        .await?,
    );
    let event_bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
    let coordinator = Arc::new(Coordinator::new(
        uuid::Uuid::new_v4().to_string(),
        Arc::new(AlwaysPrimaryLease),
        Arc::new(LocalCoordinationChannel::new()),
    ));
    coordinator.spawn_lease_loop(PRIMARY_LEASE_TTL);

    let register = Register::new(config, cache, ledger, coordinator.clone(), event_bus);

    let scheduler = SchedulerCtx::setup_and_run(&register, now_ms).await?;
    SyncWorkerCtx::setup_and_run(&register).await?;
    SocketLayerCtx::setup_and_run(&register, scheduler).await?;
    PrometheusExporterHandle::setup_and_run(&register).await?;

    wait_termination().await;

    coordinator.release().await;
    info!("shutting down auction_engine");
    Ok(())
}

async fn wait_termination() {
    let mut term = signal(SignalKind::terminate()).unwrap();
    let mut inter = signal(SignalKind::interrupt()).unwrap();

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Ctrl-C pressed");
        },
        _ = term.recv() => {
            info!("terminate signal received");
        },
        _ = inter.recv() => {
            info!("interrupt signal received");
        },
    }
}
