use std::{sync::Arc, time::Duration};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{info, warn};

use crate::{
    api::AppState,
    chain::{ChainGateway, EvmGateway},
    config::Config,
    error::AppResult,
    raffle::{InMemoryRaffleStore, PgRaffleStore, RaffleStore},
    settlement::{SettlementReconciler, SettlementScheduler},
};

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let (store, store_kind): (Arc<dyn RaffleStore>, &'static str) = match config.database_url() {
        Some(url) => {
            let pool = initialize_database(url, config.db_max_connections).await?;
            (Arc::new(PgRaffleStore::new(pool)), "postgres")
        }
        None => {
            warn!("⚠️  DATABASE_URL not set - using in-memory store, data is lost on restart");
            (Arc::new(InMemoryRaffleStore::new()), "memory")
        }
    };

    info!("⚙️  Initializing chain gateway...");
    let evm = EvmGateway::connect(config.evm()).await?;
    info!("🔑 Settlement transactions signed by {}", evm.operator_address());
    if let Err(e) = evm.verify_chain_id().await {
        warn!("⚠️  Chain id check failed: {}", e);
    }
    let gateway: Arc<dyn ChainGateway> = Arc::new(evm);

    let reconciler = Arc::new(SettlementReconciler::new(
        store.clone(),
        gateway.clone(),
        config.settlement(),
    ));

    match SettlementScheduler::from_secs(config.settlement_interval_secs, reconciler.clone()) {
        Some(scheduler) => {
            // Runs for the life of the process
            scheduler.start();
        }
        None => info!("⏰ In-process settlement scheduler disabled, waiting for cron triggers"),
    }

    let auth = config.auth();
    if auth.cron_secret.is_none() {
        warn!("⚠️  CRON_SECRET_KEY not set - the cron endpoint will reject every call");
    }
    if auth.api_key.is_none() {
        warn!("⚠️  API_KEY not set - raffle creation is open, manual settlement is disabled");
    }

    info!("✅ Application state ready ({} store)", store_kind);

    Ok(AppState {
        store,
        gateway,
        reconciler,
        auth: Arc::new(auth),
        store_kind,
    })
}

async fn initialize_database(database_url: &str, max_connections: u32) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: {} max connections", max_connections);

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
