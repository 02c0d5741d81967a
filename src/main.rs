mod error;
mod api;
mod chain;
mod raffle;
mod settlement;
mod server;
mod bootstrap;
mod middleware;
mod config;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tracing::info;

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,raffleup_backend=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before anything reads the environment
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting RaffleUp settlement backend");

    let config = config::Config::from_env().context("loading configuration")?;
    info!("📋 Configuration loaded: {:?}", config);

    let state = bootstrap::initialize_app_state(&config)
        .await
        .context("initializing application state")?;

    // Create HTTP server
    let app = server::create_app(state, &server::HttpSettings::from_config(&config));

    // Run the Server
    server::run_server(app, &config.bind_address).await?;

    Ok(())
}
