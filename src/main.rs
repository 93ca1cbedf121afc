//! daare - self-hosted uptime monitoring engine.
//!
//! Schedules health checks against configured monitors, classifies results
//! as UP/DOWN, notifies on transitions, and durably buffers results before
//! batching them into SQLite.

mod check;
mod config;
mod db;
mod engine;
mod guard;
mod notify;

use config::{ServerConfig, Settings};
use db::Store;
use engine::Engine;
use notify::DiscordNotifier;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("daare=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting daare");
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database and settings
    let store = Store::new(&cfg.db_path)?;
    let settings = Arc::new(Settings::new(store.clone()));
    tracing::info!("Database initialized successfully");

    let notifier = Arc::new(DiscordNotifier::new(cfg.discord_webhook_url.clone()));

    // Start the scheduling engine
    let engine = Engine::start(store, &cfg.data_dir, settings, notifier)?;

    // Run until interrupted, then flush and exit
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    engine.stop().await;
    tracing::info!("Shutdown complete");

    Ok(())
}
