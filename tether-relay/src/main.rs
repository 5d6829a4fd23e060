//! tether-relay binary entry point.
//!
//! Usage:
//! ```bash
//! tether-relay --config relay.toml
//! tether-relay --bind 127.0.0.1:9000
//! tether-relay --help
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tether_relay::cleanup::spawn_cleanup_task;
use tether_relay::config::{Config, ConfigError};
use tether_relay::http::build_router;
use tether_relay::{Relay, SqliteStore};
use tracing_subscriber::EnvFilter;

/// Real-time call signaling and event relay for Tether.
#[derive(Parser, Debug)]
#[command(name = "tether-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short, default_value = "relay.toml")]
    config: PathBuf,

    /// Override the configured bind address
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, missing) = match Config::from_file(&cli.config) {
        Ok(config) => (config, false),
        Err(ConfigError::ReadError { .. }) if !cli.config.exists() => (Config::default(), true),
        Err(e) => return Err(e).context("loading configuration"),
    };
    if let Some(bind) = cli.bind {
        config.server.bind_address = bind;
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.filter))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if missing {
        tracing::warn!(
            "Config file {} not found, using defaults",
            cli.config.display()
        );
    }
    tracing::info!("tether-relay v{}", env!("CARGO_PKG_VERSION"));

    let store = SqliteStore::new(&config.storage.database, config.storage.undelivered_ttl_secs)
        .await
        .with_context(|| format!("opening {}", config.storage.database.display()))?;
    let store = Arc::new(store);

    let relay = Arc::new(Relay::builder(config.clone()).store(store.clone()).build());
    let cleanup = spawn_cleanup_task(store, relay.rate_limits().clone(), config.cleanup.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("binding {}", config.server.bind_address))?;
    tracing::info!("Listening on {}", config.server.bind_address);

    axum::serve(listener, build_router(relay))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    cleanup.abort();
    tracing::info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
