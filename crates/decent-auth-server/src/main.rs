use anyhow::{Context, Result};
use clap::Parser;
use decent_auth::{Broker, KvStore, MemoryStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

mod adapter;
mod config;
mod sqlite_store;
mod telemetry;

use crate::config::{ServerConfig, StoreConfig, StoreKind};
use crate::sqlite_store::SqliteStore;

#[derive(Parser)]
#[command(name = "decent-auth-server")]
#[command(author, version, about = "Multi-protocol login broker", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides `listen_addr`
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    telemetry::init().context("Failed to init telemetry")?;

    info!("Decent Auth server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut server_config =
        ServerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(listen) = cli.listen {
        server_config.listen_addr = listen;
    }
    server_config.log_config();

    let store = open_store(&server_config.store).await?;
    let broker = Broker::new(server_config.broker.clone(), store)
        .context("Failed to build login broker")?;
    let app = adapter::router(Arc::new(broker));

    let listener = tokio::net::TcpListener::bind(&server_config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", server_config.listen_addr))?;
    info!("Starting HTTP server on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn open_store(config: &StoreConfig) -> Result<Arc<dyn KvStore>> {
    match config.kind {
        StoreKind::Memory => {
            let store = Arc::new(MemoryStore::new());
            spawn_memory_purge(store.clone(), Duration::from_secs(config.purge_interval_secs));
            Ok(store)
        }
        StoreKind::Sqlite => {
            let store = SqliteStore::open(&config.path)
                .await
                .context("Failed to open store database")?;
            store
                .purge_expired()
                .await
                .context("Failed to purge expired rows")?;
            Ok(Arc::new(store))
        }
    }
}

fn spawn_memory_purge(store: Arc<MemoryStore>, every: Duration) {
    if every.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            store.purge_expired();
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, draining connections");
}
