use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use gamedex_gateway::{GatewayClient, GatewayConfig};
use gamedex_sync::{load_mapping_config, RunOptions, SyncConfig, SyncEngine};
use tracing_subscriber::EnvFilter;

mod destination;

use destination::RestDestination;

#[derive(Debug, Parser)]
#[command(name = "gamedex")]
#[command(about = "Reconcile a games library against the reference catalog")]
struct Cli {
    /// Refresh icons and covers even for records with no property changes
    #[arg(long)]
    force_icons: bool,
    /// Bypass the fast path and fully re-resolve every record
    #[arg(long)]
    force_full: bool,
    /// Parallel workers (recommended maximum: 4)
    #[arg(long, default_value_t = gamedex_sync::DEFAULT_WORKERS)]
    workers: usize,
    /// Reconcile only the most recently edited record
    #[arg(long)]
    most_recent: bool,
    /// Reconcile only the given record id
    #[arg(long)]
    record_id: Option<String>,
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{name} must be set"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    if config.library_id.is_empty() {
        bail!("GAMEDEX_LIBRARY_ID must be set");
    }

    let client_id = require_env("GAMEDEX_CLIENT_ID")?;
    let client_secret = require_env("GAMEDEX_CLIENT_SECRET")?;
    let destination_token = require_env("GAMEDEX_DESTINATION_TOKEN")?;

    let mapping = load_mapping_config(&config.mapping_path)?;

    let mut gateway_config = GatewayConfig::new(client_id, client_secret);
    if let Ok(base_url) = std::env::var("GAMEDEX_GATEWAY_URL") {
        gateway_config.base_url = base_url;
    }
    if let Ok(auth_url) = std::env::var("GAMEDEX_AUTH_URL") {
        gateway_config.auth_url = auth_url;
    }
    let gateway = Arc::new(GatewayClient::new(gateway_config)?);

    let mut store = RestDestination::new(destination_token)?;
    if let Ok(base_url) = std::env::var("GAMEDEX_DESTINATION_URL") {
        store = store.with_base_url(base_url);
    }
    let store = Arc::new(store);

    let engine = SyncEngine::new(gateway, store, mapping, config);
    let result = engine
        .run(RunOptions {
            force_icons: cli.force_icons,
            force_full: cli.force_full,
            workers: cli.workers,
            most_recent_only: cli.most_recent,
            record_id: cli.record_id,
        })
        .await;

    println!(
        "run {}: total={} updated={} skipped={} failed={}",
        result.run_id, result.total, result.updated, result.skipped, result.failed
    );
    if !result.success {
        bail!(result
            .message
            .unwrap_or_else(|| "synchronization failed".to_string()));
    }
    Ok(())
}
