//! meridiand - the Meridian storage broker daemon
//!
//! Loads the broker config and resource manifest, opens the store and serves
//! the wire protocol until interrupted.
//!
//! Usage: `meridiand [CONFIG_FILE]`. Without an argument the config is read
//! from the Meridian config directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use broker::{Broker, BrokerConfig, ResourceManifest, Server};
use log::{error, info, warn};
use tokio::sync::watch;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run()) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => BrokerConfig::from_file(&path)?,
        None => BrokerConfig::load()?,
    };
    let manifest = ResourceManifest::load()?;
    if manifest.resources.is_empty() {
        warn!("No resources configured; adapters must register before syncing");
    }

    let broker = Broker::open(config, &manifest)?;
    let (stop, shutdown) = watch::channel(false);
    let background = broker.spawn_background(shutdown.clone())?;
    let server = Server::bind(broker).await?;

    let serving = tokio::spawn(server.run(shutdown));
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for interrupt")?;
    info!("Interrupt received, shutting down");
    // receivers are still held by the listener and background tasks
    let _ = stop.send(true);

    serving.await.context("Listener task panicked")??;
    for handle in background {
        if let Err(e) = handle.await {
            warn!("Background task panicked: {}", e);
        }
    }
    info!("meridiand stopped");
    Ok(())
}
