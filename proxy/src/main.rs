use std::sync::Arc;

use clap::Parser;
use config::Config;
use tokio_util::sync::CancellationToken;

mod coordinator;
mod error;
mod logger;
mod notifier;
mod protocol;
mod run;
mod sanitize;
mod server;
mod ws;

use coordinator::{Coordinator, CoordinatorConfig};
use notifier::Notifier;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    logger::init(&config.log_filter);
    log::info!("sune-proxy starting on port {}", config.port);

    let store: Arc<dyn store::KvStore> = Arc::new(store::MemoryKvStore::new());
    let notifier = Notifier::new(config.ntfy_url.clone());
    let coordinator_config = CoordinatorConfig {
        batch_bytes: config.batch_bytes,
        batch_ms: config.batch_duration(),
        max_run_ms: config.max_run_duration(),
        kv_ttl: std::time::Duration::from_secs(config.kv_ttl_secs),
        sweep_interval: config.sweep_interval(),
    };
    let coordinator = Arc::new(Coordinator::new(store, notifier, coordinator_config));

    let shutdown = CancellationToken::new();
    let sweeper = coordinator.spawn_sweeper(shutdown.clone());

    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_shutdown.cancel();
        }
    });

    let listen_address = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    server::serve(server::ServeConfig {
        listen_address,
        coordinator,
        shutdown_signal: shutdown,
    })
    .await?;

    sweeper.abort();

    Ok(())
}
