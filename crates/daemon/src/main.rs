use tokio_util::sync::CancellationToken;

use seatflow_daemon::{API_KEY_ENV, TOKEN_ENV, http_transport, load_inventory};
use seatflow_infra::{Config, Orchestrator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    seatflow_observability::init(&config.logging);

    let inventory = load_inventory(config.inventory_path.as_deref())?;
    let transport = http_transport(
        &config,
        std::env::var(TOKEN_ENV).ok(),
        std::env::var(API_KEY_ENV).ok(),
    )?;
    let orchestrator = Orchestrator::from_config(&config, inventory, transport)?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutdown requested; finishing in-flight jobs"),
            Err(err) => tracing::error!(error = %err, "failed to listen for ctrl-c"),
        }
        shutdown.cancel();
    });

    tracing::info!(
        org_id = %config.remote.org_id,
        interval_secs = config.sync.interval_secs,
        workers = config.workers.pool_size,
        "seatflow daemon started"
    );
    orchestrator.run_forever(config.sync_interval(), cancel).await;
    Ok(())
}
