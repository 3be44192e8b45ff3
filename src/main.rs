//! Spyglass node.
//!
//! Starts the importer and index, wires them together, and runs until
//! interrupted. Configuration comes from `spyglass.toml` (discovered via
//! `XDG_CONFIG_HOME`, `HOME`, or `/etc/spyglass`) overlaid with
//! `SPYGLASS_`-prefixed environment variables; `RUST_LOG` controls log
//! filtering.
//!
//! Exits 0 on clean shutdown, 1 on unrecoverable I/O or corruption
//! during startup.

use spyglass::config::Config;
use spyglass::index::IndexConfig;
use spyglass::status::Verbosity;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spyglass=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(err) = run().await {
        tracing::error!(%err, kind = %err.kind(), "node failed");
        std::process::exit(1);
    }
}

async fn run() -> spyglass::Result<()> {
    let config = Config::load()?;
    let db_dir = config.db_dir();
    tracing::info!(db = %db_dir.display(), "starting spyglass node");

    let (importer, importer_task) = spyglass::importer::spawn(
        &db_dir,
        config.import.telemetry_interval(),
    )?;
    let (index, index_task) = spyglass::index::spawn(IndexConfig {
        dir: db_dir,
        partition_capacity: config.index.partition_capacity,
        max_inmem_partitions: config.index.max_inmem_partitions,
        taste_partitions: config.index.taste_partitions,
        num_workers: config.index.num_workers,
        delay_flush_until_shutdown: config.index.delay_flush_until_shutdown,
    })?;
    importer.register(index.slice_sender()).await?;
    importer.register_index(index.clone()).await?;

    tokio::signal::ctrl_c()
        .await
        .map_err(spyglass::Error::from)?;
    tracing::info!("shutting down");

    if let Ok(status) = index.status(Verbosity::Detailed).await {
        tracing::debug!(%status, "final index status");
    }
    importer.shutdown().await?;
    index.shutdown().await?;
    importer_task
        .await
        .map_err(|e| spyglass::Error::Unspecified(e.to_string()))??;
    index_task
        .await
        .map_err(|e| spyglass::Error::Unspecified(e.to_string()))??;
    tracing::info!("clean shutdown");
    Ok(())
}
