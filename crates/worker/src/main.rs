use std::sync::Arc;

use anyhow::Context;

use karaoke_infra::separation::CommandSeparator;
use karaoke_infra::workers::{SeparationWorker, WorkerSettings};
use karaoke_infra::{Backends, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    karaoke_observability::init();

    // Missing queue, table or bucket names are fatal here; nothing else is.
    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    let separator = CommandSeparator::from_command_line(&config.separator_command)
        .context("SEPARATOR_COMMAND is empty")?;

    let backends = Backends::connect(&config.backends)
        .await
        .context("failed to connect backends")?;

    tracing::info!(
        queue = %config.backends.queue_name,
        table = %config.backends.table_name,
        output_bucket = %config.output.bucket,
        separator = %separator.program(),
        model = %config.separation.model,
        "starting worker"
    );

    let worker = Arc::new(SeparationWorker::new(
        &backends,
        Arc::new(separator),
        WorkerSettings::from_config(&config),
    ));
    let handle = worker.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutdown requested; draining current cycle");
    let stats = handle.shutdown().await;
    tracing::info!(
        cycles = stats.cycles,
        succeeded = stats.succeeded,
        failed = stats.failed,
        skipped = stats.skipped,
        "worker stopped"
    );
    Ok(())
}
