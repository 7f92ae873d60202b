use std::sync::Arc;

use anyhow::Context;

use karaoke_infra::separation::CommandSeparator;
use karaoke_infra::workers::{SeparationWorker, WorkerHandle, WorkerSettings};
use karaoke_infra::{Backends, ControllerConfig, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    karaoke_observability::init();

    let config = ControllerConfig::from_env().context("invalid configuration")?;
    let backends = Backends::connect(&config.backends)
        .await
        .context("failed to connect backends")?;

    let worker = if config.embedded_worker {
        Some(spawn_embedded_worker(&backends)?)
    } else {
        None
    };

    let services = karaoke_api::app::services::build_services(&config, &backends);
    let app = karaoke_api::app::build_app(services);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(worker) = worker {
        tracing::info!("draining embedded worker");
        worker.shutdown().await;
    }
    Ok(())
}

fn spawn_embedded_worker(backends: &Backends) -> anyhow::Result<WorkerHandle> {
    let config = WorkerConfig::from_env().context("invalid embedded worker configuration")?;
    let separator = CommandSeparator::from_command_line(&config.separator_command)
        .context("SEPARATOR_COMMAND is empty")?;

    let settings = WorkerSettings::from_config(&config).with_name("embedded-worker");
    let worker = Arc::new(SeparationWorker::new(backends, Arc::new(separator), settings));
    Ok(worker.spawn())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
