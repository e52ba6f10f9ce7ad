use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use classfetch::api::{self, AppState};
use classfetch::config::Config;
use classfetch::downloader::{Downloader, HttpDownloader};
use classfetch::orchestrator::Orchestrator;
use classfetch::store::{JobStore, LibSqlBackend, QueuePolicy};
use classfetch::worker::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    info!(
        db = %config.db_path.display(),
        listen = %config.listen_addr,
        concurrency = config.worker.concurrency_limit,
        "Starting classfetch"
    );

    let store: Arc<dyn JobStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path, QueuePolicy::from(&config.worker))
            .await
            .context("open job store")?,
    );

    let downloader: Arc<dyn Downloader> = Arc::new(
        HttpDownloader::new(config.download_dir.clone(), config.download_timeout)
            .context("build downloader")?,
    );

    let supervisor = Supervisor::start(
        Arc::clone(&store),
        downloader,
        config.worker.clone(),
    );

    let state = AppState {
        orchestrator: Arc::new(Orchestrator::new(Arc::clone(&store))),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "HTTP API listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "HTTP server exited");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("install Ctrl-C handler")?;
    info!("Shutdown signal received");

    // Drain the worker first so in-flight jobs reach a clean state,
    // then drop the server.
    supervisor.shutdown().await;
    server.abort();

    info!("Goodbye");
    Ok(())
}
