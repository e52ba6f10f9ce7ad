//! Supervisor — owns the engine task, the stale-reclaim sweep, and the
//! shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::downloader::Downloader;
use crate::store::JobStore;

use super::engine::Engine;

/// Extra time shutdown waits for the engine beyond its own drain
/// timeout, covering the cancel grace inside the engine.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    engine_handle: JoinHandle<()>,
    reclaim_handle: JoinHandle<()>,
    drain_timeout: Duration,
}

impl Supervisor {
    /// Spawn the worker engine and the reclaim sweep.
    pub fn start(
        store: Arc<dyn JobStore>,
        downloader: Arc<dyn Downloader>,
        config: WorkerConfig,
    ) -> Self {
        let worker_id = generate_worker_id();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let engine = Arc::new(Engine::new(
            worker_id.clone(),
            Arc::clone(&store),
            downloader,
            config.clone(),
        ));
        let engine_handle = tokio::spawn(engine.run(shutdown_rx.clone()));

        let reclaim_handle = tokio::spawn(reclaim_loop(
            store,
            config.reclaim_interval,
            config.stale_after,
            shutdown_rx,
        ));

        info!(worker_id = %worker_id, "Supervisor started");
        Self {
            shutdown_tx,
            engine_handle,
            reclaim_handle,
            drain_timeout: config.drain_timeout,
        }
    }

    /// Signal shutdown and wait for the engine to drain. Always
    /// returns; a job the engine could not finish is left running with
    /// a decaying heartbeat for some reclaim sweep to pick up.
    pub async fn shutdown(self) {
        info!("Supervisor shutting down");
        let _ = self.shutdown_tx.send(true);

        let deadline = self.drain_timeout + SHUTDOWN_SLACK;
        if tokio::time::timeout(deadline, self.engine_handle)
            .await
            .is_err()
        {
            error!("Engine did not stop within the drain deadline");
        }

        self.reclaim_handle.abort();
        info!("Supervisor stopped");
    }
}

/// Periodically return running jobs with stale heartbeats to the queue.
async fn reclaim_loop(
    store: Arc<dyn JobStore>,
    interval: Duration,
    stale_after: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.reset();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = tick.tick() => {
                match store.reclaim_stale(stale_after).await {
                    Ok(ids) if !ids.is_empty() => {
                        info!(count = ids.len(), "Reclaim sweep returned jobs to the queue");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Reclaim sweep failed"),
                }
            }
        }
    }
}

fn generate_worker_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("worker-{}-{}", std::process::id(), &suffix[..8])
}
