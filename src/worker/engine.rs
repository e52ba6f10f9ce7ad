//! Worker engine — claims jobs and drives downloads to a terminal
//! state.
//!
//! One engine instance polls the store for eligible work, runs up to
//! `concurrency_limit` transfers as spawned tasks, and is the only
//! writer of owner-side state: heartbeats, completion, failure, and
//! cancel acknowledgement all go through the engine, never the
//! downloader.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::downloader::{DownloadRequest, Downloader, ProgressEvent};
use crate::jobs::model::{DownloadJob, JobProgress};
use crate::store::JobStore;

/// Grace period after flipping cancel signals during drain.
const DRAIN_CANCEL_GRACE: Duration = Duration::from_secs(2);

pub struct Engine {
    worker_id: String,
    store: Arc<dyn JobStore>,
    downloader: Arc<dyn Downloader>,
    config: WorkerConfig,
    /// Cancel signal per in-flight job. Entry lifetime brackets the job
    /// task; map size is the live concurrency measure.
    in_flight: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
}

impl Engine {
    pub fn new(
        worker_id: String,
        store: Arc<dyn JobStore>,
        downloader: Arc<dyn Downloader>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            worker_id,
            store,
            downloader,
            config,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn in_flight_count(&self) -> usize {
        match self.in_flight.lock() {
            Ok(map) => map.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn register(&self, job_id: Uuid, cancel_tx: watch::Sender<bool>) {
        match self.in_flight.lock() {
            Ok(mut map) => {
                map.insert(job_id, cancel_tx);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(job_id, cancel_tx);
            }
        }
    }

    fn unregister(&self, job_id: Uuid) {
        match self.in_flight.lock() {
            Ok(mut map) => {
                map.remove(&job_id);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&job_id);
            }
        }
    }

    /// Flip the cancel signal for every in-flight job.
    fn cancel_all_local(&self) {
        let map = match self.in_flight.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (job_id, tx) in map.iter() {
            debug!(job_id = %job_id, "Signalling local cancel");
            let _ = tx.send(true);
        }
    }

    /// Main loop: poll, claim into free slots, spawn job tasks. Returns
    /// after the shutdown signal is observed and in-flight jobs have
    /// drained (or been cancelled past the drain timeout).
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.worker_id, "Worker engine started");

        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = poll.tick() => {}
            }

            // Reap finished tasks so the set doesn't grow unbounded.
            while tasks.try_join_next().is_some() {}

            let slots = self
                .config
                .concurrency_limit
                .saturating_sub(self.in_flight_count());
            if slots == 0 {
                continue;
            }

            let claimed = match self.store.claim_next(&self.worker_id, slots).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "Claim failed");
                    continue;
                }
            };

            for job in claimed {
                let (cancel_tx, cancel_rx) = watch::channel(false);
                self.register(job.id, cancel_tx);
                let engine = Arc::clone(&self);
                tasks.spawn(async move {
                    let job_id = job.id;
                    engine.run_job(job, cancel_rx).await;
                    engine.unregister(job_id);
                });
            }
        }

        info!(
            worker_id = %self.worker_id,
            in_flight = self.in_flight_count(),
            "Shutdown requested, draining"
        );
        self.drain(tasks).await;
        info!(worker_id = %self.worker_id, "Worker engine stopped");
    }

    /// Wait for in-flight jobs up to `drain_timeout`; cooperatively
    /// cancel whatever remains and give it a short grace, then abort.
    /// Anything still running afterwards is left for stale reclamation.
    async fn drain(&self, mut tasks: JoinSet<()>) {
        let all_done = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.drain_timeout, all_done)
            .await
            .is_ok()
        {
            return;
        }

        warn!(
            worker_id = %self.worker_id,
            remaining = self.in_flight_count(),
            "Drain timeout elapsed, cancelling in-flight jobs"
        );
        self.cancel_all_local();

        let rest_done = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(DRAIN_CANCEL_GRACE, rest_done)
            .await
            .is_err()
        {
            warn!(worker_id = %self.worker_id, "Aborting unresponsive job tasks");
            tasks.abort_all();
        }
    }

    /// Drive one claimed job to a terminal write.
    async fn run_job(&self, job: DownloadJob, cancel_rx: watch::Receiver<bool>) {
        let job_id = job.id;
        debug!(job_id = %job_id, source_ref = %job.source_ref, "Starting download");

        let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressEvent>(32);
        let request = DownloadRequest {
            job_id,
            source_ref: job.source_ref.clone(),
            format_hint: job.format_hint.clone(),
            auth: Default::default(),
            resume_from: (job.downloaded_bytes > 0).then_some(job.downloaded_bytes as u64),
        };

        let cancel_tx = self.cancel_sender(job_id);
        let mut transfer = pin!(self.downloader.start(request, progress_tx, cancel_rx));

        let mut last_flush = Instant::now();
        let mut last_percent: u8 = 0;
        let mut latest = JobProgress::default();
        let mut hb = tokio::time::interval(self.config.heartbeat_interval);
        hb.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        hb.reset(); // first tick should not fire immediately

        let mut progress_open = true;
        let result = loop {
            tokio::select! {
                result = &mut transfer => break result,
                maybe_event = progress_rx.recv(), if progress_open => {
                    match maybe_event {
                        Some(event) => {
                            latest = JobProgress::from_bytes(
                                event.downloaded_bytes,
                                event.total_bytes,
                            );
                            if should_flush(
                                last_flush.elapsed(),
                                self.config.heartbeat_interval,
                                last_percent,
                                latest.percent,
                                self.config.heartbeat_percent_delta,
                            ) {
                                if self.flush_heartbeat(job_id, latest, &cancel_tx).await {
                                    // Ownership lost; stop writing.
                                    return;
                                }
                                last_flush = Instant::now();
                                last_percent = latest.percent;
                            }
                        }
                        None => progress_open = false,
                    }
                }
                // Liveness flush even when no bytes are flowing.
                _ = hb.tick() => {
                    if last_flush.elapsed() >= self.config.heartbeat_interval {
                        if self.flush_heartbeat(job_id, latest, &cancel_tx).await {
                            return;
                        }
                        last_flush = Instant::now();
                        last_percent = latest.percent;
                    }
                }
            }
        };

        let locally_cancelled = cancel_tx
            .as_ref()
            .map(|tx| *tx.borrow())
            .unwrap_or(false);

        match result {
            Ok(output) => {
                // A transfer that finished despite a late cancel signal
                // still counts; keep the artifact.
                match self
                    .store
                    .complete(job_id, &self.worker_id, &output.output_ref, Some(output.file_size_bytes))
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_ownership_lost() => {
                        debug!(job_id = %job_id, "Completion superseded by new owner");
                    }
                    Err(e) => error!(job_id = %job_id, error = %e, "Failed to record completion"),
                }
            }
            Err(_) if locally_cancelled => {
                match self.store.mark_cancelled(job_id, &self.worker_id).await {
                    Ok(()) => {}
                    Err(e) if e.is_ownership_lost() => {
                        debug!(job_id = %job_id, "Cancel acknowledgement superseded");
                    }
                    Err(e) => error!(job_id = %job_id, error = %e, "Failed to record cancel"),
                }
            }
            Err(err) => {
                warn!(job_id = %job_id, kind = %err.kind, error = %err.message, "Download failed");
                let retryable = err.is_retryable();
                match self
                    .store
                    .fail(job_id, &self.worker_id, err.kind, &err.message, retryable)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_ownership_lost() => {
                        debug!(job_id = %job_id, "Failure report superseded by new owner");
                    }
                    Err(e) => error!(job_id = %job_id, error = %e, "Failed to record failure"),
                }
            }
        }
    }

    fn cancel_sender(&self, job_id: Uuid) -> Option<watch::Sender<bool>> {
        let map = match self.in_flight.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(&job_id).cloned()
    }

    /// Write a heartbeat and relay a cancellation request into the
    /// local cancel signal. Returns true when ownership was lost and
    /// the job must be abandoned without further writes.
    async fn flush_heartbeat(
        &self,
        job_id: Uuid,
        progress: JobProgress,
        cancel_tx: &Option<watch::Sender<bool>>,
    ) -> bool {
        match self.store.heartbeat(job_id, &self.worker_id, progress).await {
            Ok(ack) => {
                if ack.cancel_requested {
                    info!(job_id = %job_id, "Cancellation observed at heartbeat");
                    if let Some(tx) = cancel_tx {
                        let _ = tx.send(true);
                    }
                }
                false
            }
            Err(e) if e.is_ownership_lost() => {
                warn!(job_id = %job_id, "Ownership lost, abandoning job");
                true
            }
            Err(e) => {
                // Transient store trouble; the transfer keeps going and
                // the next checkpoint retries.
                warn!(job_id = %job_id, error = %e, "Heartbeat write failed");
                false
            }
        }
    }
}

/// Heartbeat throttle: flush when enough time passed or progress jumped
/// by at least `percent_delta` points.
fn should_flush(
    elapsed: Duration,
    interval: Duration,
    last_percent: u8,
    percent: u8,
    percent_delta: u8,
) -> bool {
    elapsed >= interval || percent.saturating_sub(last_percent) >= percent_delta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_after_interval() {
        assert!(should_flush(
            Duration::from_secs(3),
            Duration::from_secs(2),
            10,
            11,
            5
        ));
    }

    #[test]
    fn flush_on_percent_jump() {
        assert!(should_flush(
            Duration::from_millis(100),
            Duration::from_secs(2),
            10,
            15,
            5
        ));
    }

    #[test]
    fn no_flush_when_quiet_and_recent() {
        assert!(!should_flush(
            Duration::from_millis(100),
            Duration::from_secs(2),
            10,
            12,
            5
        ));
    }

    #[test]
    fn percent_regression_does_not_flush() {
        assert!(!should_flush(
            Duration::from_millis(100),
            Duration::from_secs(2),
            50,
            40,
            5
        ));
    }
}
