//! The `JobStore` trait — durable, race-free storage and atomic claim
//! of download jobs.
//!
//! The store is the only shared mutable resource between worker
//! processes. All mutations to a job go through its current owner,
//! except cancellation requests and stale reclamation, which are
//! compare-and-swap updates guarded by ownership checks so a superseded
//! owner's writes are rejected rather than silently applied.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::jobs::model::{DownloadJob, ErrorKind, JobProgress, JobStatus};

/// Response to a heartbeat write.
///
/// Carries the cancellation flag so the heartbeat checkpoint doubles as
/// the cooperative cancellation checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatAck {
    pub cancel_requested: bool,
}

/// What happened to a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was still pending; cancellation was immediate.
    Cancelled,
    /// The job is running; the flag is set and the owning worker will
    /// observe it at its next heartbeat checkpoint.
    CancelRequested,
    /// The job is already in a terminal state.
    AlreadyTerminal,
}

/// Query filter for job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    /// Maximum rows returned; 0 means the store default (100).
    pub limit: usize,
}

/// Durable job store with atomic claiming.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job in `Pending`. Does not validate reachability of
    /// `source_ref` — that is the extraction collaborator's concern.
    async fn enqueue(
        &self,
        source_ref: &str,
        format_hint: Option<&str>,
    ) -> Result<DownloadJob, StoreError>;

    /// Atomically claim up to `max_batch` eligible pending jobs,
    /// oldest-first, transitioning them to `Running` with
    /// `owner = worker_id` in the same statement that selected them.
    ///
    /// Jobs whose `not_before` has not elapsed are skipped. No two
    /// concurrent callers ever receive the same job id; returns an
    /// empty vec rather than blocking when nothing is eligible.
    async fn claim_next(
        &self,
        worker_id: &str,
        max_batch: usize,
    ) -> Result<Vec<DownloadJob>, StoreError>;

    /// Update liveness and progress for a job still owned by
    /// `worker_id`. Rejected with `OwnershipLost` if ownership changed.
    async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        progress: JobProgress,
    ) -> Result<HeartbeatAck, StoreError>;

    /// Transition `Running -> Completed` if still owned by `worker_id`.
    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        output_ref: &str,
        file_size_bytes: Option<i64>,
    ) -> Result<(), StoreError>;

    /// Record a failed attempt. If `retryable` and the retry budget
    /// remains: back to `Pending` with `retry_count += 1`, owner
    /// cleared, progress reset, and a backoff `not_before`. Otherwise
    /// terminal `Failed`.
    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        kind: ErrorKind,
        message: &str,
        retryable: bool,
    ) -> Result<(), StoreError>;

    /// Request cancellation. Immediate and terminal for pending jobs;
    /// cooperative (flag observed at the next checkpoint) for running
    /// ones.
    async fn request_cancel(&self, job_id: Uuid) -> Result<CancelOutcome, StoreError>;

    /// Owner acknowledges a cooperative cancel: `Running -> Cancelled`.
    async fn mark_cancelled(&self, job_id: Uuid, worker_id: &str) -> Result<(), StoreError>;

    /// Return running jobs whose heartbeat is older than `stale_after`
    /// to `Pending` with owner cleared. Models worker-crash recovery:
    /// it does not consume retry budget and preserves the persisted
    /// progress so the next owner can resume the transfer.
    async fn reclaim_stale(&self, stale_after: Duration) -> Result<Vec<Uuid>, StoreError>;

    /// Fetch a single job.
    async fn get(&self, job_id: Uuid) -> Result<Option<DownloadJob>, StoreError>;

    /// List jobs, newest first.
    async fn list(&self, filter: JobFilter) -> Result<Vec<DownloadJob>, StoreError>;
}
