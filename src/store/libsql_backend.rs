//! libSQL backend — async `JobStore` implementation.
//!
//! Claiming relies on SQLite's serialized writes: the claim is one
//! `UPDATE ... WHERE id IN (SELECT ...) AND status = 'pending'
//! RETURNING` statement, so the selection and the ownership write are
//! atomic and a row that lost the race fails the repeated status guard
//! instead of being handed to a second caller. Every owner-side write
//! carries a `WHERE owner = ? AND status = 'running'` predicate; zero
//! affected rows surfaces as `StoreError::OwnershipLost`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::StoreError;
use crate::jobs::model::{DownloadJob, ErrorKind, JobProgress, JobStatus};
use crate::retry;
use crate::store::migrations;
use crate::store::traits::{CancelOutcome, HeartbeatAck, JobFilter, JobStore};

/// Retry budget and backoff knobs the store needs to resolve `fail()`.
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(300),
        }
    }
}

impl From<&WorkerConfig> for QueuePolicy {
    fn from(cfg: &WorkerConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            backoff_base: cfg.backoff_base,
            backoff_cap: cfg.backoff_cap,
        }
    }
}

/// libSQL job store backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async
/// use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    policy: QueuePolicy,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path, policy: QueuePolicy) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("create database directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            policy,
        };
        migrations::run_migrations(&backend.conn).await?;
        info!(path = %path.display(), "Job store opened");
        Ok(backend)
    }

    /// Create an in-memory store (for tests).
    pub async fn new_memory(policy: QueuePolicy) -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            policy,
        };
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// All columns in row-mapping order (see `row_to_job`).
const JOB_COLUMNS: &str = "id, source_ref, format_hint, status, owner, claimed_at, heartbeat_at, \
     progress_percent, downloaded_bytes, total_bytes, retry_count, not_before, cancel_requested, \
     error_kind, error_message, output_ref, file_size_bytes, created_at, started_at, finished_at";

/// Format a timestamp with fixed precision so stored strings compare
/// lexicographically in chronological order.
fn fmt_dt(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_str() -> String {
    fmt_dt(Utc::now())
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to a libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(n: Option<i64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}

/// Map a libsql row to a DownloadJob. Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<DownloadJob, libsql::Error> {
    let id_str: String = row.get(0)?;
    let status_str: String = row.get(3)?;
    let error_kind_str: Option<String> = row.get::<String>(13).ok();

    Ok(DownloadJob {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        source_ref: row.get(1)?,
        format_hint: row.get::<String>(2).ok(),
        status: status_str.parse().unwrap_or(JobStatus::Pending),
        owner: row.get::<String>(4).ok(),
        claimed_at: row.get::<String>(5).ok().map(|s| parse_datetime(&s)),
        heartbeat_at: row.get::<String>(6).ok().map(|s| parse_datetime(&s)),
        progress_percent: row.get::<i64>(7)?.clamp(0, 100) as u8,
        downloaded_bytes: row.get(8)?,
        total_bytes: row.get::<i64>(9).ok(),
        retry_count: row.get::<i64>(10)?.max(0) as u32,
        not_before: row.get::<String>(11).ok().map(|s| parse_datetime(&s)),
        cancel_requested: row.get::<i64>(12)? != 0,
        error_kind: error_kind_str.and_then(|s| s.parse::<ErrorKind>().ok()),
        error_message: row.get::<String>(14).ok(),
        output_ref: row.get::<String>(15).ok(),
        file_size_bytes: row.get::<i64>(16).ok(),
        created_at: parse_datetime(&row.get::<String>(17)?),
        started_at: row.get::<String>(18).ok().map(|s| parse_datetime(&s)),
        finished_at: row.get::<String>(19).ok().map(|s| parse_datetime(&s)),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn enqueue(
        &self,
        source_ref: &str,
        format_hint: Option<&str>,
    ) -> Result<DownloadJob, StoreError> {
        let job = DownloadJob::new(source_ref, format_hint.map(str::to_string));
        let conn = self.conn();

        conn.execute(
            "INSERT INTO download_jobs (id, source_ref, format_hint, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![
                job.id.to_string(),
                source_ref,
                opt_text(format_hint),
                fmt_dt(job.created_at),
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("enqueue: {e}")))?;

        debug!(job_id = %job.id, source_ref, "Job enqueued");
        Ok(job)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        max_batch: usize,
    ) -> Result<Vec<DownloadJob>, StoreError> {
        if max_batch == 0 {
            return Ok(Vec::new());
        }

        let now = now_str();
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE download_jobs
                     SET status = 'running', owner = ?1, claimed_at = ?2, heartbeat_at = ?2,
                         started_at = COALESCE(started_at, ?2)
                     WHERE id IN (
                         SELECT id FROM download_jobs
                         WHERE status = 'pending'
                           AND (not_before IS NULL OR not_before <= ?2)
                         ORDER BY created_at ASC
                         LIMIT ?3
                     )
                     AND status = 'pending'
                     RETURNING {JOB_COLUMNS}"
                ),
                params![worker_id, now, max_batch as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("claim_next: {e}")))?;

        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let job = row_to_job(&row)
                .map_err(|e| StoreError::Query(format!("claim_next row parse: {e}")))?;
            jobs.push(job);
        }

        if !jobs.is_empty() {
            debug!(worker_id, count = jobs.len(), "Claimed jobs");
        }
        Ok(jobs)
    }

    async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        progress: JobProgress,
    ) -> Result<HeartbeatAck, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                // MAX keeps progress_percent non-decreasing within a
                // running episode even if checkpoints arrive out of
                // order; MIN caps downloaded_bytes at the known total
                // so an over-reporting transfer cannot persist a row
                // with more bytes than the source claims to have.
                "UPDATE download_jobs
                 SET heartbeat_at = ?1,
                     progress_percent = MAX(progress_percent, ?2),
                     downloaded_bytes = MIN(?3, COALESCE(?4, total_bytes, ?3)),
                     total_bytes = COALESCE(?4, total_bytes)
                 WHERE id = ?5 AND owner = ?6 AND status = 'running'
                 RETURNING cancel_requested",
                params![
                    now_str(),
                    progress.percent as i64,
                    progress.downloaded_bytes,
                    opt_int(progress.total_bytes),
                    job_id.to_string(),
                    worker_id,
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("heartbeat: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let cancel: i64 = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("heartbeat row parse: {e}")))?;
                Ok(HeartbeatAck {
                    cancel_requested: cancel != 0,
                })
            }
            Ok(None) => Err(StoreError::OwnershipLost {
                id: job_id,
                worker_id: worker_id.to_string(),
            }),
            Err(e) => Err(StoreError::Query(format!("heartbeat: {e}"))),
        }
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        output_ref: &str,
        file_size_bytes: Option<i64>,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        let affected = conn
            .execute(
                "UPDATE download_jobs
                 SET status = 'completed', owner = NULL, progress_percent = 100,
                     output_ref = ?1, file_size_bytes = ?2, finished_at = ?3
                 WHERE id = ?4 AND owner = ?5 AND status = 'running'",
                params![
                    output_ref,
                    opt_int(file_size_bytes),
                    now_str(),
                    job_id.to_string(),
                    worker_id
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("complete: {e}")))?;

        if affected == 0 {
            return Err(StoreError::OwnershipLost {
                id: job_id,
                worker_id: worker_id.to_string(),
            });
        }

        info!(job_id = %job_id, output_ref, "Job completed");
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        kind: ErrorKind,
        message: &str,
        retryable: bool,
    ) -> Result<(), StoreError> {
        let conn = self.conn();

        // Read the budget under our ownership. retry_count can only be
        // written by the owner, so the read cannot race with another
        // incrementer; if ownership is lost between the read and the
        // guarded update below, the update affects zero rows.
        let mut rows = conn
            .query(
                "SELECT retry_count FROM download_jobs
                 WHERE id = ?1 AND owner = ?2 AND status = 'running'",
                params![job_id.to_string(), worker_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("fail: {e}")))?;

        let retry_count: u32 = match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| StoreError::Query(format!("fail row parse: {e}")))?
                .max(0) as u32,
            Ok(None) => {
                return Err(StoreError::OwnershipLost {
                    id: job_id,
                    worker_id: worker_id.to_string(),
                });
            }
            Err(e) => return Err(StoreError::Query(format!("fail: {e}"))),
        };

        let will_retry = retryable && retry_count < self.policy.max_retries;
        let affected = if will_retry {
            let delay =
                retry::backoff_delay(self.policy.backoff_base, self.policy.backoff_cap, retry_count);
            let not_before = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());

            conn.execute(
                "UPDATE download_jobs
                 SET status = 'pending', owner = NULL, retry_count = retry_count + 1,
                     progress_percent = 0, downloaded_bytes = 0,
                     not_before = ?1, error_kind = ?2, error_message = ?3
                 WHERE id = ?4 AND owner = ?5 AND status = 'running'",
                params![
                    fmt_dt(not_before),
                    kind.as_str(),
                    message,
                    job_id.to_string(),
                    worker_id,
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("fail (retry): {e}")))?
        } else {
            conn.execute(
                "UPDATE download_jobs
                 SET status = 'failed', owner = NULL,
                     error_kind = ?1, error_message = ?2, finished_at = ?3
                 WHERE id = ?4 AND owner = ?5 AND status = 'running'",
                params![kind.as_str(), message, now_str(), job_id.to_string(), worker_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("fail (terminal): {e}")))?
        };

        if affected == 0 {
            return Err(StoreError::OwnershipLost {
                id: job_id,
                worker_id: worker_id.to_string(),
            });
        }

        if will_retry {
            info!(
                job_id = %job_id,
                kind = %kind,
                retry = retry_count + 1,
                max = self.policy.max_retries,
                "Job failed, requeued for retry"
            );
        } else {
            info!(job_id = %job_id, kind = %kind, "Job failed terminally");
        }
        Ok(())
    }

    async fn request_cancel(&self, job_id: Uuid) -> Result<CancelOutcome, StoreError> {
        let conn = self.conn();

        // One statement for both active states so a concurrent
        // Running -> Pending requeue cannot slip between a pending
        // check and a running check. SET expressions evaluate against
        // the pre-update row, so the CASE sees the old status.
        let mut rows = conn
            .query(
                "UPDATE download_jobs
                 SET cancel_requested = 1,
                     status = CASE WHEN status = 'pending' THEN 'cancelled' ELSE status END,
                     finished_at = CASE WHEN status = 'pending' THEN ?1 ELSE finished_at END
                 WHERE id = ?2 AND status IN ('pending', 'running')
                 RETURNING status",
                params![now_str(), job_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("request_cancel: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let status: String = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("request_cancel row parse: {e}")))?;
                if status == "cancelled" {
                    info!(job_id = %job_id, "Pending job cancelled");
                    Ok(CancelOutcome::Cancelled)
                } else {
                    info!(job_id = %job_id, "Cancellation requested for running job");
                    Ok(CancelOutcome::CancelRequested)
                }
            }
            Ok(None) => match self.get(job_id).await? {
                Some(_) => Ok(CancelOutcome::AlreadyTerminal),
                None => Err(StoreError::NotFound { id: job_id }),
            },
            Err(e) => Err(StoreError::Query(format!("request_cancel: {e}"))),
        }
    }

    async fn mark_cancelled(&self, job_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        let affected = conn
            .execute(
                "UPDATE download_jobs
                 SET status = 'cancelled', owner = NULL, finished_at = ?1
                 WHERE id = ?2 AND owner = ?3 AND status = 'running'",
                params![now_str(), job_id.to_string(), worker_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("mark_cancelled: {e}")))?;

        if affected == 0 {
            return Err(StoreError::OwnershipLost {
                id: job_id,
                worker_id: worker_id.to_string(),
            });
        }

        info!(job_id = %job_id, "Running job cancelled");
        Ok(())
    }

    async fn reclaim_stale(&self, stale_after: Duration) -> Result<Vec<Uuid>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::zero());

        let conn = self.conn();
        let mut rows = conn
            .query(
                // Progress and byte counts survive the reclaim so the
                // next owner can resume from what the crashed worker
                // persisted. retry_count is untouched: the budget
                // measures transfer failures, not owner crashes.
                "UPDATE download_jobs
                 SET status = 'pending', owner = NULL, claimed_at = NULL, heartbeat_at = NULL
                 WHERE status = 'running' AND heartbeat_at < ?1
                 RETURNING id",
                params![fmt_dt(cutoff)],
            )
            .await
            .map_err(|e| StoreError::Query(format!("reclaim_stale: {e}")))?;

        let mut ids = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id_str: String = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("reclaim_stale row parse: {e}")))?;
            if let Ok(id) = Uuid::parse_str(&id_str) {
                ids.push(id);
            }
        }

        if !ids.is_empty() {
            info!(count = ids.len(), "Reclaimed stale running jobs");
        }
        Ok(ids)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<DownloadJob>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM download_jobs WHERE id = ?1"),
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let job =
                    row_to_job(&row).map_err(|e| StoreError::Query(format!("get row parse: {e}")))?;
                Ok(Some(job))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get: {e}"))),
        }
    }

    async fn list(&self, filter: JobFilter) -> Result<Vec<DownloadJob>, StoreError> {
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        let conn = self.conn();

        let mut rows = match filter.status {
            Some(status) => conn
                .query(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM download_jobs
                         WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2"
                    ),
                    params![status.as_str(), limit as i64],
                )
                .await
                .map_err(|e| StoreError::Query(format!("list: {e}")))?,
            None => conn
                .query(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM download_jobs
                         ORDER BY created_at DESC LIMIT ?1"
                    ),
                    params![limit as i64],
                )
                .await
                .map_err(|e| StoreError::Query(format!("list: {e}")))?,
        };

        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let job =
                row_to_job(&row).map_err(|e| StoreError::Query(format!("list row parse: {e}")))?;
            jobs.push(job);
        }
        Ok(jobs)
    }
}
