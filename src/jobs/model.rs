//! Download job record and state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting to be claimed.
    Pending,
    /// Job is owned by a worker and transferring.
    Running,
    /// Transfer finished, artifact persisted.
    Completed,
    /// Permanent failure, or retry budget exhausted.
    Failed,
    /// Cancelled by request (immediate for pending, cooperative for running).
    Cancelled,
}

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Running) | (Pending, Cancelled) |
            // From Running
            (Running, Completed) | (Running, Failed) |
            (Running, Cancelled) |
            // Retry or stale reclaim returns the job to the queue
            (Running, Pending)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the job is still active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Database string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Failure classification for a download attempt.
///
/// Transient kinds are retried with backoff; permanent kinds jump
/// straight to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network or read timeout.
    Timeout,
    /// Source is throttling us.
    RateLimited,
    /// Source temporarily unavailable (5xx, connect failure).
    SourceUnavailable,
    /// Local IO failure writing the artifact.
    Io,
    /// Authorization denied by the source.
    AuthDenied,
    /// Source no longer exists.
    NotFound,
    /// Source format cannot be handled.
    UnsupportedFormat,
    /// Unclassified failure. Treated as transient.
    Other,
}

impl ErrorKind {
    /// Whether this failure kind is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::SourceUnavailable | Self::Io | Self::Other
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::SourceUnavailable => "source_unavailable",
            Self::Io => "io",
            Self::AuthDenied => "auth_denied",
            Self::NotFound => "not_found",
            Self::UnsupportedFormat => "unsupported_format",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timeout" => Ok(Self::Timeout),
            "rate_limited" => Ok(Self::RateLimited),
            "source_unavailable" => Ok(Self::SourceUnavailable),
            "io" => Ok(Self::Io),
            "auth_denied" => Ok(Self::AuthDenied),
            "not_found" => Ok(Self::NotFound),
            "unsupported_format" => Ok(Self::UnsupportedFormat),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown error kind: {other}")),
        }
    }
}

/// Progress snapshot reported at a heartbeat checkpoint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobProgress {
    /// Percent complete, 0..=100.
    pub percent: u8,
    pub downloaded_bytes: i64,
    /// Unknown until the source reports a size.
    pub total_bytes: Option<i64>,
}

impl JobProgress {
    /// Derive a progress snapshot from byte counts. Downloaded bytes
    /// are clamped to the total when the total is known.
    pub fn from_bytes(downloaded: u64, total: Option<u64>) -> Self {
        let clamped = match total {
            Some(t) => downloaded.min(t),
            None => downloaded,
        };
        let percent = match total {
            Some(t) if t > 0 => ((clamped * 100) / t) as u8,
            _ => 0,
        };
        Self {
            percent,
            downloaded_bytes: clamped as i64,
            total_bytes: total.map(|t| t as i64),
        }
    }
}

/// The unit of work: one item to be downloaded.
///
/// Rows are never deleted; terminal jobs are retained for audit and
/// surfaced to status queries.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadJob {
    pub id: Uuid,
    /// Opaque identifier/URL of the item, owned by the upstream
    /// extraction collaborator.
    pub source_ref: String,
    pub format_hint: Option<String>,
    pub status: JobStatus,
    /// Worker identity holding the job while running.
    pub owner: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub progress_percent: u8,
    pub downloaded_bytes: i64,
    pub total_bytes: Option<i64>,
    pub retry_count: u32,
    /// Earliest time a retried job becomes eligible for claiming again.
    pub not_before: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    /// Durable pointer to the produced artifact, set on completion.
    pub output_ref: Option<String>,
    pub file_size_bytes: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DownloadJob {
    /// Create a new pending job.
    pub fn new(source_ref: impl Into<String>, format_hint: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_ref: source_ref.into(),
            format_hint,
            status: JobStatus::Pending,
            owner: None,
            claimed_at: None,
            heartbeat_at: None,
            progress_percent: 0,
            downloaded_bytes: 0,
            total_bytes: None,
            retry_count: 0,
            not_before: None,
            cancel_requested: false,
            error_kind: None,
            error_message: None,
            output_ref: None,
            file_size_bytes: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Pending));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Cancelled));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn status_display_roundtrip() {
        for s in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(s.to_string().parse::<JobStatus>().unwrap(), s);
        }
    }

    #[test]
    fn status_serde_roundtrip() {
        let json = serde_json::to_string(&JobStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        let parsed: JobStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, JobStatus::Running);
    }

    #[test]
    fn error_kind_classification() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::SourceUnavailable.is_retryable());
        assert!(ErrorKind::Other.is_retryable());
        assert!(!ErrorKind::AuthDenied.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
        assert!(!ErrorKind::UnsupportedFormat.is_retryable());
    }

    #[test]
    fn error_kind_roundtrip() {
        for k in [
            ErrorKind::Timeout,
            ErrorKind::RateLimited,
            ErrorKind::SourceUnavailable,
            ErrorKind::Io,
            ErrorKind::AuthDenied,
            ErrorKind::NotFound,
            ErrorKind::UnsupportedFormat,
            ErrorKind::Other,
        ] {
            assert_eq!(k.as_str().parse::<ErrorKind>().unwrap(), k);
        }
    }

    #[test]
    fn progress_from_bytes() {
        let p = JobProgress::from_bytes(50, Some(200));
        assert_eq!(p.percent, 25);
        assert_eq!(p.downloaded_bytes, 50);
        assert_eq!(p.total_bytes, Some(200));

        // Unknown total — percent stays 0
        let p = JobProgress::from_bytes(1024, None);
        assert_eq!(p.percent, 0);
        assert_eq!(p.total_bytes, None);

        // Overshoot is clamped, bytes included
        let p = JobProgress::from_bytes(300, Some(200));
        assert_eq!(p.percent, 100);
        assert_eq!(p.downloaded_bytes, 200);
    }

    #[test]
    fn new_job_is_pending() {
        let job = DownloadJob::new("https://example.com/v.mp4", Some("mp4".into()));
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.owner.is_none());
        assert_eq!(job.retry_count, 0);
        assert!(!job.cancel_requested);
    }
}
