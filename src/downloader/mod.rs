//! Download execution — the pluggable transfer collaborator.
//!
//! The worker engine drives any [`Downloader`] implementation; the
//! engine owns all store writes, so implementations only stream bytes,
//! report progress, and watch the cancellation signal.

pub mod http;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::DownloadError;

pub use http::HttpDownloader;

/// Credentials forwarded to the source, if any.
///
/// Wrapped in `SecretString` so they never land in logs or debug
/// output.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub bearer_token: Option<SecretString>,
    pub cookie_header: Option<SecretString>,
}

/// One transfer attempt handed to a downloader.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub job_id: Uuid,
    pub source_ref: String,
    pub format_hint: Option<String>,
    pub auth: AuthContext,
    /// Bytes already on disk from a previous attempt of this job, used
    /// to resume via a Range request where the source supports it.
    pub resume_from: Option<u64>,
}

/// Byte-level progress emitted while a transfer runs.
#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
}

/// What a successful transfer produced.
#[derive(Debug, Clone)]
pub struct DownloadOutput {
    pub output_ref: String,
    pub file_size_bytes: i64,
}

/// A transfer backend.
///
/// `start` runs one attempt to completion. Progress events are sent on
/// a best-effort basis (a full channel drops the event rather than
/// stalling the transfer). Implementations must observe `cancel`
/// between chunks and return `ErrorKind::Other` with a cancellation
/// message promptly when it flips.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn start(
        &self,
        request: DownloadRequest,
        progress: mpsc::Sender<ProgressEvent>,
        cancel: watch::Receiver<bool>,
    ) -> Result<DownloadOutput, DownloadError>;
}
