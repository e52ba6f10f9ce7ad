//! Direct HTTP(S) downloader built on reqwest's streaming body API.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::DownloadError;
use crate::jobs::model::ErrorKind;

use super::{DownloadOutput, DownloadRequest, Downloader, ProgressEvent};

/// Streams a source URL to a file under `download_dir`.
pub struct HttpDownloader {
    client: reqwest::Client,
    download_dir: PathBuf,
}

impl HttpDownloader {
    pub fn new(download_dir: PathBuf, timeout: std::time::Duration) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                DownloadError::new(ErrorKind::Other, format!("build HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            download_dir,
        })
    }

    fn target_path(&self, request: &DownloadRequest) -> PathBuf {
        let name = filename_for(request);
        self.download_dir.join(name)
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn start(
        &self,
        request: DownloadRequest,
        progress: mpsc::Sender<ProgressEvent>,
        cancel: watch::Receiver<bool>,
    ) -> Result<DownloadOutput, DownloadError> {
        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| {
                DownloadError::new(ErrorKind::Io, format!("create download dir: {e}"))
            })?;

        let path = self.target_path(&request);

        // Resume only when the partial file on disk matches what the
        // previous attempt reported; otherwise start from scratch.
        let resume_from = match (request.resume_from, file_len(&path).await) {
            (Some(expected), Some(on_disk)) if expected == on_disk && on_disk > 0 => Some(on_disk),
            _ => None,
        };

        let mut req = self.client.get(&request.source_ref);
        if let Some(token) = &request.auth.bearer_token {
            req = req.bearer_auth(token.expose_secret());
        }
        if let Some(cookie) = &request.auth.cookie_header {
            req = req.header(reqwest::header::COOKIE, cookie.expose_secret());
        }
        if let Some(offset) = resume_from {
            req = req.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }

        let response = req.send().await.map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            let kind = classify_status(status);
            return Err(DownloadError::new(
                kind,
                format!("source returned HTTP {status}"),
            ));
        }

        // A 200 to a Range request means the source ignored the range
        // and is sending the whole body.
        let resuming = resume_from.is_some() && status == StatusCode::PARTIAL_CONTENT;
        let mut downloaded: u64 = if resuming { resume_from.unwrap_or(0) } else { 0 };
        let total = response
            .content_length()
            .map(|len| len + if resuming { downloaded } else { 0 });

        let mut file = if resuming {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .await
        } else {
            tokio::fs::File::create(&path).await
        }
        .map_err(|e| DownloadError::new(ErrorKind::Io, format!("open {}: {e}", path.display())))?;

        debug!(
            job_id = %request.job_id,
            path = %path.display(),
            resumed = resuming,
            "Transfer started"
        );

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if *cancel.borrow() {
                return Err(DownloadError::new(ErrorKind::Other, "transfer cancelled"));
            }

            let chunk = chunk.map_err(classify_transport)?;
            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadError::new(ErrorKind::Io, format!("write chunk: {e}")))?;
            downloaded += chunk.len() as u64;

            // Best effort; a full channel drops the event.
            let _ = progress.try_send(ProgressEvent {
                downloaded_bytes: downloaded,
                total_bytes: total,
            });
        }

        file.flush()
            .await
            .map_err(|e| DownloadError::new(ErrorKind::Io, format!("flush output: {e}")))?;

        if let Some(total) = total {
            if downloaded < total {
                warn!(
                    job_id = %request.job_id,
                    downloaded,
                    total,
                    "Stream ended short of Content-Length"
                );
                return Err(DownloadError::new(
                    ErrorKind::SourceUnavailable,
                    format!("truncated body: got {downloaded} of {total} bytes"),
                ));
            }
        }

        Ok(DownloadOutput {
            output_ref: path.to_string_lossy().into_owned(),
            file_size_bytes: downloaded as i64,
        })
    }
}

async fn file_len(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

/// Pick an output filename from the URL path, falling back to the job
/// id plus the format hint.
fn filename_for(request: &DownloadRequest) -> String {
    let from_url = request
        .source_ref
        .split('?')
        .next()
        .and_then(|base| base.rsplit('/').next())
        .filter(|name| !name.is_empty() && name.contains('.'))
        .map(sanitize_filename);

    match from_url {
        Some(name) if !name.is_empty() => format!("{}_{}", request.job_id, name),
        _ => {
            let ext = request.format_hint.as_deref().unwrap_or("bin");
            format!("{}.{}", request.job_id, sanitize_filename(ext))
        }
    }
}

/// Strip path separators and shell-hostile characters from a filename.
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    cleaned
        .trim_matches(|c: char| matches!(c, '.' | ' ' | '_'))
        .chars()
        .take(200)
        .collect()
}

/// Map an HTTP status to an error kind. 4xx means the request itself is
/// bad and retrying won't help, except the explicitly transient codes.
fn classify_status(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::AuthDenied,
        StatusCode::NOT_FOUND | StatusCode::GONE => ErrorKind::NotFound,
        StatusCode::UNSUPPORTED_MEDIA_TYPE => ErrorKind::UnsupportedFormat,
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimited,
        StatusCode::REQUEST_TIMEOUT => ErrorKind::Timeout,
        s if s.is_server_error() => ErrorKind::SourceUnavailable,
        _ => ErrorKind::Other,
    }
}

fn classify_transport(err: reqwest::Error) -> DownloadError {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_connect() {
        ErrorKind::SourceUnavailable
    } else {
        ErrorKind::Io
    };
    DownloadError::new(kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn request(url: &str, hint: Option<&str>) -> DownloadRequest {
        DownloadRequest {
            job_id: Uuid::nil(),
            source_ref: url.to_string(),
            format_hint: hint.map(str::to_string),
            auth: Default::default(),
            resume_from: None,
        }
    }

    #[test]
    fn sanitize_strips_separators_and_control_chars() {
        assert_eq!(sanitize_filename("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_filename("..\\..\\evil.mp4"), "evil.mp4");
        assert_eq!(sanitize_filename("lec\x07ture.mp4"), "lec_ture.mp4");
        assert_eq!(sanitize_filename("  plain.mp4  "), "plain.mp4");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "x".repeat(500);
        assert_eq!(sanitize_filename(&long).len(), 200);
    }

    #[test]
    fn filename_prefers_url_basename() {
        let name = filename_for(&request("https://cdn.example.com/v/lecture-3.mp4?tok=1", None));
        assert_eq!(name, format!("{}_lecture-3.mp4", Uuid::nil()));
    }

    #[test]
    fn filename_falls_back_to_hint() {
        let name = filename_for(&request("https://example.com/stream", Some("mp4")));
        assert_eq!(name, format!("{}.mp4", Uuid::nil()));
        let name = filename_for(&request("https://example.com/stream", None));
        assert_eq!(name, format!("{}.bin", Uuid::nil()));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), ErrorKind::AuthDenied);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), ErrorKind::AuthDenied);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), ErrorKind::NotFound);
        assert_eq!(classify_status(StatusCode::GONE), ErrorKind::NotFound);
        assert_eq!(
            classify_status(StatusCode::UNSUPPORTED_MEDIA_TYPE),
            ErrorKind::UnsupportedFormat
        );
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), ErrorKind::RateLimited);
        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT), ErrorKind::Timeout);
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            ErrorKind::SourceUnavailable
        );
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), ErrorKind::Other);
    }

    #[test]
    fn transient_statuses_are_retryable() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE).is_retryable());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(!classify_status(StatusCode::FORBIDDEN).is_retryable());
        assert!(!classify_status(StatusCode::NOT_FOUND).is_retryable());
    }
}
