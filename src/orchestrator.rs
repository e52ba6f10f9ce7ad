//! Orchestrator — the producer-side facade over the Job Store.
//!
//! Validates enqueue input and shapes batch results; all queue
//! semantics live in the store itself.

use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;
use crate::jobs::model::DownloadJob;
use crate::store::{CancelOutcome, JobFilter, JobStore};

/// One item in an enqueue batch.
#[derive(Debug, Clone)]
pub struct EnqueueItem {
    pub source_ref: String,
    pub format_hint: Option<String>,
}

/// Per-batch accounting: jobs that made it into the queue plus the
/// items that were rejected, so one bad item never sinks the batch.
#[derive(Debug, Default)]
pub struct EnqueueReport {
    pub enqueued: Vec<DownloadJob>,
    pub rejected: Vec<(EnqueueItem, String)>,
}

pub struct Orchestrator {
    store: Arc<dyn JobStore>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Enqueue a single item. Rejects an empty `source_ref` before it
    /// reaches the store.
    pub async fn enqueue(
        &self,
        source_ref: &str,
        format_hint: Option<&str>,
    ) -> Result<DownloadJob, StoreError> {
        let trimmed = source_ref.trim();
        if trimmed.is_empty() {
            return Err(StoreError::Query("source_ref must not be empty".into()));
        }
        self.store.enqueue(trimmed, format_hint).await
    }

    /// Enqueue a batch, continuing past per-item failures.
    pub async fn enqueue_batch(&self, items: Vec<EnqueueItem>) -> EnqueueReport {
        let mut report = EnqueueReport::default();
        for item in items {
            match self
                .enqueue(&item.source_ref, item.format_hint.as_deref())
                .await
            {
                Ok(job) => report.enqueued.push(job),
                Err(e) => {
                    warn!(source_ref = %item.source_ref, error = %e, "Enqueue rejected");
                    report.rejected.push((item, e.to_string()));
                }
            }
        }
        report
    }

    pub async fn status(&self, job_id: Uuid) -> Result<Option<DownloadJob>, StoreError> {
        self.store.get(job_id).await
    }

    pub async fn list(&self, filter: JobFilter) -> Result<Vec<DownloadJob>, StoreError> {
        self.store.list(filter).await
    }

    pub async fn cancel(&self, job_id: Uuid) -> Result<CancelOutcome, StoreError> {
        self.store.request_cancel(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LibSqlBackend, QueuePolicy};

    async fn orchestrator() -> Orchestrator {
        let store = LibSqlBackend::new_memory(QueuePolicy::default())
            .await
            .unwrap();
        Orchestrator::new(Arc::new(store))
    }

    #[tokio::test]
    async fn empty_source_ref_is_rejected() {
        let orch = orchestrator().await;
        assert!(orch.enqueue("", None).await.is_err());
        assert!(orch.enqueue("   ", None).await.is_err());
    }

    #[tokio::test]
    async fn batch_keeps_going_past_bad_items() {
        let orch = orchestrator().await;
        let report = orch
            .enqueue_batch(vec![
                EnqueueItem {
                    source_ref: "https://example.com/a.mp4".into(),
                    format_hint: Some("mp4".into()),
                },
                EnqueueItem {
                    source_ref: "".into(),
                    format_hint: None,
                },
                EnqueueItem {
                    source_ref: "https://example.com/b.mp4".into(),
                    format_hint: None,
                },
            ])
            .await;

        assert_eq!(report.enqueued.len(), 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].0.source_ref, "");
    }

    #[tokio::test]
    async fn status_of_unknown_job_is_none() {
        let orch = orchestrator().await;
        assert!(orch.status(Uuid::new_v4()).await.unwrap().is_none());
    }
}
