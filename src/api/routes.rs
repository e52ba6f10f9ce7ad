//! HTTP surface for enqueueing and inspecting download jobs.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::error;
use uuid::Uuid;

use crate::error::StoreError;
use crate::jobs::model::{DownloadJob, JobStatus};
use crate::orchestrator::{EnqueueItem, Orchestrator};
use crate::store::{CancelOutcome, JobFilter};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/downloads", get(list_downloads).post(enqueue_downloads))
        .route(
            "/api/downloads/{id}",
            get(get_download).delete(cancel_download),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Request / response shapes ───────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EnqueueItemBody {
    source_ref: String,
    #[serde(default)]
    format_hint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnqueueBody {
    items: Vec<EnqueueItemBody>,
}

#[derive(Debug, Serialize)]
struct RejectedItem {
    source_ref: String,
    reason: String,
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    enqueued: Vec<DownloadJob>,
    rejected: Vec<RejectedItem>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<JobStatus>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ActionResponse {
    success: bool,
    message: String,
}

// ── Handlers ────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

async fn enqueue_downloads(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<EnqueueBody>,
) -> Response {
    if body.items.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(ActionResponse {
                success: false,
                message: "items must not be empty".into(),
            }),
        )
            .into_response();
    }

    let items = body
        .items
        .into_iter()
        .map(|i| EnqueueItem {
            source_ref: i.source_ref,
            format_hint: i.format_hint,
        })
        .collect();

    let report = state.orchestrator.enqueue_batch(items).await;
    let response = EnqueueResponse {
        enqueued: report.enqueued,
        rejected: report
            .rejected
            .into_iter()
            .map(|(item, reason)| RejectedItem {
                source_ref: item.source_ref,
                reason,
            })
            .collect(),
    };

    (StatusCode::CREATED, axum::Json(response)).into_response()
}

async fn list_downloads(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let filter = JobFilter {
        status: query.status,
        limit: query.limit.unwrap_or(0),
    };
    match state.orchestrator.list(filter).await {
        Ok(jobs) => axum::Json(jobs).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn get_download(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.orchestrator.status(id).await {
        Ok(Some(job)) => axum::Json(job).into_response(),
        Ok(None) => not_found(id),
        Err(e) => internal_error(e),
    }
}

async fn cancel_download(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.orchestrator.cancel(id).await {
        Ok(CancelOutcome::Cancelled) => axum::Json(ActionResponse {
            success: true,
            message: "job cancelled".into(),
        })
        .into_response(),
        Ok(CancelOutcome::CancelRequested) => axum::Json(ActionResponse {
            success: true,
            message: "cancellation requested; worker will stop at its next checkpoint".into(),
        })
        .into_response(),
        Ok(CancelOutcome::AlreadyTerminal) => (
            StatusCode::CONFLICT,
            axum::Json(ActionResponse {
                success: false,
                message: "job already finished".into(),
            }),
        )
            .into_response(),
        Err(StoreError::NotFound { .. }) => not_found(id),
        Err(e) => internal_error(e),
    }
}

fn not_found(id: Uuid) -> Response {
    (
        StatusCode::NOT_FOUND,
        axum::Json(ActionResponse {
            success: false,
            message: format!("job {id} not found"),
        }),
    )
        .into_response()
}

fn internal_error(e: StoreError) -> Response {
    error!(error = %e, "Request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(ActionResponse {
            success: false,
            message: "internal error".into(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JobStore, LibSqlBackend, QueuePolicy};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_app() -> (Router, Arc<dyn JobStore>) {
        let store: Arc<dyn JobStore> = Arc::new(
            LibSqlBackend::new_memory(QueuePolicy::default())
                .await
                .unwrap(),
        );
        let state = AppState {
            orchestrator: Arc::new(Orchestrator::new(Arc::clone(&store))),
        };
        (router(state), store)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint() {
        let (app, _) = test_app().await;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn enqueue_batch_reports_rejections() {
        let (app, _) = test_app().await;
        let body = serde_json::json!({
            "items": [
                { "source_ref": "https://example.com/a.mp4", "format_hint": "mp4" },
                { "source_ref": "" },
            ]
        });
        let response = app
            .oneshot(
                Request::post("/api/downloads")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["enqueued"].as_array().unwrap().len(), 1);
        assert_eq!(json["rejected"].as_array().unwrap().len(), 1);
        assert_eq!(json["enqueued"][0]["status"], "pending");
    }

    #[tokio::test]
    async fn empty_batch_is_bad_request() {
        let (app, _) = test_app().await;
        let response = app
            .oneshot(
                Request::post("/api/downloads")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"items":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_download_by_id() {
        let (app, store) = test_app().await;
        let job = store.enqueue("https://example.com/a.mp4", None).await.unwrap();

        let response = app
            .oneshot(
                Request::get(format!("/api/downloads/{}", job.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["id"], job.id.to_string());
        assert_eq!(json["status"], "pending");
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let (app, _) = test_app().await;
        let response = app
            .oneshot(
                Request::get(format!("/api/downloads/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_with_status_filter() {
        let (app, store) = test_app().await;
        store.enqueue("https://example.com/a.mp4", None).await.unwrap();
        store.enqueue("https://example.com/b.mp4", None).await.unwrap();

        let response = app
            .oneshot(
                Request::get("/api/downloads?status=pending&limit=10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cancel_pending_job() {
        let (app, store) = test_app().await;
        let job = store.enqueue("https://example.com/a.mp4", None).await.unwrap();

        let response = app
            .oneshot(
                Request::delete(format!("/api/downloads/{}", job.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);

        let fetched = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, crate::jobs::model::JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_finished_job_conflicts() {
        let (app, store) = test_app().await;
        let job = store.enqueue("https://example.com/a.mp4", None).await.unwrap();
        store.claim_next("w1", 1).await.unwrap();
        store.complete(job.id, "w1", "/out", None).await.unwrap();

        let response = app
            .oneshot(
                Request::delete(format!("/api/downloads/{}", job.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
