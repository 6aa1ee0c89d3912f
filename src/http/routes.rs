//! Route handlers: spec.md §7. Grounded on the teacher's
//! `health_handler` (`server/routes/health.rs`) for status-code
//! conventions and on its `Extension`-based state access throughout
//! `server/routes/*`.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::callback::{self, CallbackQuery};
use crate::model::{WorkItemId, WorkItemStatus};
use crate::objectstore::{staging_prefix, ObjectStore};
use crate::queue::{Queue, WakeupMessage, WorkItemUpdateMessage};
use crate::scheduler::AssignedWorkItem;
use crate::store::StateStore;

use super::app::AppState;

#[derive(Debug, Serialize)]
pub struct WorkItemResponse {
    #[serde(rename = "workItemID")]
    pub work_item_id: WorkItemId,
    pub job_id: String,
    pub service_id: String,
    pub workflow_step_index: i32,
    pub status: WorkItemStatus,
    pub operation: serde_json::Value,
}

impl From<AssignedWorkItem> for WorkItemResponse {
    fn from(assigned: AssignedWorkItem) -> Self {
        Self {
            work_item_id: assigned.item.id,
            job_id: assigned.item.job_id.to_string(),
            service_id: assigned.item.service_id,
            workflow_step_index: assigned.item.workflow_step_index,
            status: assigned.item.status,
            operation: assigned.operation,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WorkQuery {
    #[serde(rename = "serviceID")]
    pub service_id: String,
}

/// `GET /work?serviceID=...` — a worker's poll for its next item, per
/// spec.md §4.3. Returns 404 when nothing is currently ready; a worker is
/// expected to poll again later rather than treat this as an error.
pub async fn work_handler<St, Obj, Uq, Wq>(
    Extension(state): Extension<AppState<St, Obj, Uq, Wq>>,
    Query(query): Query<WorkQuery>,
) -> (StatusCode, Json<Option<WorkItemResponse>>)
where
    St: StateStore + Send + Sync + 'static,
    Obj: ObjectStore + Send + Sync + 'static,
    Uq: Queue<WorkItemUpdateMessage> + Send + Sync + 'static,
    Wq: Queue<WakeupMessage> + Send + Sync + 'static,
{
    match state.scheduler.request_work(&query.service_id, 1).await {
        Ok(mut assigned) if !assigned.is_empty() => {
            (StatusCode::OK, Json(Some(assigned.remove(0).into())))
        }
        Ok(_) => (StatusCode::NOT_FOUND, Json(None)),
        Err(e) => {
            warn!(service_id = %query.service_id, error = %e, "failed to request work");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(None))
        }
    }
}

/// Inbound shape of `PUT /work/:id`: a worker reporting its own item's
/// outcome directly, as opposed to the `/response` callback form used by
/// services that only speak HTTP redirects/file uploads (spec.md §4.4,
/// §4.8). `work_item_id` is taken from the path, not the body.
#[derive(Debug, Deserialize)]
pub struct WorkItemUpdateBody {
    pub status: WorkItemStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub message_category: Option<String>,
    #[serde(default)]
    pub hits: Option<i64>,
    #[serde(default)]
    pub results: Vec<String>,
    #[serde(default)]
    pub output_item_sizes: Vec<i64>,
    #[serde(default)]
    pub total_items_size: Option<i64>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    pub workflow_step_index: i32,
    #[serde(default)]
    #[serde(rename = "scrollID")]
    pub scroll_id: Option<String>,
}

/// `PUT /work/:id` — enqueues the update and returns immediately; the
/// update processor applies it asynchronously (spec.md §4.2, §4.4).
pub async fn update_handler<St, Obj, Uq, Wq>(
    Extension(state): Extension<AppState<St, Obj, Uq, Wq>>,
    Path(id): Path<String>,
    Json(body): Json<WorkItemUpdateBody>,
) -> StatusCode
where
    St: StateStore + Send + Sync + 'static,
    Obj: ObjectStore + Send + Sync + 'static,
    Uq: Queue<WorkItemUpdateMessage> + Send + Sync + 'static,
    Wq: Queue<WakeupMessage> + Send + Sync + 'static,
{
    let Ok(work_item_id) = id.parse::<WorkItemId>() else {
        return StatusCode::BAD_REQUEST;
    };

    let message = WorkItemUpdateMessage {
        work_item_id,
        status: body.status,
        message: body.message,
        message_category: body.message_category,
        hits: body.hits,
        results: body.results,
        output_item_sizes: body.output_item_sizes,
        total_items_size: body.total_items_size,
        duration_ms: body.duration_ms,
        workflow_step_index: body.workflow_step_index,
        scroll_id: body.scroll_id,
        bbox: None,
        temporal_start: None,
        temporal_end: None,
    };

    match state.update_queue.send(message).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!(work_item_id = %work_item_id, error = %e, "failed to enqueue work item update");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub accepted: bool,
}

/// `POST /:jobID/response` — callback ingress, per spec.md §4.8. Query
/// parameters carry the structured result; a non-empty body with a
/// `filename` is staged into the work item's object-store prefix and
/// becomes the sole result href.
pub async fn callback_handler<St, Obj, Uq, Wq>(
    Extension(state): Extension<AppState<St, Obj, Uq, Wq>>,
    Path(job_id): Path<String>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> (StatusCode, Json<CallbackResponse>)
where
    St: StateStore + Send + Sync + 'static,
    Obj: ObjectStore + Send + Sync + 'static,
    Uq: Queue<WorkItemUpdateMessage> + Send + Sync + 'static,
    Wq: Queue<WakeupMessage> + Send + Sync + 'static,
{
    let Ok(parsed_job_id) = job_id.parse::<crate::model::JobId>() else {
        return (StatusCode::BAD_REQUEST, Json(CallbackResponse { accepted: false }));
    };
    let is_async = match state.store.job_is_async(parsed_job_id).await {
        Ok(is_async) => is_async,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "rejected callback for unknown job");
            return (StatusCode::NOT_FOUND, Json(CallbackResponse { accepted: false }));
        }
    };

    let has_body = !body.is_empty();
    let update = match callback::validate(&query, has_body, is_async) {
        Ok(update) => update,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "rejected callback");
            return (StatusCode::BAD_REQUEST, Json(CallbackResponse { accepted: false }));
        }
    };

    let output = match &update.result {
        callback::ResultKind::File { filename, .. } => {
            let job_id = parsed_job_id;
            let key = format!("{}outputs/{filename}", staging_prefix(job_id, update.work_item_id));
            if let Err(e) = state.object_store.put(&key, body.to_vec()).await {
                warn!(job_id = %job_id, error = %e, "failed to stage callback file result");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(CallbackResponse { accepted: false }),
                );
            }
            Some((state.object_store.url_for(&key), body.len() as i64))
        }
        _ => None,
    };

    let message = match callback::to_update_message(&update, output) {
        Ok(message) => message,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "failed to normalize callback result");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(CallbackResponse { accepted: false }),
            );
        }
    };

    match state.update_queue.send(message).await {
        Ok(()) => (StatusCode::OK, Json(CallbackResponse { accepted: true })),
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "failed to enqueue callback result");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(CallbackResponse { accepted: false }),
            )
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DatabaseHealth {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConnectionPoolHealth {
    pub size: u32,
    pub idle_connections: u32,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub database: DatabaseHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<ConnectionPoolHealth>,
}

/// `GET /health`, grounded on the teacher's `health_handler`: a bounded
/// `SELECT 1` against the pool, 200 when it succeeds within the timeout,
/// 503 otherwise. A deployment with no pool configured (in-process tests)
/// reports healthy unconditionally.
pub async fn health_handler<St, Obj, Uq, Wq>(
    Extension(state): Extension<AppState<St, Obj, Uq, Wq>>,
) -> (StatusCode, Json<HealthResponse>)
where
    St: StateStore + Send + Sync + 'static,
    Obj: ObjectStore + Send + Sync + 'static,
    Uq: Queue<WorkItemUpdateMessage> + Send + Sync + 'static,
    Wq: Queue<WakeupMessage> + Send + Sync + 'static,
{
    let Some(pool) = &state.pool else {
        return (
            StatusCode::OK,
            Json(HealthResponse {
                database: DatabaseHealth { status: "skipped", error: None },
                pool: None,
            }),
        );
    };

    let check = tokio::time::timeout(Duration::from_secs(5), sqlx::query("SELECT 1").execute(pool)).await;

    let (status_code, database) = match check {
        Ok(Ok(_)) => (StatusCode::OK, DatabaseHealth { status: "healthy", error: None }),
        Ok(Err(e)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            DatabaseHealth { status: "unhealthy", error: Some(e.to_string()) },
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            DatabaseHealth { status: "unhealthy", error: Some("health check timed out".to_string()) },
        ),
    };

    let pool_health = ConnectionPoolHealth {
        size: pool.size(),
        idle_connections: pool.num_idle() as u32,
    };

    (
        status_code,
        Json(HealthResponse { database, pool: Some(pool_health) }),
    )
}
