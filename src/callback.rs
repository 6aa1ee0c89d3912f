//! Callback ingress: spec.md §4.8. Validates and normalizes a per-service
//! completion callback into the canonical update-queue message. Validation
//! is a pure function (grounded on the teacher's `ListingMachine::decide`
//! shape via `failure_policy::decide`: state/input in, a typed outcome
//! out, no I/O) so it is unit-testable without a running server; the axum
//! handler in `http::routes` is the only place that touches the queue or
//! object store.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::error::{OrchestratorError, Result};
use crate::model::{WorkItemId, WorkItemStatus};
use crate::queue::WorkItemUpdateMessage;

/// Query-string shape of `POST /<jobID>/response?...`. Exactly one of
/// `error`, `status`, `redirect`, or a non-empty request body may be
/// present per call (spec.md §4.8).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackQuery {
    #[serde(rename = "workItemID", default)]
    pub work_item_id: Option<String>,
    #[serde(default)]
    pub workflow_step_index: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub redirect: Option<String>,
    #[serde(default)]
    pub progress: Option<i32>,
    #[serde(default)]
    pub hits: Option<i64>,
    #[serde(rename = "scrollID", default)]
    pub scroll_id: Option<String>,
    #[serde(default)]
    pub message_category: Option<String>,
    /// Comma-separated `west,south,east,north`.
    #[serde(default)]
    pub bbox: Option<String>,
    #[serde(default)]
    pub temporal_start: Option<String>,
    #[serde(default)]
    pub temporal_end: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing workItemID")]
    MissingWorkItemId,
    #[error("invalid workItemID: {0}")]
    InvalidWorkItemId(String),
    #[error("exactly one of error, status, redirect, or a file body is required, got {0}")]
    AmbiguousResult(usize),
    #[error("bbox must have exactly 4 comma-separated floats, got {0}")]
    InvalidBbox(String),
    #[error("temporal bounds must both be present and RFC3339, or both absent")]
    InvalidTemporal,
    #[error("progress must be between 0 and 100, got {0}")]
    InvalidProgress(i32),
    #[error("status {0:?} is not a recognized work item outcome")]
    UnknownStatus(String),
    #[error("a file body requires a filename")]
    MissingFilename,
    #[error("async jobs cannot report status=successful directly; only internal completion can")]
    AsyncJobCannotSelfReportSuccess,
}

/// What kind of result this callback call is reporting, normalized from
/// the mutually-exclusive query/body forms spec.md §4.8 describes.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultKind {
    Error(String),
    Status(WorkItemStatus),
    Redirect(String),
    File { filename: String, mime: Option<String> },
}

/// A validated, normalized callback ready to become a `WorkItemUpdateMessage`.
#[derive(Debug, Clone)]
pub struct CallbackUpdate {
    pub work_item_id: WorkItemId,
    pub workflow_step_index: i32,
    pub result: ResultKind,
    pub progress: Option<i32>,
    pub hits: Option<i64>,
    pub scroll_id: Option<String>,
    pub message_category: Option<String>,
    pub bbox: Option<[f64; 4]>,
    pub temporal: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

/// Parses and range-checks a bbox string into 4 floats, per spec.md §4.8.
fn parse_bbox(raw: &str) -> Result<[f64; 4], ValidationError> {
    let parts: Vec<f64> = raw
        .split(',')
        .map(|s| s.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| ValidationError::InvalidBbox(raw.to_string()))?;
    parts
        .try_into()
        .map_err(|p: Vec<f64>| ValidationError::InvalidBbox(format!("{} values", p.len())))
}

fn parse_temporal(
    start: &str,
    end: &str,
) -> Result<(DateTime<Utc>, DateTime<Utc>), ValidationError> {
    let start = DateTime::parse_from_rfc3339(start)
        .map_err(|_| ValidationError::InvalidTemporal)?
        .with_timezone(&Utc);
    let end = DateTime::parse_from_rfc3339(end)
        .map_err(|_| ValidationError::InvalidTemporal)?
        .with_timezone(&Utc);
    Ok((start, end))
}

fn parse_status(raw: &str) -> Result<WorkItemStatus, ValidationError> {
    match raw {
        "successful" => Ok(WorkItemStatus::Successful),
        "failed" => Ok(WorkItemStatus::Failed),
        "warning" => Ok(WorkItemStatus::Warning),
        "canceled" | "cancelled" => Ok(WorkItemStatus::Canceled),
        other => Err(ValidationError::UnknownStatus(other.to_string())),
    }
}

/// Validates one callback call. `has_body` is whether the request carried
/// a non-empty body (the file-result form); `filename` is the query
/// parameter the caller must supply alongside a body. `is_async` gates the
/// spec.md §4.8 rule that an async job's completion is only ever decided
/// internally (§4.6), never taken directly from a service's callback.
pub fn validate(query: &CallbackQuery, has_body: bool, is_async: bool) -> Result<CallbackUpdate, ValidationError> {
    let raw_id = query
        .work_item_id
        .as_deref()
        .ok_or(ValidationError::MissingWorkItemId)?;
    let work_item_id = raw_id
        .parse::<WorkItemId>()
        .map_err(|_| ValidationError::InvalidWorkItemId(raw_id.to_string()))?;
    let workflow_step_index = query.workflow_step_index.unwrap_or(0);

    let present = [
        query.error.is_some(),
        query.status.is_some(),
        query.redirect.is_some(),
        has_body,
    ]
    .into_iter()
    .filter(|p| *p)
    .count();
    if present != 1 {
        return Err(ValidationError::AmbiguousResult(present));
    }

    let result = if let Some(error) = &query.error {
        ResultKind::Error(error.clone())
    } else if let Some(status) = &query.status {
        let parsed = parse_status(status)?;
        if is_async && parsed == WorkItemStatus::Successful {
            return Err(ValidationError::AsyncJobCannotSelfReportSuccess);
        }
        ResultKind::Status(parsed)
    } else if let Some(redirect) = &query.redirect {
        ResultKind::Redirect(redirect.clone())
    } else {
        let filename = query
            .filename
            .clone()
            .ok_or(ValidationError::MissingFilename)?;
        ResultKind::File {
            filename,
            mime: query.mime.clone(),
        }
    };

    if let Some(progress) = query.progress {
        if !(0..=100).contains(&progress) {
            return Err(ValidationError::InvalidProgress(progress));
        }
    }

    let bbox = query.bbox.as_deref().map(parse_bbox).transpose()?;

    let temporal = match (&query.temporal_start, &query.temporal_end) {
        (Some(start), Some(end)) => Some(parse_temporal(start, end)?),
        (None, None) => None,
        _ => return Err(ValidationError::InvalidTemporal),
    };

    Ok(CallbackUpdate {
        work_item_id,
        workflow_step_index,
        result,
        progress: query.progress,
        hits: query.hits,
        scroll_id: query.scroll_id.clone(),
        message_category: query.message_category.clone(),
        bbox,
        temporal,
    })
}

/// Normalizes a validated callback into the canonical update-queue
/// message, given the already-staged output URL and size for a file (or
/// redirect) result. `error`/explicit-`status` results carry no outputs.
/// `output` must be `Some` whenever `update.result` is `ResultKind::File`
/// — the handler stages the body before calling this — anything else is
/// an invariant violation, not a user-facing validation failure.
pub fn to_update_message(
    update: &CallbackUpdate,
    output: Option<(String, i64)>,
) -> Result<WorkItemUpdateMessage> {
    let (status, message, message_category, results, output_item_sizes) = match &update.result {
        ResultKind::Error(msg) => (
            WorkItemStatus::Failed,
            Some(msg.clone()),
            update.message_category.clone(),
            Vec::new(),
            Vec::new(),
        ),
        ResultKind::Status(status) => (
            *status,
            None,
            update.message_category.clone(),
            Vec::new(),
            Vec::new(),
        ),
        ResultKind::Redirect(href) => (
            WorkItemStatus::Successful,
            None,
            None,
            vec![href.clone()],
            vec![0],
        ),
        ResultKind::File { .. } => {
            let (href, size) = output.clone().ok_or_else(|| {
                OrchestratorError::Fatal("file result staged with no output location".into())
            })?;
            (
                WorkItemStatus::Successful,
                None,
                None,
                vec![href],
                vec![size],
            )
        }
    };

    Ok(WorkItemUpdateMessage {
        work_item_id: update.work_item_id,
        status,
        message,
        message_category,
        hits: update.hits,
        results,
        output_item_sizes,
        total_items_size: None,
        duration_ms: None,
        workflow_step_index: update.workflow_step_index,
        scroll_id: update.scroll_id.clone(),
        bbox: update.bbox,
        temporal_start: update.temporal.map(|(start, _)| start),
        temporal_end: update.temporal.map(|(_, end)| end),
    })
}
