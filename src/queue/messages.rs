//! Wire shapes for the two queue roles, matching spec.md §6's update
//! message schema and §4.2's wake-up signal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{WorkItemId, WorkItemStatus};

/// One scheduler wake-up: "more work may be ready for this service".
/// Carries only the service id; coalescing collapses repeats in
/// `queue::memory::InMemoryQueue::send`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WakeupMessage {
    pub service_id: String,
}

/// A work-item status update, as placed on the update queue by callback
/// ingress (§4.8) or produced directly by the scheduler/planner in tests.
/// Mirrors the `{ update: {...}, operation?, preprocessResult? }` schema
/// in spec.md §6, flattened since `operation`/`preprocessResult` are
/// resolved by the caller before enqueuing here rather than carried
/// through the queue untyped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemUpdateMessage {
    pub work_item_id: WorkItemId,
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
    pub scroll_id: Option<String>,
    /// Callback-sourced job-link metadata (spec.md §4.8): not part of the
    /// base update schema in §6, carried alongside it so the update
    /// processor can stamp a final-step job link with the bbox/temporal
    /// extent the service reported, rather than dropping it after
    /// validation.
    #[serde(default)]
    pub bbox: Option<[f64; 4]>,
    #[serde(default)]
    pub temporal_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub temporal_end: Option<DateTime<Utc>>,
}

/// Severity of a work-item update message: governs queue drain batching,
/// per spec.md §4.2 ("small" batches of up to 10, "large" one at a time).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSeverity {
    Small,
    Large,
}

impl UpdateSeverity {
    /// Severity is large when the payload carries full STAC results —
    /// the fat part of the message — rather than a bare status change.
    pub fn classify(message: &WorkItemUpdateMessage) -> Self {
        if message.results.is_empty() {
            UpdateSeverity::Small
        } else {
            UpdateSeverity::Large
        }
    }

    pub fn max_batch_size(self, large_batch_size: usize) -> usize {
        match self {
            UpdateSeverity::Small => 10,
            UpdateSeverity::Large => large_batch_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(results: Vec<String>) -> WorkItemUpdateMessage {
        WorkItemUpdateMessage {
            work_item_id: WorkItemId::new(),
            status: WorkItemStatus::Successful,
            message: None,
            message_category: None,
            hits: None,
            results,
            output_item_sizes: vec![],
            total_items_size: None,
            duration_ms: None,
            workflow_step_index: 1,
            scroll_id: None,
            bbox: None,
            temporal_start: None,
            temporal_end: None,
        }
    }

    #[test]
    fn classifies_by_results_presence() {
        assert_eq!(UpdateSeverity::classify(&msg(vec![])), UpdateSeverity::Small);
        assert_eq!(
            UpdateSeverity::classify(&msg(vec!["s3://x".into()])),
            UpdateSeverity::Large
        );
    }

    #[test]
    fn small_batches_cap_at_ten_regardless_of_config() {
        assert_eq!(UpdateSeverity::Small.max_batch_size(1), 10);
    }

    #[test]
    fn large_batches_follow_config() {
        assert_eq!(UpdateSeverity::Large.max_batch_size(1), 1);
    }
}
