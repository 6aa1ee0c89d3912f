use chrono::{DateTime, Utc};
use typed_builder::TypedBuilder;

use crate::common::id::Id;

use super::job::JobId;

pub struct WorkItemMarker;
pub type WorkItemId = Id<WorkItemMarker>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize, serde::Deserialize)]
#[sqlx(type_name = "work_item_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Ready,
    Queued,
    Running,
    Successful,
    Failed,
    Warning,
    Canceled,
}

impl WorkItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkItemStatus::Successful
                | WorkItemStatus::Failed
                | WorkItemStatus::Warning
                | WorkItemStatus::Canceled
        )
    }

    /// Valid direct transitions, per the state machine:
    /// `READY -> QUEUED -> RUNNING -> {terminal}`, and `RUNNING -> READY`
    /// only via retry (modeled separately, not as a plain transition check,
    /// since it also mutates retry bookkeeping).
    pub fn can_transition_to(self, next: WorkItemStatus) -> bool {
        use WorkItemStatus::*;
        match (self, next) {
            (Ready, Queued) => true,
            (Ready, Running) => true, // service-queues disabled: READY -> RUNNING directly
            (Queued, Running) => true,
            (Running, Successful | Failed | Warning | Canceled) => true,
            // Cancellation is accepted from any non-terminal state.
            (Ready | Queued | Running, Canceled) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, TypedBuilder, sqlx::FromRow)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub job_id: JobId,
    pub service_id: String,
    pub workflow_step_index: i32,
    #[builder(default = WorkItemStatus::Ready)]
    pub status: WorkItemStatus,
    #[builder(default)]
    pub scroll_id: Option<String>,
    #[builder(default)]
    pub stac_catalog_location: Option<String>,
    #[builder(default)]
    pub results: Vec<String>,
    #[builder(default)]
    pub output_item_sizes: Vec<i64>,
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default = 0)]
    pub duration_ms: i64,
    pub sort_index: i64,
    #[builder(default)]
    pub message: Option<String>,
    #[builder(default)]
    pub message_category: Option<String>,
}

impl WorkItem {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_set_matches_spec() {
        for status in [
            WorkItemStatus::Successful,
            WorkItemStatus::Failed,
            WorkItemStatus::Warning,
            WorkItemStatus::Canceled,
        ] {
            assert!(status.is_terminal());
        }
        for status in [
            WorkItemStatus::Ready,
            WorkItemStatus::Queued,
            WorkItemStatus::Running,
        ] {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn ready_to_running_direct_when_no_service_queues() {
        assert!(WorkItemStatus::Ready.can_transition_to(WorkItemStatus::Running));
    }

    #[test]
    fn terminal_states_accept_no_further_transition() {
        assert!(!WorkItemStatus::Successful.can_transition_to(WorkItemStatus::Failed));
        assert!(!WorkItemStatus::Canceled.can_transition_to(WorkItemStatus::Running));
    }

    #[test]
    fn cancel_accepted_from_any_non_terminal_state() {
        assert!(WorkItemStatus::Ready.can_transition_to(WorkItemStatus::Canceled));
        assert!(WorkItemStatus::Queued.can_transition_to(WorkItemStatus::Canceled));
        assert!(WorkItemStatus::Running.can_transition_to(WorkItemStatus::Canceled));
    }
}
