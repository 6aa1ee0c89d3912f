use chrono::{DateTime, Utc};
use typed_builder::TypedBuilder;

use crate::common::id::Id;

pub struct JobMarker;
pub type JobId = Id<JobMarker>;

/// Job status. `SUCCESSFUL`, `FAILED`, `CANCELED`, and `COMPLETE_WITH_ERRORS`
/// are absorbing: once reached, no further transition is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize, serde::Deserialize)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Accepted,
    Previewing,
    Running,
    RunningWithErrors,
    Paused,
    CompleteWithErrors,
    Successful,
    Failed,
    Canceled,
}

impl JobStatus {
    /// Terminal statuses accept no further work-item-driven transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Successful
                | JobStatus::Failed
                | JobStatus::Canceled
                | JobStatus::CompleteWithErrors
        )
    }
}

#[derive(Debug, Clone, TypedBuilder, sqlx::FromRow)]
pub struct Job {
    pub id: JobId,
    pub owner: String,
    pub request: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[builder(default = 0)]
    pub progress: i32,
    pub num_input_granules: i64,
    #[builder(default)]
    pub labels: Vec<String>,
    #[builder(default = JobStatus::Accepted)]
    pub status: JobStatus,
    #[builder(default = false)]
    pub ignore_errors: bool,
    #[builder(default)]
    pub destination_url: Option<String>,
    #[builder(default)]
    pub message: Option<String>,
    #[builder(default = true)]
    pub is_async: bool,
}

impl Job {
    /// Normalizes a label the way the store requires: lowercase, capped at
    /// 255 characters.
    pub fn normalize_label(label: &str) -> String {
        let lower = label.to_lowercase();
        lower.chars().take(255).collect()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `progress` reaches 100 only once the job is terminal and did not
    /// fail or get canceled before completing everything.
    pub fn progress_matches_invariant(&self) -> bool {
        if self.progress == 100 {
            self.status == JobStatus::Successful || self.status == JobStatus::CompleteWithErrors
        } else {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_absorbing() {
        assert!(JobStatus::Successful.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(JobStatus::CompleteWithErrors.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
    }

    #[test]
    fn normalize_label_lowercases_and_truncates() {
        let long = "A".repeat(300);
        let normalized = Job::normalize_label(&long);
        assert_eq!(normalized.len(), 255);
        assert!(normalized.chars().all(|c| c == 'a'));
    }

    #[test]
    fn progress_invariant_rejects_100_on_non_success() {
        let job = Job::builder()
            .id(JobId::new())
            .owner("alice".into())
            .request("{}".into())
            .created_at(Utc::now())
            .updated_at(Utc::now())
            .num_input_granules(10)
            .status(JobStatus::Failed)
            .progress(100)
            .build();
        assert!(!job.progress_matches_invariant());
    }
}
