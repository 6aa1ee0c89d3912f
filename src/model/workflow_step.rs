use typed_builder::TypedBuilder;

use super::job::JobId;

/// One stage in a job's linear service chain. `(jobID, stepIndex)` is
/// unique; steps are contiguous and 1-indexed.
#[derive(Debug, Clone, TypedBuilder, sqlx::FromRow)]
pub struct WorkflowStep {
    pub job_id: JobId,
    pub step_index: i32,
    pub service_id: String,
    pub operation: serde_json::Value,
    #[builder(default = 0)]
    pub work_item_count: i64,
    #[builder(default = 0)]
    pub completed_work_item_count: i64,
    #[builder(default = false)]
    pub has_aggregated_output: bool,
    #[builder(default = false)]
    pub is_batched: bool,
    #[builder(default = false)]
    pub is_sequential: bool,
    #[builder(default = false)]
    pub is_complete: bool,
}

impl WorkflowStep {
    /// `completedWorkItemCount <= workItemCount` must hold while incomplete;
    /// once `isComplete` flips true it never reverts, regardless of count.
    pub fn completion_invariant_holds(&self) -> bool {
        self.is_complete || self.completed_work_item_count <= self.work_item_count
    }

    pub fn mark_one_completed(&mut self) {
        if self.is_complete {
            return;
        }
        self.completed_work_item_count += 1;
        if self.completed_work_item_count >= self.work_item_count {
            self.is_complete = true;
        }
    }
}
