//! Job lifecycle manager: spec.md §4.6 — progress computation, final
//! status decision, and the preview pause/resume transition, plus the
//! operator-triggered pause/resume/cancel operations the component
//! description names alongside them.

use std::collections::HashSet;

use crate::error::Result;
use crate::model::{Job, JobStatus, WorkItemStatus, WorkflowStep};
use crate::store::StateStore;

/// Progress must be monotonic non-decreasing until the job is terminal,
/// and reach exactly 100 once it is `SUCCESSFUL` or `COMPLETE_WITH_ERRORS`.
/// spec.md §9 leaves the exact algorithm open; both heuristics it mentions
/// are implemented here so callers can pick (decided in DESIGN.md:
/// `SimpleRatioProgress` is the default).
pub trait ProgressStrategy: Send + Sync {
    /// `steps` ordered by `step_index`, 1-indexed and contiguous.
    fn compute_progress(&self, steps: &[WorkflowStep]) -> i32;
}

/// Each known step contributes an equal share of the whole, proportional
/// to its own completed/expected ratio. A step with `work_item_count == 0`
/// (not yet planned) contributes zero to the running average, which is
/// why progress starts near zero and rises as later steps get planned and
/// worked, never regressing since `completed_work_item_count` only grows.
pub struct SimpleRatioProgress;

impl ProgressStrategy for SimpleRatioProgress {
    fn compute_progress(&self, steps: &[WorkflowStep]) -> i32 {
        if steps.is_empty() {
            return 0;
        }
        let total_share: f64 = steps
            .iter()
            .map(|s| step_fraction(s))
            .sum::<f64>()
            / steps.len() as f64;
        (total_share * 100.0).floor() as i32
    }
}

/// Early-pipeline work (query-cmr) contributes less than later, CPU-heavy
/// steps: weight grows linearly with step index so a job spends most of
/// its visible progress bar on the expensive later stages.
pub struct SequentialWeightedProgress;

impl ProgressStrategy for SequentialWeightedProgress {
    fn compute_progress(&self, steps: &[WorkflowStep]) -> i32 {
        if steps.is_empty() {
            return 0;
        }
        let total_weight: f64 = steps.iter().map(|s| (s.step_index) as f64).sum();
        if total_weight <= 0.0 {
            return 0;
        }
        let weighted: f64 = steps
            .iter()
            .map(|s| (s.step_index as f64) * step_fraction(s))
            .sum();
        ((weighted / total_weight) * 100.0).floor() as i32
    }
}

fn step_fraction(step: &WorkflowStep) -> f64 {
    if step.is_complete {
        1.0
    } else if step.work_item_count <= 0 {
        0.0
    } else {
        (step.completed_work_item_count as f64 / step.work_item_count as f64).min(1.0)
    }
}

/// Final status decision once every step's work items are complete, per
/// spec.md §4.6's table.
pub fn decide_final_status(error_count: i64, warning_count: i64, data_link_count: i64) -> JobStatus {
    if error_count > 0 && data_link_count > 0 {
        JobStatus::CompleteWithErrors
    } else if error_count > 0 {
        JobStatus::Failed
    } else {
        // SUCCESSFUL whether or not there were warnings; spec.md treats
        // warnings as non-fatal and does not introduce a separate status.
        let _ = warning_count;
        JobStatus::Successful
    }
}

/// Builds the final job message: the sole error/warning's own text when
/// there is exactly one, otherwise a canned pointer to the errors/warnings
/// endpoint (spec.md §4.6).
pub fn final_message(
    error_count: i64,
    warning_count: i64,
    sole_message: Option<&str>,
) -> Option<String> {
    let total = error_count + warning_count;
    match total {
        0 => None,
        1 => sole_message.map(str::to_string),
        _ => Some(format!(
            "The job has completed with {error_count} error(s) and {warning_count} warning(s). \
             See the job's errors and warnings links for details."
        )),
    }
}

/// Whether this is the first work item of the final step to complete,
/// the trigger for the PREVIEWING -> PAUSED transition (spec.md §4.6).
pub fn is_first_completion_of_final_step(step: &WorkflowStep, is_final_step: bool) -> bool {
    is_final_step && step.completed_work_item_count == 1
}

pub fn should_pause_for_preview(job_status: JobStatus, first_final_completion: bool) -> bool {
    job_status == JobStatus::Previewing && first_final_completion
}

/// Operator-triggered pause (distinct from the preview auto-pause in
/// `should_pause_for_preview`, which the update processor applies inline).
/// No-op from a terminal or already-paused job.
pub async fn pause_job<St: StateStore>(store: &St, lock: &mut St::Lock) -> Result<Job> {
    let mut job = store.get_job(lock).await?;
    if job.is_terminal() || job.status == JobStatus::Paused {
        return Ok(job);
    }
    job.status = JobStatus::Paused;
    store.save_job(lock, &job).await?;
    Ok(job)
}

/// PAUSED -> RUNNING, recreating `readyCount` from the READY rows for
/// every service in the job's chain (spec.md §4.6, scenario S6). No-op
/// from any status other than PAUSED.
pub async fn resume_job<St: StateStore>(store: &St, lock: &mut St::Lock) -> Result<Job> {
    let mut job = store.get_job(lock).await?;
    if job.status != JobStatus::Paused {
        return Ok(job);
    }
    job.status = JobStatus::Running;
    store.save_job(lock, &job).await?;

    let steps = store.steps_for_job(lock).await?;
    let mut seen = HashSet::new();
    for step in &steps {
        if seen.insert(step.service_id.clone()) {
            store.recompute_ready_count(lock, &step.service_id).await?;
        }
    }
    Ok(job)
}

/// Cancel, accepted from any non-terminal status (spec.md §5). Cascades
/// CANCELED to every non-terminal work item across every step and clears
/// `user_work` for each service in the chain, so the scheduler stops
/// admitting more work for this job; any item a worker is mid-flight on
/// is left for the reaper to clean up (spec.md §5's cancellation note).
pub async fn cancel_job<St: StateStore>(store: &St, lock: &mut St::Lock) -> Result<Job> {
    let mut job = store.get_job(lock).await?;
    if job.is_terminal() {
        return Ok(job);
    }

    let steps = store.steps_for_job(lock).await?;
    let mut seen = HashSet::new();
    for step in &steps {
        let items = store.items_for_step(lock, step.step_index).await?;
        for mut item in items {
            if !item.is_terminal() {
                item.status = WorkItemStatus::Canceled;
                store.save_work_item(lock, &item).await?;
            }
        }
        if seen.insert(step.service_id.clone()) {
            store.delete_user_work(lock, &step.service_id).await?;
        }
    }

    job.status = JobStatus::Canceled;
    job.message = Some("Job canceled by user request.".to_string());
    store.save_job(lock, &job).await?;
    Ok(job)
}
