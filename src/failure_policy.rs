//! Failure policy: spec.md §4.7, a pure decision function over a failed
//! or warning work item's step identity and the job's running counters,
//! no I/O — the same shape as the teacher's `ListingMachine::decide`
//! (state + event in, next command out).

use crate::model::JobStatus;

/// The query-cmr step identity. A work item failing here cannot proceed
/// without granules, so the policy fails the job outright regardless of
/// tolerance configuration.
pub const QUERY_CMR_SERVICE_PATTERN: &str = "query-cmr";

pub fn is_query_cmr_service(service_id: &str) -> bool {
    service_id.contains(QUERY_CMR_SERVICE_PATTERN)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Keep processing; job stays in its current status.
    Continue,
    /// Keep processing, but the job should move to `RunningWithErrors` if
    /// it is currently `Running`.
    ContinueWithErrors,
    /// The job must fail immediately.
    FailJob,
}

#[derive(Debug, Clone, Copy)]
pub struct FailureInput<'a> {
    pub service_id: &'a str,
    pub is_warning: bool,
    pub job_status: JobStatus,
    /// Error count *after* this failure is recorded.
    pub error_count: i64,
    pub num_input_granules: i64,
    pub max_errors_for_job: i64,
    pub max_percent_errors_for_job: f64,
}

/// Decides what a FAILED/WARNING work item should do to its job, per
/// spec.md §4.7. Callers add the job message for FAILED items themselves
/// (that's a store write, not policy); this function only decides whether
/// the job keeps going, degrades, or fails.
pub fn decide(input: FailureInput<'_>) -> FailureOutcome {
    if input.is_warning {
        return FailureOutcome::Continue;
    }

    if is_query_cmr_service(input.service_id) {
        return FailureOutcome::FailJob;
    }

    if input.error_count > input.max_errors_for_job {
        return FailureOutcome::FailJob;
    }

    if input.num_input_granules > 0 {
        let percent = (input.error_count as f64 / input.num_input_granules as f64) * 100.0;
        if percent > input.max_percent_errors_for_job {
            return FailureOutcome::FailJob;
        }
    }

    if input.job_status == JobStatus::Running {
        FailureOutcome::ContinueWithErrors
    } else {
        FailureOutcome::Continue
    }
}
