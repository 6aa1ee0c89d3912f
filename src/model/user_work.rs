use typed_builder::TypedBuilder;

use super::job::JobId;

/// Per-(job, service) admission-control counters. Both counts must stay
/// `>= 0`; `readyCount` tracks the number of READY items modulo eventual
/// recomputation by the scheduler's drift repair.
#[derive(Debug, Clone, TypedBuilder, sqlx::FromRow)]
pub struct UserWork {
    pub job_id: JobId,
    pub service_id: String,
    #[builder(default = 0)]
    pub ready_count: i64,
    #[builder(default = 0)]
    pub running_count: i64,
}

impl UserWork {
    pub fn increment_ready(&mut self, n: i64) {
        self.ready_count += n;
    }

    /// Clamps at zero rather than going negative.
    pub fn decrement_running(&mut self, n: i64) {
        self.running_count = (self.running_count - n).max(0);
    }

    pub fn decrement_ready(&mut self, n: i64) {
        self.ready_count = (self.ready_count - n).max(0);
    }

    pub fn increment_running(&mut self, n: i64) {
        self.running_count += n;
    }

    pub fn invariant_holds(&self) -> bool {
        self.ready_count >= 0 && self.running_count >= 0
    }
}
