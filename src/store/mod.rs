pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    Job, JobId, JobLink, JobMessage, UserWork, WorkItem, WorkItemId, WorkItemStatus, WorkflowStep,
};

/// Transactional contract over `jobs`, `workflow_steps`, `work_items`,
/// `job_links`, `job_messages`, and `user_work`.
///
/// `Lock` represents holding `LockJob(jobID)`: every operation that reads
/// data it is about to write takes `&mut Self::Lock`, guaranteeing it runs
/// inside the same transaction the lock was acquired under. Implementations
/// are generic parameters rather than trait objects (mirroring a worker
/// generic over its backing job store) since the lock type differs between
/// a real database transaction and an in-memory guard.
#[async_trait]
pub trait StateStore: Send + Sync {
    type Lock: Send;

    /// Acquires `LockJob(jobID)`, serializing all workflow mutations for
    /// that job within the returned lock's lifetime.
    async fn lock_job(&self, job_id: JobId) -> Result<Self::Lock>;

    /// Commits the transaction the lock was held under.
    async fn commit(&self, lock: Self::Lock) -> Result<()>;

    /// Rolls back the transaction, discarding any writes made through it.
    async fn rollback(&self, lock: Self::Lock) -> Result<()>;

    async fn get_job(&self, lock: &mut Self::Lock) -> Result<Job>;
    async fn save_job(&self, lock: &mut Self::Lock, job: &Job) -> Result<()>;

    async fn get_workflow_step(
        &self,
        lock: &mut Self::Lock,
        step_index: i32,
    ) -> Result<Option<WorkflowStep>>;
    async fn save_workflow_step(&self, lock: &mut Self::Lock, step: &WorkflowStep) -> Result<()>;

    async fn get_work_item(
        &self,
        lock: &mut Self::Lock,
        item_id: WorkItemId,
    ) -> Result<Option<WorkItem>>;

    /// Writes only if the row's current status permits the transition to
    /// `item.status`; fails with `OrchestratorError::Conflict` otherwise
    /// (`StaleUpdate` in the spec's terms).
    async fn save_work_item(&self, lock: &mut Self::Lock, item: &WorkItem) -> Result<()>;

    /// Atomic multi-row insert. All items must share one `serviceID`.
    async fn insert_work_items(&self, lock: &mut Self::Lock, items: &[WorkItem]) -> Result<()>;

    async fn get_user_work(&self, lock: &mut Self::Lock, service_id: &str) -> Result<UserWork>;
    async fn save_user_work(&self, lock: &mut Self::Lock, row: &UserWork) -> Result<()>;

    /// Replaces `readyCount` with the true count of READY items for
    /// `(jobID, serviceID)`.
    async fn recompute_ready_count(&self, lock: &mut Self::Lock, service_id: &str) -> Result<i64>;

    async fn delete_user_work(&self, lock: &mut Self::Lock, service_id: &str) -> Result<()>;

    async fn insert_job_link(&self, lock: &mut Self::Lock, link: &JobLink) -> Result<()>;
    async fn insert_job_message(&self, lock: &mut Self::Lock, message: &JobMessage) -> Result<()>;

    async fn max_sort_index(
        &self,
        lock: &mut Self::Lock,
        step_index: i32,
        service_id: &str,
    ) -> Result<i64>;

    /// Candidate `(jobID, serviceID)` pairs with `readyCount > 0` for a
    /// service, ordered least-recently-served first, tie-broken by jobID.
    /// Read outside any lock; the scheduler locks each candidate in turn.
    async fn candidate_jobs_for_service(&self, service_id: &str, limit: i64) -> Result<Vec<JobId>>;

    /// `SELECT ... FOR UPDATE SKIP LOCKED` the first `limit` READY items of
    /// `service_id` for the locked job, marking them QUEUED or RUNNING.
    async fn claim_ready_work_items(
        &self,
        lock: &mut Self::Lock,
        service_id: &str,
        limit: i64,
        use_service_queues: bool,
    ) -> Result<Vec<WorkItem>>;

    /// Work items whose `updatedAt` has not advanced in `older_than`,
    /// belonging to jobs still running. Used by the reaper.
    async fn find_stale_running_items(
        &self,
        older_than: chrono::Duration,
    ) -> Result<Vec<WorkItem>>;

    /// Count of the locked job's items for `service_id` in `status`.
    /// Used by the query-cmr granule budget (successful count) and by
    /// aggregation's completeness check.
    async fn count_items_by_status(
        &self,
        lock: &mut Self::Lock,
        service_id: &str,
        status: WorkItemStatus,
    ) -> Result<i64>;

    /// All items for the locked job at `step_index`, ordered by `sortIndex`
    /// then `id`. Used by the aggregation planner to page through a prior
    /// step's complete output set.
    async fn items_for_step(
        &self,
        lock: &mut Self::Lock,
        step_index: i32,
    ) -> Result<Vec<WorkItem>>;

    /// Resolves the owning job for a work item without holding `LockJob`,
    /// so the update processor can look up which job to lock from a
    /// message that only carries a work-item id.
    async fn job_id_for_item(&self, item_id: WorkItemId) -> Result<JobId>;

    /// Whether `job_id` is async, read without holding `LockJob`. Used by
    /// the callback ingress to reject an explicit `status=successful`
    /// report for async jobs before any queue write happens (spec.md
    /// §4.8: only internal completion, §4.6, may mark an async job
    /// successful).
    async fn job_is_async(&self, job_id: JobId) -> Result<bool>;

    /// All workflow steps for the locked job, ordered by `stepIndex`. Used
    /// by the lifecycle manager to compute progress and detect final
    /// completion across the whole chain.
    async fn steps_for_job(&self, lock: &mut Self::Lock) -> Result<Vec<WorkflowStep>>;

    /// All job messages recorded for the locked job. Used to derive
    /// `errorCount`/`warningCount` for the failure policy and final-status
    /// decision.
    async fn job_messages_for_job(&self, lock: &mut Self::Lock) -> Result<Vec<JobMessage>>;

    /// All job links recorded for the locked job. Used to derive
    /// `dataLinkCount` for the final-status decision.
    async fn job_links_for_job(&self, lock: &mut Self::Lock) -> Result<Vec<JobLink>>;
}
