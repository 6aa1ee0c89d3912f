//! In-memory `StateStore` for scenario and unit tests. Stands in for a
//! database the way `TestJobManager` stands in for the database-backed job
//! manager: the same trait, no connection required.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{OrchestratorError, Result};
use crate::model::{
    Job, JobId, JobLink, JobMessage, UserWork, WorkItem, WorkItemId, WorkItemStatus, WorkflowStep,
};

use super::StateStore;

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    steps: HashMap<(JobId, i32), WorkflowStep>,
    items: HashMap<WorkItemId, WorkItem>,
    item_touched_at: HashMap<WorkItemId, chrono::DateTime<Utc>>,
    user_work: HashMap<(JobId, String), UserWork>,
    links: Vec<JobLink>,
    messages: Vec<JobMessage>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_job(&self, job: Job) {
        self.inner.lock().await.jobs.insert(job.id, job);
    }

    pub async fn seed_workflow_step(&self, step: WorkflowStep) {
        self.inner
            .lock()
            .await
            .steps
            .insert((step.job_id, step.step_index), step);
    }

    pub async fn seed_work_item(&self, item: WorkItem) {
        let mut inner = self.inner.lock().await;
        inner.item_touched_at.insert(item.id, Utc::now());
        inner.items.insert(item.id, item);
    }

    pub async fn seed_user_work(&self, row: UserWork) {
        self.inner
            .lock()
            .await
            .user_work
            .insert((row.job_id, row.service_id.clone()), row);
    }

    pub async fn job_links(&self, job_id: JobId) -> Vec<JobLink> {
        self.inner
            .lock()
            .await
            .links
            .iter()
            .filter(|l| l.job_id == job_id)
            .cloned()
            .collect()
    }

    pub async fn job_messages(&self, job_id: JobId) -> Vec<JobMessage> {
        self.inner
            .lock()
            .await
            .messages
            .iter()
            .filter(|m| m.job_id == job_id)
            .cloned()
            .collect()
    }

    pub async fn get_job_snapshot(&self, job_id: JobId) -> Option<Job> {
        self.inner.lock().await.jobs.get(&job_id).cloned()
    }

    pub async fn get_workflow_step_snapshot(
        &self,
        job_id: JobId,
        step_index: i32,
    ) -> Option<WorkflowStep> {
        self.inner
            .lock()
            .await
            .steps
            .get(&(job_id, step_index))
            .cloned()
    }

    pub async fn get_user_work_snapshot(&self, job_id: JobId, service_id: &str) -> Option<UserWork> {
        self.inner
            .lock()
            .await
            .user_work
            .get(&(job_id, service_id.to_string()))
            .cloned()
    }
}

pub struct MemoryLock {
    job_id: JobId,
    guard: OwnedMutexGuard<Inner>,
}

#[async_trait]
impl StateStore for MemoryStore {
    type Lock = MemoryLock;

    async fn lock_job(&self, job_id: JobId) -> Result<Self::Lock> {
        let guard = self.inner.clone().lock_owned().await;
        if !guard.jobs.contains_key(&job_id) {
            return Err(OrchestratorError::Conflict(format!(
                "no such job {job_id}"
            )));
        }
        Ok(MemoryLock { job_id, guard })
    }

    async fn commit(&self, _lock: Self::Lock) -> Result<()> {
        // Mutations are applied in place as each save_* call happens; there
        // is no staged journal to flush. Dropping the guard releases the
        // lock.
        Ok(())
    }

    async fn rollback(&self, _lock: Self::Lock) -> Result<()> {
        // Best-effort: this in-memory store does not journal writes, so a
        // rollback after partial mutation cannot fully undo them. Scenario
        // tests that need rollback semantics should assert via the
        // postgres-backed store instead.
        Ok(())
    }

    async fn get_job(&self, lock: &mut Self::Lock) -> Result<Job> {
        lock.guard
            .jobs
            .get(&lock.job_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::Conflict(format!("no such job {}", lock.job_id)))
    }

    async fn save_job(&self, lock: &mut Self::Lock, job: &Job) -> Result<()> {
        lock.guard.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_workflow_step(
        &self,
        lock: &mut Self::Lock,
        step_index: i32,
    ) -> Result<Option<WorkflowStep>> {
        Ok(lock.guard.steps.get(&(lock.job_id, step_index)).cloned())
    }

    async fn save_workflow_step(&self, lock: &mut Self::Lock, step: &WorkflowStep) -> Result<()> {
        lock.guard
            .steps
            .insert((step.job_id, step.step_index), step.clone());
        Ok(())
    }

    async fn get_work_item(
        &self,
        lock: &mut Self::Lock,
        item_id: WorkItemId,
    ) -> Result<Option<WorkItem>> {
        Ok(lock.guard.items.get(&item_id).cloned())
    }

    async fn save_work_item(&self, lock: &mut Self::Lock, item: &WorkItem) -> Result<()> {
        if let Some(existing) = lock.guard.items.get(&item.id) {
            if existing.is_terminal() && existing.status != item.status {
                return Err(OrchestratorError::Conflict(format!(
                    "work item {} is already terminal ({:?})",
                    item.id, existing.status
                )));
            }
        }
        lock.guard.item_touched_at.insert(item.id, Utc::now());
        lock.guard.items.insert(item.id, item.clone());
        Ok(())
    }

    async fn insert_work_items(&self, lock: &mut Self::Lock, items: &[WorkItem]) -> Result<()> {
        let now = Utc::now();
        for item in items {
            lock.guard.item_touched_at.insert(item.id, now);
            lock.guard.items.insert(item.id, item.clone());
        }
        Ok(())
    }

    async fn get_user_work(&self, lock: &mut Self::Lock, service_id: &str) -> Result<UserWork> {
        Ok(lock
            .guard
            .user_work
            .get(&(lock.job_id, service_id.to_string()))
            .cloned()
            .unwrap_or_else(|| {
                UserWork::builder()
                    .job_id(lock.job_id)
                    .service_id(service_id.to_string())
                    .build()
            }))
    }

    async fn save_user_work(&self, lock: &mut Self::Lock, row: &UserWork) -> Result<()> {
        if row.ready_count < 0 || row.running_count < 0 {
            return Err(OrchestratorError::Fatal(
                "user_work counter underflow".into(),
            ));
        }
        lock.guard
            .user_work
            .insert((row.job_id, row.service_id.clone()), row.clone());
        Ok(())
    }

    async fn recompute_ready_count(&self, lock: &mut Self::Lock, service_id: &str) -> Result<i64> {
        let true_count = lock
            .guard
            .items
            .values()
            .filter(|i| {
                i.job_id == lock.job_id
                    && i.service_id == service_id
                    && i.status == WorkItemStatus::Ready
            })
            .count() as i64;
        let mut row = self.get_user_work(lock, service_id).await?;
        row.ready_count = true_count;
        self.save_user_work(lock, &row).await?;
        Ok(true_count)
    }

    async fn delete_user_work(&self, lock: &mut Self::Lock, service_id: &str) -> Result<()> {
        lock.guard
            .user_work
            .remove(&(lock.job_id, service_id.to_string()));
        Ok(())
    }

    async fn insert_job_link(&self, lock: &mut Self::Lock, link: &JobLink) -> Result<()> {
        lock.guard.links.push(link.clone());
        Ok(())
    }

    async fn insert_job_message(&self, lock: &mut Self::Lock, message: &JobMessage) -> Result<()> {
        lock.guard.messages.push(message.clone());
        Ok(())
    }

    async fn max_sort_index(
        &self,
        lock: &mut Self::Lock,
        step_index: i32,
        service_id: &str,
    ) -> Result<i64> {
        Ok(lock
            .guard
            .items
            .values()
            .filter(|i| {
                i.job_id == lock.job_id
                    && i.workflow_step_index == step_index
                    && i.service_id == service_id
            })
            .map(|i| i.sort_index)
            .max()
            .unwrap_or(-1))
    }

    async fn candidate_jobs_for_service(&self, service_id: &str, limit: i64) -> Result<Vec<JobId>> {
        let inner = self.inner.lock().await;
        let mut candidates: Vec<(JobId, chrono::DateTime<Utc>)> = inner
            .user_work
            .iter()
            .filter(|((_, svc), row)| svc == service_id && row.ready_count > 0)
            .map(|((job_id, _), _)| {
                let updated = inner
                    .jobs
                    .get(job_id)
                    .map(|j| j.updated_at)
                    .unwrap_or_default();
                (*job_id, updated)
            })
            .collect();
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.as_uuid().cmp(b.0.as_uuid())));
        candidates.truncate(limit.max(0) as usize);
        Ok(candidates.into_iter().map(|(id, _)| id).collect())
    }

    async fn claim_ready_work_items(
        &self,
        lock: &mut Self::Lock,
        service_id: &str,
        limit: i64,
        use_service_queues: bool,
    ) -> Result<Vec<WorkItem>> {
        let job_id = lock.job_id;
        let mut ready_ids: Vec<WorkItemId> = lock
            .guard
            .items
            .values()
            .filter(|i| i.job_id == job_id && i.service_id == service_id && i.status == WorkItemStatus::Ready)
            .map(|i| i.id)
            .collect();
        ready_ids.sort_by_key(|id| *id.as_uuid());
        ready_ids.truncate(limit.max(0) as usize);

        let now = Utc::now();
        let next_status = if use_service_queues {
            WorkItemStatus::Queued
        } else {
            WorkItemStatus::Running
        };
        let mut claimed = Vec::with_capacity(ready_ids.len());
        for id in ready_ids {
            if let Some(item) = lock.guard.items.get_mut(&id) {
                item.status = next_status;
                item.started_at = Some(now);
                claimed.push(item.clone());
            }
        }
        Ok(claimed)
    }

    async fn find_stale_running_items(
        &self,
        older_than: chrono::Duration,
    ) -> Result<Vec<WorkItem>> {
        let inner = self.inner.lock().await;
        let cutoff = Utc::now() - older_than;
        Ok(inner
            .items
            .values()
            .filter(|i| {
                i.status == WorkItemStatus::Running
                    && inner
                        .item_touched_at
                        .get(&i.id)
                        .map(|t| *t < cutoff)
                        .unwrap_or(false)
                    && inner
                        .jobs
                        .get(&i.job_id)
                        .map(|j| !j.status.is_terminal())
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn count_items_by_status(
        &self,
        lock: &mut Self::Lock,
        service_id: &str,
        status: WorkItemStatus,
    ) -> Result<i64> {
        Ok(lock
            .guard
            .items
            .values()
            .filter(|i| i.job_id == lock.job_id && i.service_id == service_id && i.status == status)
            .count() as i64)
    }

    async fn items_for_step(
        &self,
        lock: &mut Self::Lock,
        step_index: i32,
    ) -> Result<Vec<WorkItem>> {
        let mut items: Vec<WorkItem> = lock
            .guard
            .items
            .values()
            .filter(|i| i.job_id == lock.job_id && i.workflow_step_index == step_index)
            .cloned()
            .collect();
        items.sort_by_key(|i| (i.sort_index, *i.id.as_uuid()));
        Ok(items)
    }

    async fn job_id_for_item(&self, item_id: WorkItemId) -> Result<JobId> {
        let inner = self.inner.lock().await;
        inner
            .items
            .get(&item_id)
            .map(|i| i.job_id)
            .ok_or_else(|| OrchestratorError::Conflict(format!("no such work item {item_id}")))
    }

    async fn job_is_async(&self, job_id: JobId) -> Result<bool> {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .get(&job_id)
            .map(|j| j.is_async)
            .ok_or_else(|| OrchestratorError::Conflict(format!("no such job {job_id}")))
    }

    async fn steps_for_job(&self, lock: &mut Self::Lock) -> Result<Vec<WorkflowStep>> {
        let job_id = lock.job_id;
        let mut steps: Vec<WorkflowStep> = lock
            .guard
            .steps
            .values()
            .filter(|s| s.job_id == job_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_index);
        Ok(steps)
    }

    async fn job_messages_for_job(&self, lock: &mut Self::Lock) -> Result<Vec<JobMessage>> {
        let job_id = lock.job_id;
        Ok(lock
            .guard
            .messages
            .iter()
            .filter(|m| m.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn job_links_for_job(&self, lock: &mut Self::Lock) -> Result<Vec<JobLink>> {
        let job_id = lock.job_id;
        Ok(lock
            .guard
            .links
            .iter()
            .filter(|l| l.job_id == job_id)
            .cloned()
            .collect())
    }
}
