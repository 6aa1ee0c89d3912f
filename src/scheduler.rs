//! Scheduler: spec.md §4.3. Hands out up to N work items for a requesting
//! service, claiming rows with `SKIP LOCKED` the way the teacher's
//! `Job::claim_jobs` does for its generic job queue, generalized here to
//! "ready work items for job/service, fairness-ordered across jobs".

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::model::{JobId, JobStatus, WorkItem};
use crate::objectstore::staging_prefix;
use crate::queue::{Queue, WakeupMessage};
use crate::store::StateStore;

/// A work item handed to a worker, with its step's operation JSON carrying
/// a per-item staging location so concurrent items never collide on
/// object-storage paths (spec.md §4.3 point 3).
#[derive(Debug, Clone)]
pub struct AssignedWorkItem {
    pub item: WorkItem,
    pub operation: serde_json::Value,
}

pub struct Scheduler<St, Wq> {
    store: St,
    wakeup_queue: Wq,
    use_service_queues: bool,
}

impl<St, Wq> Scheduler<St, Wq>
where
    St: StateStore,
    Wq: Queue<WakeupMessage>,
{
    pub fn new(store: St, wakeup_queue: Wq, config: &Config) -> Self {
        Self {
            store,
            wakeup_queue,
            use_service_queues: config.use_service_queues,
        }
    }

    /// Drains pending wake-up messages that target `service_id`, putting
    /// any for other services back on the queue. Non-blocking: a missing
    /// wake-up never stops a poll, it's purely an optimization hint.
    async fn drain_wakeups_for(&self, service_id: &str) -> crate::error::Result<()> {
        let pending = self.wakeup_queue.len().await;
        if pending == 0 {
            return Ok(());
        }
        let envelopes = self.wakeup_queue.receive(pending).await?;
        for envelope in envelopes {
            self.wakeup_queue.ack(envelope.receipt).await?;
            if envelope.body.service_id != service_id {
                self.wakeup_queue.send(envelope.body).await?;
            }
        }
        Ok(())
    }

    /// Implements spec.md §4.3's algorithm: drain wake-ups, then walk
    /// fairness-ordered candidate jobs, claiming up to `limit` items total.
    pub async fn request_work(
        &self,
        service_id: &str,
        limit: i64,
    ) -> crate::error::Result<Vec<AssignedWorkItem>> {
        self.drain_wakeups_for(service_id).await?;

        let mut assigned = Vec::new();
        if limit <= 0 {
            return Ok(assigned);
        }

        // Oversample candidates: some may turn out terminal/paused and
        // yield nothing, so we don't stop at exactly `limit` candidates.
        let candidates = self.store.candidate_jobs_for_service(service_id, limit.max(1) * 4).await?;

        for job_id in candidates {
            if assigned.len() as i64 >= limit {
                break;
            }
            let remaining = limit - assigned.len() as i64;
            match self.claim_from_job(job_id, service_id, remaining).await {
                Ok(mut items) => assigned.append(&mut items),
                Err(e) => {
                    warn!(job_id = %job_id, service_id, error = %e, "failed to claim work items for job");
                }
            }
        }

        Ok(assigned)
    }

    async fn claim_from_job(
        &self,
        job_id: JobId,
        service_id: &str,
        limit: i64,
    ) -> crate::error::Result<Vec<AssignedWorkItem>> {
        let mut lock = self.store.lock_job(job_id).await?;
        let job = self.store.get_job(&mut lock).await?;

        if job.is_terminal() || job.status == JobStatus::Paused {
            self.store.rollback(lock).await?;
            return Ok(Vec::new());
        }

        let mut claimed = self
            .store
            .claim_ready_work_items(&mut lock, service_id, limit, self.use_service_queues)
            .await?;

        if claimed.is_empty() {
            let user_work = self.store.get_user_work(&mut lock, service_id).await?;
            if user_work.ready_count > 0 {
                // Drift repair: the counter disagreed with the row count.
                let recomputed = self.store.recompute_ready_count(&mut lock, service_id).await?;
                debug!(job_id = %job_id, service_id, recomputed, "recomputed ready count after empty claim");
                if recomputed > 0 {
                    claimed = self
                        .store
                        .claim_ready_work_items(&mut lock, service_id, limit, self.use_service_queues)
                        .await?;
                }
            }
        }

        if !claimed.is_empty() {
            let mut user_work = self.store.get_user_work(&mut lock, service_id).await?;
            user_work.decrement_ready(claimed.len() as i64);
            user_work.increment_running(claimed.len() as i64);
            self.store.save_user_work(&mut lock, &user_work).await?;
        }

        let step_index = claimed.first().map(|i| i.workflow_step_index);
        let operation = if let Some(step_index) = step_index {
            self.store
                .get_workflow_step(&mut lock, step_index)
                .await?
                .map(|s| s.operation)
        } else {
            None
        };

        self.store.commit(lock).await?;

        if !claimed.is_empty() {
            info!(job_id = %job_id, service_id, count = claimed.len(), "claimed work items");
        }

        let operation = operation.unwrap_or_else(|| serde_json::json!({}));
        Ok(claimed
            .into_iter()
            .map(|item| {
                let mut op = operation.clone();
                let prefix = staging_prefix(item.job_id, item.id);
                if let serde_json::Value::Object(ref mut map) = op {
                    map.insert("stagingLocation".into(), serde_json::Value::String(prefix));
                }
                AssignedWorkItem { item, operation: op }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Job, JobId, UserWork, WorkItem, WorkItemStatus, WorkflowStep};
    use crate::queue::memory::InMemoryQueue;
    use crate::store::memory::MemoryStore;
    use chrono::Utc;

    fn new_config() -> Config {
        Config {
            database_url: "postgres://localhost/test".into(),
            port: 8080,
            cmr_max_page_size: 2000,
            max_errors_for_job: 10,
            max_percent_errors_for_job: 50.0,
            work_item_retry_limit: 3,
            aggregate_stac_catalog_max_page_size: 2000,
            large_work_item_update_queue_max_batch_size: 1,
            work_item_update_queue_processor_delay_after_error_sec: 5,
            use_service_queues: false,
            reaper_scan_interval_sec: 60,
            reaper_timeout_ceiling_sec: 3600,
            artifact_bucket_root: "/tmp".into(),
        }
    }

    async fn seeded_job(store: &MemoryStore, ready_count: i64) -> JobId {
        let job_id = JobId::new();
        let job = Job::builder()
            .id(job_id)
            .owner("alice".into())
            .request("{}".into())
            .created_at(Utc::now())
            .updated_at(Utc::now())
            .num_input_granules(2)
            .status(JobStatus::Running)
            .build();
        store.seed_job(job).await;

        let step = WorkflowStep::builder()
            .job_id(job_id)
            .step_index(1)
            .service_id("subsetter".into())
            .operation(serde_json::json!({"image": "subsetter:latest"}))
            .work_item_count(ready_count)
            .build();
        store.seed_workflow_step(step).await;

        for i in 0..ready_count {
            let item = WorkItem::builder()
                .id(crate::model::WorkItemId::new())
                .job_id(job_id)
                .service_id("subsetter".into())
                .workflow_step_index(1)
                .sort_index(i)
                .build();
            store.seed_work_item(item).await;
        }

        store
            .seed_user_work(
                UserWork::builder()
                    .job_id(job_id)
                    .service_id("subsetter".into())
                    .ready_count(ready_count)
                    .build(),
            )
            .await;

        job_id
    }

    #[tokio::test]
    async fn claims_ready_items_and_stamps_staging_location() {
        let store = MemoryStore::new();
        seeded_job(&store, 2).await;
        let config = new_config();
        let wakeup: InMemoryQueue<WakeupMessage> = InMemoryQueue::new();
        let scheduler = Scheduler::new(store, wakeup, &config);

        let assigned = scheduler.request_work("subsetter", 10).await.unwrap();
        assert_eq!(assigned.len(), 2);
        for a in &assigned {
            assert_eq!(a.item.status, WorkItemStatus::Running);
            assert!(a.operation["stagingLocation"]
                .as_str()
                .unwrap()
                .contains(&a.item.id.to_string()));
        }
    }

    #[tokio::test]
    async fn respects_limit_across_request() {
        let store = MemoryStore::new();
        seeded_job(&store, 5).await;
        let config = new_config();
        let wakeup: InMemoryQueue<WakeupMessage> = InMemoryQueue::new();
        let scheduler = Scheduler::new(store, wakeup, &config);

        let assigned = scheduler.request_work("subsetter", 3).await.unwrap();
        assert_eq!(assigned.len(), 3);
    }

    #[tokio::test]
    async fn paused_job_yields_nothing() {
        let store = MemoryStore::new();
        let job_id = seeded_job(&store, 2).await;
        let mut job = store.get_job_snapshot(job_id).await.unwrap();
        job.status = JobStatus::Paused;
        store.seed_job(job).await;

        let config = new_config();
        let wakeup: InMemoryQueue<WakeupMessage> = InMemoryQueue::new();
        let scheduler = Scheduler::new(store, wakeup, &config);

        let assigned = scheduler.request_work("subsetter", 10).await.unwrap();
        assert!(assigned.is_empty());
    }

    #[tokio::test]
    async fn drift_repair_recomputes_ready_count_when_empty() {
        let store = MemoryStore::new();
        let job_id = JobId::new();
        let job = Job::builder()
            .id(job_id)
            .owner("alice".into())
            .request("{}".into())
            .created_at(Utc::now())
            .updated_at(Utc::now())
            .num_input_granules(1)
            .status(JobStatus::Running)
            .build();
        store.seed_job(job).await;
        // readyCount says 3 but there are no READY rows: drift.
        store
            .seed_user_work(
                UserWork::builder()
                    .job_id(job_id)
                    .service_id("subsetter".into())
                    .ready_count(3)
                    .build(),
            )
            .await;

        let config = new_config();
        let wakeup: InMemoryQueue<WakeupMessage> = InMemoryQueue::new();
        let scheduler = Scheduler::new(store.clone(), wakeup, &config);
        let assigned = scheduler.request_work("subsetter", 10).await.unwrap();
        assert!(assigned.is_empty());
    }
}
