//! Reaper: spec.md §4.9. Periodically finds work items stuck RUNNING past
//! a timeout and requeues them as FAILED update messages — the actual
//! retry-vs-fail-job decision still goes through the normal update
//! processor path (§4.7), the same way a real worker's FAILED report
//! would, so there is exactly one place that owns that decision.
//!
//! Grounded on the teacher's `JobRunner`/`JobWorker` poll-sleep-repeat
//! shape (`kernel/jobs/runner.rs`), generalized here to a scan instead of a
//! claim.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::model::WorkItemStatus;
use crate::queue::{Queue, WorkItemUpdateMessage};
use crate::service::Service;
use crate::store::StateStore;

const EXECUTION_TIMEOUT_CATEGORY: &str = "execution_timeout";

pub struct Reaper<St, Uq> {
    store: St,
    update_queue: Uq,
    scan_interval: Duration,
    stale_after: chrono::Duration,
}

impl<St, Uq> Reaper<St, Uq>
where
    St: StateStore,
    Uq: Queue<WorkItemUpdateMessage>,
{
    pub fn new(store: St, update_queue: Uq, config: &Config) -> Self {
        Self {
            store,
            update_queue,
            scan_interval: Duration::from_secs(config.reaper_scan_interval_sec),
            stale_after: chrono::Duration::seconds(config.reaper_timeout_ceiling_sec as i64),
        }
    }

    /// One scan: finds every RUNNING item whose `updatedAt` is older than
    /// the configured ceiling and enqueues a synthetic FAILED update for
    /// each. Never touches work-item/job rows directly — that write, and
    /// the retry-vs-fail-job decision, belongs to the update processor.
    pub async fn scan_once(&self) -> Result<usize> {
        let stale = self.store.find_stale_running_items(self.stale_after).await?;
        for item in &stale {
            let message = WorkItemUpdateMessage {
                work_item_id: item.id,
                status: WorkItemStatus::Failed,
                message: Some("execution timeout".to_string()),
                message_category: Some(EXECUTION_TIMEOUT_CATEGORY.to_string()),
                hits: None,
                results: Vec::new(),
                output_item_sizes: Vec::new(),
                total_items_size: None,
                duration_ms: None,
                workflow_step_index: item.workflow_step_index,
                scroll_id: None,
                bbox: None,
                temporal_start: None,
                temporal_end: None,
            };
            if let Err(e) = self.update_queue.send(message).await {
                warn!(work_item_id = %item.id, error = %e, "failed to enqueue reaper timeout for stale work item");
            }
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "reaper requeued stale running items as timeouts");
        }
        Ok(stale.len())
    }
}

#[async_trait]
impl<St, Uq> Service for Reaper<St, Uq>
where
    St: StateStore,
    Uq: Queue<WorkItemUpdateMessage>,
{
    fn name(&self) -> &'static str {
        "reaper"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if let Err(e) = self.scan_once().await {
                warn!(error = %e, "reaper scan failed");
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.scan_interval) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Job, JobId, JobStatus, WorkItem};
    use crate::queue::memory::InMemoryQueue;
    use crate::store::memory::MemoryStore;
    use chrono::Utc;

    fn test_config() -> Config {
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
            reaper_timeout_ceiling_sec: 0,
            artifact_bucket_root: "/tmp".into(),
        }
    }

    #[tokio::test]
    async fn stale_running_item_requeued_as_timeout_failure() {
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

        let item = WorkItem::builder()
            .id(crate::model::WorkItemId::new())
            .job_id(job_id)
            .service_id("subsetter".into())
            .workflow_step_index(1)
            .status(WorkItemStatus::Running)
            .sort_index(0)
            .build();
        store.seed_work_item(item).await;

        let update_queue: InMemoryQueue<WorkItemUpdateMessage> = InMemoryQueue::new();
        let config = test_config();
        let reaper = Reaper::new(store, update_queue.clone(), &config);

        let count = reaper.scan_once().await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(update_queue.len().await, 1);

        let envelope = update_queue.receive(1).await.unwrap();
        assert_eq!(envelope[0].body.status, WorkItemStatus::Failed);
        assert_eq!(envelope[0].body.message_category.as_deref(), Some("execution_timeout"));
    }

    #[tokio::test]
    async fn ready_items_are_never_reaped() {
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

        let item = WorkItem::builder()
            .id(crate::model::WorkItemId::new())
            .job_id(job_id)
            .service_id("subsetter".into())
            .workflow_step_index(1)
            .status(WorkItemStatus::Ready)
            .sort_index(0)
            .build();
        store.seed_work_item(item).await;

        let update_queue: InMemoryQueue<WorkItemUpdateMessage> = InMemoryQueue::new();
        let config = test_config();
        let reaper = Reaper::new(store, update_queue.clone(), &config);

        assert_eq!(reaper.scan_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_running_item_on_a_terminal_job_is_never_reaped() {
        let store = MemoryStore::new();
        let job_id = JobId::new();
        let job = Job::builder()
            .id(job_id)
            .owner("alice".into())
            .request("{}".into())
            .created_at(Utc::now())
            .updated_at(Utc::now())
            .num_input_granules(1)
            .status(JobStatus::Canceled)
            .build();
        store.seed_job(job).await;

        let item = WorkItem::builder()
            .id(crate::model::WorkItemId::new())
            .job_id(job_id)
            .service_id("subsetter".into())
            .workflow_step_index(1)
            .status(WorkItemStatus::Running)
            .sort_index(0)
            .build();
        store.seed_work_item(item).await;

        let update_queue: InMemoryQueue<WorkItemUpdateMessage> = InMemoryQueue::new();
        let config = test_config();
        let reaper = Reaper::new(store, update_queue.clone(), &config);

        assert_eq!(reaper.scan_once().await.unwrap(), 0);
    }
}
