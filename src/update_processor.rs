//! Update processor: spec.md §4.4 — the work-item state machine, retry
//! handling, progress/final-status bookkeeping, and the hand-off into the
//! failure policy and next-step planner. The preprocessing/transactional
//! split mirrors the teacher's `JobWorker::process_job` (outside-lock I/O)
//! vs. `execute_with_heartbeat` (exclusive access) split; the poll loop
//! itself (claim up to a batch, process serially, never rethrow, always
//! ack) is grounded on `JobRunner::run` in `kernel/jobs/runner.rs`.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::failure_policy::{self, FailureInput, FailureOutcome};
use crate::lifecycle::{self, ProgressStrategy, SimpleRatioProgress};
use crate::model::{
    Job, JobLink, JobMessage, JobStatus, MessageLevel, WorkItem, WorkItemStatus, WorkflowStep,
};
use crate::objectstore::ObjectStore;
use crate::planner::{self, links_for_item, PlannerOutcome};
use crate::queue::messages::UpdateSeverity;
use crate::queue::{Queue, WakeupMessage, WorkItemUpdateMessage};
use crate::service::Service;
use crate::store::StateStore;

pub struct UpdateProcessor<St, Obj, Uq, Wq> {
    store: St,
    object_store: Obj,
    update_queue: Uq,
    wakeup_queue: Wq,
    config: Config,
    progress_strategy: Box<dyn ProgressStrategy>,
}

impl<St, Obj, Uq, Wq> UpdateProcessor<St, Obj, Uq, Wq>
where
    St: StateStore,
    Obj: ObjectStore,
    Uq: Queue<WorkItemUpdateMessage>,
    Wq: Queue<WakeupMessage>,
{
    pub fn new(store: St, object_store: Obj, update_queue: Uq, wakeup_queue: Wq, config: Config) -> Self {
        Self {
            store,
            object_store,
            update_queue,
            wakeup_queue,
            config,
            progress_strategy: Box::new(SimpleRatioProgress),
        }
    }

    /// Drains up to one small batch's worth of messages and processes them
    /// serially, per spec.md §5: one queue-polling loop, never parallel
    /// writes within a job's transaction. Every message is ack'd regardless
    /// of outcome (spec.md §4.2, §7): a bad message must never block the
    /// queue.
    pub async fn run_once(&self) -> Result<usize> {
        let batch_size = UpdateSeverity::Small.max_batch_size(self.config.large_work_item_update_queue_max_batch_size);
        let envelopes = self.update_queue.receive(batch_size).await?;
        let count = envelopes.len();
        for envelope in envelopes {
            if let Err(e) = self.process_message(envelope.body.clone()).await {
                warn!(error = %e, work_item_id = %envelope.body.work_item_id, "update processing failed, message still acked");
            }
            self.update_queue.ack(envelope.receipt).await?;
        }
        Ok(count)
    }

    /// Processes one update message end to end. Never returns an error the
    /// caller should propagate into a retry of the whole message — any
    /// failure here has already been converted into job/work-item state
    /// (FAILED item, failed job) by the time this returns `Ok`. The `Result`
    /// exists only to surface genuinely unexpected store/database failures
    /// (`Transient`) that the outer loop logs and moves past.
    pub async fn process_message(&self, message: WorkItemUpdateMessage) -> Result<()> {
        let job_id = match self.store.job_id_for_item(message.work_item_id).await {
            Ok(id) => id,
            Err(_) => {
                warn!(work_item_id = %message.work_item_id, "update for unknown work item, dropping");
                return Ok(());
            }
        };

        let mut lock = self.store.lock_job(job_id).await?;
        let mut job = self.store.get_job(&mut lock).await?;

        let Some(mut item) = self.store.get_work_item(&mut lock, message.work_item_id).await? else {
            self.store.rollback(lock).await?;
            return Ok(());
        };

        if item.is_terminal() {
            info!(work_item_id = %item.id, status = ?item.status, "ignoring update for already-terminal work item");
            self.store.rollback(lock).await?;
            return Ok(());
        }

        if job.is_terminal() && message.status != WorkItemStatus::Canceled {
            self.store.delete_user_work(&mut lock, &item.service_id).await?;
            self.store.commit(lock).await?;
            warn!(job_id = %job.id, work_item_id = %item.id, "update for terminal job, cleared user_work (drift repair)");
            return Ok(());
        }

        let mut steps = self.store.steps_for_job(&mut lock).await?;
        let max_step_index = steps.iter().map(|s| s.step_index).max().unwrap_or(item.workflow_step_index);
        let is_last_step = item.workflow_step_index == max_step_index;

        let (mut incoming_status, mut incoming_message, mut incoming_category) =
            (message.status, message.message.clone(), message.message_category.clone());

        if incoming_status == WorkItemStatus::Successful && message.results.is_empty() {
            incoming_status = WorkItemStatus::Failed;
            incoming_message = Some("Service did not return any outputs.".to_string());
            incoming_category = Some("no_output".to_string());
        }

        let mut output_item_sizes = message.output_item_sizes.clone();
        if incoming_status == WorkItemStatus::Successful && output_item_sizes.len() < message.results.len() {
            match resolve_missing_sizes(&self.object_store, &message.results, &output_item_sizes).await {
                Ok(sizes) => output_item_sizes = sizes,
                Err(e) => {
                    warn!(work_item_id = %item.id, error = %e, "failed to resolve output sizes");
                    incoming_status = WorkItemStatus::Failed;
                    incoming_message = Some(format!("failed to resolve output sizes: {e}"));
                    incoming_category = Some("object_store_error".to_string());
                }
            }
        }

        // Retry law (spec.md §4.4, §8 property 5): a FAILED item below the
        // retry limit goes back to READY, counts transfer running -> ready.
        if incoming_status == WorkItemStatus::Failed && item.retry_count < self.config.work_item_retry_limit {
            item.status = WorkItemStatus::Ready;
            item.retry_count += 1;
            item.message = incoming_message;
            item.message_category = incoming_category;
            self.store.save_work_item(&mut lock, &item).await?;

            let mut user_work = self.store.get_user_work(&mut lock, &item.service_id).await?;
            user_work.increment_ready(1);
            user_work.decrement_running(1);
            self.store.save_user_work(&mut lock, &user_work).await?;

            self.store.commit(lock).await?;
            info!(work_item_id = %item.id, retry_count = item.retry_count, "retrying failed work item");
            self.wakeup_queue.send(WakeupMessage { service_id: item.service_id.clone() }).await?;
            return Ok(());
        }

        let harmony_duration_ms = item
            .started_at
            .map(|started| (chrono::Utc::now() - started).num_milliseconds().max(0))
            .unwrap_or(0);
        let service_duration_ms = message.duration_ms.unwrap_or(0);

        item.status = incoming_status;
        item.message = incoming_message.clone();
        item.message_category = incoming_category.clone();
        item.results = message.results.clone();
        item.output_item_sizes = output_item_sizes;
        item.duration_ms = harmony_duration_ms.max(service_duration_ms);
        item.scroll_id = message.scroll_id.clone();
        self.store.save_work_item(&mut lock, &item).await?;

        let mut user_work = self.store.get_user_work(&mut lock, &item.service_id).await?;
        user_work.decrement_running(1);
        self.store.save_user_work(&mut lock, &user_work).await?;

        if let Some(hits) = message.hits {
            if hits < job.num_input_granules {
                job.num_input_granules = hits;
                if let Some(mut first_step) = self.store.get_workflow_step(&mut lock, 1).await? {
                    first_step.work_item_count = div_ceil(job.num_input_granules, self.config.cmr_max_page_size);
                    self.store.save_workflow_step(&mut lock, &first_step).await?;
                    replace_step(&mut steps, first_step);
                }
            }
        }

        let mut current_step = self
            .store
            .get_workflow_step(&mut lock, item.workflow_step_index)
            .await?
            .ok_or_else(|| OrchestratorError::Fatal(format!("missing workflow step {}", item.workflow_step_index)))?;

        // Must run before `mark_one_completed`: it may grow this step's
        // `workItemCount` with a continuation item, and the completeness
        // check below needs to see that growth or a query-cmr step gets
        // marked complete one page too early (see planner.rs doc comment).
        let mut continuation_outcome = PlannerOutcome::default();
        planner::plan_query_cmr_continuation(
            &self.store,
            &self.config,
            &mut lock,
            &job,
            &item,
            &mut current_step,
            &mut continuation_outcome,
        )
        .await?;

        current_step.mark_one_completed();
        self.store.save_workflow_step(&mut lock, &current_step).await?;
        replace_step(&mut steps, current_step.clone());

        if current_step.is_complete {
            self.store.delete_user_work(&mut lock, &item.service_id).await?;
        }

        // Final-output link generation (spec.md §4.4 preprocessing note,
        // §4.6): only the last step's successful output becomes a job
        // link. A WARNING with no results produces no link — an Open
        // Question in spec.md §9, decided here as "message only".
        let produced_final_output = is_last_step
            && (item.status == WorkItemStatus::Successful
                || (item.status == WorkItemStatus::Warning && !item.results.is_empty()));
        if produced_final_output {
            match links_for_item(&self.object_store, &item).await {
                Ok(hrefs) => {
                    for href in hrefs {
                        let link = JobLink::builder()
                            .job_id(job.id)
                            .href(href)
                            .rel("data".to_string())
                            .bbox(message.bbox.map(|b| b.to_vec()))
                            .temporal_start(message.temporal_start)
                            .temporal_end(message.temporal_end)
                            .build();
                        self.store.insert_job_link(&mut lock, &link).await?;
                    }
                }
                Err(e) => warn!(work_item_id = %item.id, error = %e, "failed to read output links"),
            }
        }

        let mut wakeups = continuation_outcome.wakeup_services;
        let mut job_failed_outright = false;

        if item.status == WorkItemStatus::Failed || item.status == WorkItemStatus::Warning {
            let level = if item.status == WorkItemStatus::Failed { MessageLevel::Error } else { MessageLevel::Warning };
            let message_text = item.message.clone().unwrap_or_else(|| "service reported an issue".to_string());
            let job_message = JobMessage::builder()
                .job_id(job.id)
                .message(message_text)
                .level(level)
                .category(item.message_category.clone())
                .build();
            self.store.insert_job_message(&mut lock, &job_message).await?;

            if item.status == WorkItemStatus::Failed {
                let messages = self.store.job_messages_for_job(&mut lock).await?;
                let error_count = messages.iter().filter(|m| m.level == MessageLevel::Error).count() as i64;
                let outcome = failure_policy::decide(FailureInput {
                    service_id: &item.service_id,
                    is_warning: false,
                    job_status: job.status,
                    error_count,
                    num_input_granules: job.num_input_granules,
                    max_errors_for_job: self.config.max_errors_for_job,
                    max_percent_errors_for_job: self.config.max_percent_errors_for_job,
                });
                match outcome {
                    FailureOutcome::FailJob => job_failed_outright = true,
                    FailureOutcome::ContinueWithErrors => {
                        if job.status == JobStatus::Running {
                            job.status = JobStatus::RunningWithErrors;
                        }
                    }
                    FailureOutcome::Continue => {}
                }
            }
        }

        if job_failed_outright {
            job.status = JobStatus::Failed;
        } else {
            match planner::plan_downstream(&self.store, &self.object_store, &self.config, &mut lock, &mut current_step, &item).await {
                Ok(outcome) => wakeups.extend(outcome.wakeup_services),
                Err(OrchestratorError::Fatal(msg)) => {
                    warn!(job_id = %job.id, error = %msg, "planner invariant violated, failing job");
                    job.status = JobStatus::Failed;
                    job.message = Some(msg);
                    job_failed_outright = true;
                }
                Err(e) => return Err(e),
            }
            replace_step(&mut steps, current_step.clone());
        }

        if !job_failed_outright {
            job.progress = self.progress_strategy.compute_progress(&steps);

            let first_final_completion = lifecycle::is_first_completion_of_final_step(&current_step, is_last_step);
            let paused_for_preview = lifecycle::should_pause_for_preview(job.status, first_final_completion);
            if paused_for_preview {
                job.status = JobStatus::Paused;
                self.store.delete_user_work(&mut lock, &item.service_id).await?;
            }

            let all_complete = !steps.is_empty() && steps.iter().all(|s| s.is_complete);
            if all_complete && !paused_for_preview && !job.is_terminal() {
                let messages = self.store.job_messages_for_job(&mut lock).await?;
                let links = self.store.job_links_for_job(&mut lock).await?;
                let error_count = messages.iter().filter(|m| m.level == MessageLevel::Error).count() as i64;
                let warning_count = messages.iter().filter(|m| m.level == MessageLevel::Warning).count() as i64;
                let sole_message = if messages.len() == 1 { Some(messages[0].message.as_str()) } else { None };

                job.status = lifecycle::decide_final_status(error_count, warning_count, links.len() as i64);
                job.message = lifecycle::final_message(error_count, warning_count, sole_message);
                job.progress = 100;
            }
        }

        self.store.save_job(&mut lock, &job).await?;
        self.store.commit(lock).await?;

        for service_id in wakeups {
            self.wakeup_queue.send(WakeupMessage { service_id }).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl<St, Obj, Uq, Wq> Service for UpdateProcessor<St, Obj, Uq, Wq>
where
    St: StateStore,
    Obj: ObjectStore,
    Uq: Queue<WorkItemUpdateMessage>,
    Wq: Queue<WakeupMessage>,
{
    fn name(&self) -> &'static str {
        "update-processor"
    }

    /// Polls continuously, backing off after a batch that raised an error
    /// (spec.md §4.2's `delayAfterError`) so a broken backend doesn't spin
    /// the loop.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let error_delay = Duration::from_secs(self.config.work_item_update_queue_processor_delay_after_error_sec);
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.run_once().await {
                Ok(0) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "update processor batch failed, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(error_delay) => {}
                    }
                }
            }
        }
        Ok(())
    }
}

fn div_ceil(numerator: i64, denominator: i64) -> i64 {
    if denominator <= 0 {
        return numerator.max(0);
    }
    (numerator + denominator - 1) / denominator
}

fn replace_step(steps: &mut [WorkflowStep], updated: WorkflowStep) {
    if let Some(slot) = steps.iter_mut().find(|s| s.step_index == updated.step_index) {
        *slot = updated;
    }
}

async fn resolve_missing_sizes(
    object_store: &impl ObjectStore,
    results: &[String],
    known_sizes: &[i64],
) -> Result<Vec<i64>> {
    let mut sizes = known_sizes.to_vec();
    for url in results.iter().skip(sizes.len()) {
        let size = object_store.size(url).await?;
        sizes.push(size as i64);
    }
    Ok(sizes)
}
