//! Next-step planner: spec.md §4.5. Given one completed work item and the
//! workflow step it belongs to, creates the next step's work items — by
//! fan-out, one-shot aggregation, or batched aggregation — and runs the
//! query-cmr self-continuation loop. All mutation happens through the
//! `StateStore` lock the caller already holds; the caller is responsible
//! for sending the returned wake-up signals only *after* committing, the
//! way `LockJob`'s write-then-enqueue boundary works elsewhere (spec.md §9:
//! explicit post-commit enqueue, not an implicit emitter).

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::failure_policy::is_query_cmr_service;
use crate::model::{Job, WorkItem, WorkItemId, WorkItemStatus, WorkflowStep};
use crate::objectstore::{aggregate_prefix, ObjectStore};
use crate::store::StateStore;

/// Granule budget for the next query-cmr invocation (spec.md §4.5):
/// `max(0, min(cmrMaxPageSize, numInputGranules - successfulQueryCmrItems * cmrMaxPageSize))`.
pub fn query_cmr_granule_limit(
    cmr_max_page_size: i64,
    num_input_granules: i64,
    successful_query_cmr_items: i64,
) -> i64 {
    let budget = num_input_granules - successful_query_cmr_items * cmr_max_page_size;
    budget.max(0).min(cmr_max_page_size)
}

#[derive(Debug, Default)]
pub struct PlannerOutcome {
    /// Services to send a scheduler wake-up for, once the transaction
    /// that produced this outcome has committed.
    pub wakeup_services: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct StacLink {
    href: String,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct StacCatalog {
    #[serde(default)]
    links: Vec<StacLink>,
    #[serde(default)]
    next: Option<String>,
}

async fn read_catalog_links(object_store: &impl ObjectStore, location: &str) -> Result<Vec<String>> {
    let mut links = Vec::new();
    let mut current = Some(location.to_string());
    while let Some(key) = current {
        let bytes = object_store.get(&key).await?;
        let catalog: StacCatalog = serde_json::from_slice(&bytes)
            .map_err(|e| OrchestratorError::Data(format!("malformed STAC catalog {key}: {e}")))?;
        links.extend(catalog.links.into_iter().map(|l| l.href));
        current = catalog.next;
    }
    Ok(links)
}

pub(crate) async fn links_for_item(object_store: &impl ObjectStore, item: &WorkItem) -> Result<Vec<String>> {
    match &item.stac_catalog_location {
        Some(location) => read_catalog_links(object_store, location).await,
        None => Ok(item.results.clone()),
    }
}

/// Writes `links` as a linked list of STAC catalog pages under `prefix`,
/// each page holding up to `page_size` links and pointing to the next
/// page's filename. Returns the key of the first page.
async fn write_linked_catalogs(
    object_store: &impl ObjectStore,
    prefix: &str,
    links: &[String],
    page_size: usize,
) -> Result<String> {
    let page_size = page_size.max(1);
    let empty: Vec<String> = Vec::new();
    let chunks: Vec<&[String]> = if links.is_empty() {
        vec![empty.as_slice()]
    } else {
        links.chunks(page_size).collect()
    };
    let total = chunks.len();
    for (i, chunk) in chunks.iter().enumerate() {
        let key = format!("{prefix}catalog{i}.json");
        let next = (i + 1 < total).then(|| format!("{prefix}catalog{}.json", i + 1));
        let catalog = StacCatalog {
            links: chunk.iter().map(|href| StacLink { href: href.clone() }).collect(),
            next,
        };
        let bytes = serde_json::to_vec(&catalog)?;
        object_store.put(&key, bytes).await?;
    }
    Ok(format!("{prefix}catalog0.json"))
}

/// Bumps `user_work.readyCount` for `(job, service)` after inserting `n`
/// new READY items (spec.md §4.5: "After insertion: IncrementReady(...)").
/// Without this, the scheduler's `candidate_jobs_for_service` — which
/// filters on `readyCount > 0` — would never surface the job/service pair
/// the planner just created work for.
async fn bump_ready_count<St: StateStore>(store: &St, lock: &mut St::Lock, service_id: &str, n: i64) -> Result<()> {
    if n <= 0 {
        return Ok(());
    }
    let mut user_work = store.get_user_work(lock, service_id).await?;
    user_work.increment_ready(n);
    store.save_user_work(lock, &user_work).await?;
    Ok(())
}

/// `sortIndex` base for a batch of new items at `next_step`: preserved
/// from the parent unless the producing step was itself aggregated or
/// sequential, in which case a fresh base is taken (spec.md §4.5 case 1).
async fn fan_out_sort_index_base<St: StateStore>(
    store: &St,
    lock: &mut St::Lock,
    current_step: &WorkflowStep,
    next_step: &WorkflowStep,
    parent_sort_index: i64,
) -> Result<i64> {
    if current_step.has_aggregated_output || current_step.is_sequential {
        Ok(store.max_sort_index(lock, next_step.step_index, &next_step.service_id).await? + 1)
    } else {
        Ok(parent_sort_index)
    }
}

fn new_ready_item(
    job_id: crate::model::JobId,
    service_id: &str,
    step_index: i32,
    sort_index: i64,
    result: String,
) -> WorkItem {
    WorkItem::builder()
        .id(WorkItemId::new())
        .job_id(job_id)
        .service_id(service_id.to_string())
        .workflow_step_index(step_index)
        .status(WorkItemStatus::Ready)
        .sort_index(sort_index)
        .results(vec![result])
        .build()
}

/// Runs the query-cmr self-continuation loop (spec.md §4.5): clones the
/// completed item forward within the same step while the granule budget
/// allows, inheriting the service-reported `scrollID` as the continuation
/// cursor for the next page.
///
/// Callers MUST run this before `WorkflowStep::mark_one_completed` for the
/// item that just finished: it may grow `current_step.work_item_count`,
/// and `mark_one_completed`'s "are we done" check has to see that growth
/// or it marks a query-cmr step complete one page too early (spec.md §3:
/// `completedWorkItemCount <= workItemCount` while incomplete, and the
/// step's `isComplete` flag never reverts once set).
pub(crate) async fn plan_query_cmr_continuation<St: StateStore>(
    store: &St,
    config: &Config,
    lock: &mut St::Lock,
    job: &Job,
    completed_item: &WorkItem,
    current_step: &mut WorkflowStep,
    outcome: &mut PlannerOutcome,
) -> Result<()> {
    if completed_item.status != WorkItemStatus::Successful {
        return Ok(());
    }
    if !is_query_cmr_service(&completed_item.service_id) {
        return Ok(());
    }

    let successful_count = store
        .count_items_by_status(lock, &completed_item.service_id, WorkItemStatus::Successful)
        .await?;
    let limit = query_cmr_granule_limit(
        config.cmr_max_page_size,
        job.num_input_granules,
        successful_count,
    );
    if limit <= 0 {
        return Ok(());
    }

    let mut continuation = WorkItem::builder()
        .id(WorkItemId::new())
        .job_id(completed_item.job_id)
        .service_id(completed_item.service_id.clone())
        .workflow_step_index(completed_item.workflow_step_index)
        .status(WorkItemStatus::Ready)
        .sort_index(completed_item.sort_index + 1)
        .build();
    continuation.scroll_id = completed_item.scroll_id.clone();

    store.insert_work_items(lock, &[continuation]).await?;
    current_step.work_item_count += 1;
    store.save_workflow_step(lock, current_step).await?;
    bump_ready_count(store, lock, &completed_item.service_id, 1).await?;
    outcome.wakeup_services.push(completed_item.service_id.clone());
    Ok(())
}

async fn plan_fan_out<St: StateStore>(
    store: &St,
    lock: &mut St::Lock,
    current_step: &WorkflowStep,
    next_step: &mut WorkflowStep,
    completed_item: &WorkItem,
    outcome: &mut PlannerOutcome,
) -> Result<()> {
    if completed_item.status != WorkItemStatus::Successful || completed_item.results.is_empty() {
        return Ok(());
    }

    let base = fan_out_sort_index_base(store, lock, current_step, next_step, completed_item.sort_index).await?;
    let new_items: Vec<WorkItem> = completed_item
        .results
        .iter()
        .enumerate()
        .map(|(i, url)| {
            let sort_index = if current_step.has_aggregated_output || current_step.is_sequential {
                base + i as i64
            } else {
                base
            };
            new_ready_item(
                completed_item.job_id,
                &next_step.service_id,
                next_step.step_index,
                sort_index,
                url.clone(),
            )
        })
        .collect();

    store.insert_work_items(lock, &new_items).await?;
    next_step.work_item_count += new_items.len() as i64;
    store.save_workflow_step(lock, next_step).await?;
    bump_ready_count(store, lock, &next_step.service_id, new_items.len() as i64).await?;
    outcome.wakeup_services.push(next_step.service_id.clone());
    Ok(())
}

/// One-shot aggregation (spec.md §4.5 case 2): fires once, when the
/// producing step is fully complete, gathering every successful item's
/// output links into a single paged STAC catalog and one new work item.
async fn plan_aggregation<St: StateStore, Obj: ObjectStore>(
    store: &St,
    object_store: &Obj,
    config: &Config,
    lock: &mut St::Lock,
    current_step: &WorkflowStep,
    next_step: &mut WorkflowStep,
    outcome: &mut PlannerOutcome,
) -> Result<()> {
    if !current_step.is_complete {
        return Ok(());
    }
    if next_step.work_item_count > 0 {
        // Already aggregated; a duplicate completion delivery must not
        // insert a second aggregate item.
        return Ok(());
    }

    let items = store.items_for_step(lock, current_step.step_index).await?;
    let successful: Vec<&WorkItem> = items
        .iter()
        .filter(|i| i.status == WorkItemStatus::Successful)
        .collect();
    if successful.is_empty() {
        return Ok(());
    }

    let mut links = Vec::new();
    for item in &successful {
        links.extend(links_for_item(object_store, item).await?);
    }

    if (links.len() as i64) < successful.len() as i64 {
        return Err(OrchestratorError::Fatal(format!(
            "aggregation for job {} step {} gathered {} links, expected at least {}",
            current_step.job_id,
            current_step.step_index,
            links.len(),
            successful.len()
        )));
    }

    let new_item_id = WorkItemId::new();
    let prefix = aggregate_prefix(current_step.job_id, new_item_id);
    let first_catalog = write_linked_catalogs(
        object_store,
        &prefix,
        &links,
        config.aggregate_stac_catalog_max_page_size,
    )
    .await?;

    let base = store.max_sort_index(lock, next_step.step_index, &next_step.service_id).await? + 1;
    let mut item = WorkItem::builder()
        .id(new_item_id)
        .job_id(current_step.job_id)
        .service_id(next_step.service_id.clone())
        .workflow_step_index(next_step.step_index)
        .status(WorkItemStatus::Ready)
        .sort_index(base)
        .build();
    item.stac_catalog_location = Some(first_catalog);

    store.insert_work_items(lock, &[item]).await?;
    next_step.work_item_count += 1;
    store.save_workflow_step(lock, next_step).await?;
    bump_ready_count(store, lock, &next_step.service_id, 1).await?;
    outcome.wakeup_services.push(next_step.service_id.clone());
    Ok(())
}

/// Batched aggregation (spec.md §4.5 case 3): emits one work item per
/// full batch of `aggregate_stac_catalog_max_page_size` successful prior
/// items, in sort order, and flushes a trailing partial batch once the
/// producing step is fully complete.
async fn plan_batched_aggregation<St: StateStore, Obj: ObjectStore>(
    store: &St,
    object_store: &Obj,
    config: &Config,
    lock: &mut St::Lock,
    current_step: &WorkflowStep,
    next_step: &mut WorkflowStep,
    outcome: &mut PlannerOutcome,
) -> Result<()> {
    let batch_size = config.aggregate_stac_catalog_max_page_size.max(1);
    let items = store.items_for_step(lock, current_step.step_index).await?;
    let successful: Vec<&WorkItem> = items
        .iter()
        .filter(|i| i.status == WorkItemStatus::Successful)
        .collect();

    loop {
        let already_flushed = next_step.work_item_count as usize;
        let start = already_flushed * batch_size;
        let end = start + batch_size;

        let batch: &[&WorkItem] = if end <= successful.len() {
            &successful[start..end]
        } else if current_step.is_complete && start < successful.len() {
            &successful[start..]
        } else {
            break;
        };
        if batch.is_empty() {
            break;
        }

        let mut links = Vec::new();
        for item in batch {
            links.extend(links_for_item(object_store, item).await?);
        }

        let new_item_id = WorkItemId::new();
        let prefix = aggregate_prefix(current_step.job_id, new_item_id);
        let first_catalog = write_linked_catalogs(
            object_store,
            &prefix,
            &links,
            config.aggregate_stac_catalog_max_page_size,
        )
        .await?;

        let base = store.max_sort_index(lock, next_step.step_index, &next_step.service_id).await? + 1;
        let mut item = WorkItem::builder()
            .id(new_item_id)
            .job_id(current_step.job_id)
            .service_id(next_step.service_id.clone())
            .workflow_step_index(next_step.step_index)
            .status(WorkItemStatus::Ready)
            .sort_index(base)
            .build();
        item.stac_catalog_location = Some(first_catalog);

        store.insert_work_items(lock, &[item]).await?;
        next_step.work_item_count += 1;
        store.save_workflow_step(lock, next_step).await?;
        bump_ready_count(store, lock, &next_step.service_id, 1).await?;
        outcome.wakeup_services.push(next_step.service_id.clone());

        if current_step.is_complete && start < successful.len() && end > successful.len() {
            // That was the trailing partial flush; nothing more to do.
            break;
        }
    }
    Ok(())
}

/// Plans the next step's work items from `current_step`'s state — fan-out,
/// aggregation, or batched aggregation — without touching the
/// self-continuation loop. `current_step` must already reflect the
/// completed item (`mark_one_completed` already called).
pub async fn plan_downstream<St: StateStore, Obj: ObjectStore>(
    store: &St,
    object_store: &Obj,
    config: &Config,
    lock: &mut St::Lock,
    current_step: &mut WorkflowStep,
    completed_item: &WorkItem,
) -> Result<PlannerOutcome> {
    let mut outcome = PlannerOutcome::default();

    let Some(mut next_step) = store.get_workflow_step(lock, current_step.step_index + 1).await? else {
        return Ok(outcome);
    };

    if next_step.is_batched {
        plan_batched_aggregation(store, object_store, config, lock, current_step, &mut next_step, &mut outcome)
            .await?;
    } else if next_step.has_aggregated_output {
        plan_aggregation(store, object_store, config, lock, current_step, &mut next_step, &mut outcome).await?;
    } else {
        plan_fan_out(store, lock, current_step, &mut next_step, completed_item, &mut outcome).await?;
    }

    Ok(outcome)
}

/// Entry point combining both halves, for callers (and this module's own
/// tests) that don't need to interleave `mark_one_completed` between them.
/// The production update-processor path calls `plan_query_cmr_continuation`
/// and `plan_downstream` separately instead, with `mark_one_completed` run
/// in between — see that function's doc comment for why the order matters.
pub async fn plan_next<St: StateStore, Obj: ObjectStore>(
    store: &St,
    object_store: &Obj,
    config: &Config,
    lock: &mut St::Lock,
    job: &Job,
    completed_item: &WorkItem,
    current_step: &mut WorkflowStep,
) -> Result<PlannerOutcome> {
    let mut outcome = PlannerOutcome::default();
    plan_query_cmr_continuation(store, config, lock, job, completed_item, current_step, &mut outcome)
        .await?;
    let downstream = plan_downstream(store, object_store, config, lock, current_step, completed_item).await?;
    outcome.wakeup_services.extend(downstream.wakeup_services);
    Ok(outcome)
}
