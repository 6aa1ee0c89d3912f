//! End-to-end scenario tests, one per S1-S6: drive a seeded job through
//! `UpdateProcessor::process_message` the way a real service fleet's
//! reported updates would, using the in-memory store/queues/object store
//! so the whole pipeline runs without a database.

use chrono::Utc;

use harmony_orchestrator::model::{
    Job, JobId, JobStatus, UserWork, WorkItem, WorkItemId, WorkItemStatus, WorkflowStep,
};
use harmony_orchestrator::objectstore::FilesystemObjectStore;
use harmony_orchestrator::queue::memory::InMemoryQueue;
use harmony_orchestrator::queue::{WakeupMessage, WorkItemUpdateMessage};
use harmony_orchestrator::store::memory::MemoryStore;
use harmony_orchestrator::store::StateStore;
use harmony_orchestrator::update_processor::UpdateProcessor;
use harmony_orchestrator::{lifecycle, Config};

fn tempdir() -> std::path::PathBuf {
    std::env::temp_dir().join(format!("harmony-scenarios-{}", uuid::Uuid::new_v4()))
}

fn config(max_errors: i64, max_percent: f64, retry_limit: i32) -> Config {
    Config {
        database_url: "postgres://localhost/test".into(),
        port: 8080,
        cmr_max_page_size: 2000,
        max_errors_for_job: max_errors,
        max_percent_errors_for_job: max_percent,
        work_item_retry_limit: retry_limit,
        aggregate_stac_catalog_max_page_size: 2000,
        large_work_item_update_queue_max_batch_size: 10,
        work_item_update_queue_processor_delay_after_error_sec: 5,
        use_service_queues: false,
        reaper_scan_interval_sec: 60,
        reaper_timeout_ceiling_sec: 3600,
        artifact_bucket_root: "/tmp".into(),
    }
}

fn processor(
    store: MemoryStore,
    config: Config,
) -> UpdateProcessor<MemoryStore, FilesystemObjectStore, InMemoryQueue<WorkItemUpdateMessage>, InMemoryQueue<WakeupMessage>>
{
    UpdateProcessor::new(
        store,
        FilesystemObjectStore::new(tempdir()),
        InMemoryQueue::new(),
        InMemoryQueue::new(),
        config,
    )
}

fn seed_job(job_id: JobId, num_input_granules: i64, status: JobStatus) -> Job {
    Job::builder()
        .id(job_id)
        .owner("alice".into())
        .request("{}".into())
        .created_at(Utc::now())
        .updated_at(Utc::now())
        .num_input_granules(num_input_granules)
        .status(status)
        .build()
}

fn seed_item(
    job_id: JobId,
    service_id: &str,
    step_index: i32,
    sort_index: i64,
    status: WorkItemStatus,
) -> WorkItem {
    WorkItem::builder()
        .id(WorkItemId::new())
        .job_id(job_id)
        .service_id(service_id.to_string())
        .workflow_step_index(step_index)
        .status(status)
        .sort_index(sort_index)
        .started_at(Some(Utc::now()))
        .build()
}

/// Two-step query-cmr -> subsetter chain, the shared shape S1-S4 build on.
async fn seed_two_step_chain(store: &MemoryStore, job_id: JobId) {
    let step1 = WorkflowStep::builder()
        .job_id(job_id)
        .step_index(1)
        .service_id("query-cmr".into())
        .operation(serde_json::json!({}))
        .work_item_count(1)
        .build();
    let step2 = WorkflowStep::builder()
        .job_id(job_id)
        .step_index(2)
        .service_id("subsetter".into())
        .operation(serde_json::json!({}))
        .work_item_count(0)
        .build();
    store.seed_workflow_step(step1).await;
    store.seed_workflow_step(step2).await;
    store
        .seed_user_work(
            UserWork::builder()
                .job_id(job_id)
                .service_id("query-cmr".into())
                .build(),
        )
        .await;
    store
        .seed_user_work(
            UserWork::builder()
                .job_id(job_id)
                .service_id("subsetter".into())
                .build(),
        )
        .await;
}

fn update(item_id: WorkItemId, status: WorkItemStatus, step: i32) -> WorkItemUpdateMessage {
    WorkItemUpdateMessage {
        work_item_id: item_id,
        status,
        message: None,
        message_category: None,
        hits: None,
        results: Vec::new(),
        output_item_sizes: Vec::new(),
        total_items_size: None,
        duration_ms: None,
        workflow_step_index: step,
        scroll_id: None,
        bbox: None,
        temporal_start: None,
        temporal_end: None,
    }
}

#[tokio::test]
async fn s1_happy_two_step_job_completes_successfully() {
    let store = MemoryStore::new();
    let job_id = JobId::new();
    store.seed_job(seed_job(job_id, 2, JobStatus::Running)).await;
    seed_two_step_chain(&store, job_id).await;

    let cmr_item = seed_item(job_id, "query-cmr", 1, 0, WorkItemStatus::Running);
    let cmr_item_id = cmr_item.id;
    store.seed_work_item(cmr_item).await;

    let proc = processor(store.clone(), config(10, 100.0, 3));

    let mut cmr_update = update(cmr_item_id, WorkItemStatus::Successful, 1);
    cmr_update.hits = Some(2);
    cmr_update.results = vec!["s3://granule-1".into(), "s3://granule-2".into()];
    cmr_update.output_item_sizes = vec![10, 10];
    proc.process_message(cmr_update).await.unwrap();

    let step2 = store.get_workflow_step_snapshot(job_id, 2).await.unwrap();
    assert_eq!(step2.work_item_count, 2);

    let subsetter_items = {
        let mut lock = store.lock_job(job_id).await.unwrap();
        let items = store.items_for_step(&mut lock, 2).await.unwrap();
        store.commit(lock).await.unwrap();
        items
    };
    assert_eq!(subsetter_items.len(), 2);

    for item in &subsetter_items {
        let mut u = update(item.id, WorkItemStatus::Successful, 2);
        u.results = vec![format!("s3://output-{}", item.sort_index)];
        u.output_item_sizes = vec![5];
        proc.process_message(u).await.unwrap();
    }

    let job = store.get_job_snapshot(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Successful);
    assert_eq!(job.progress, 100);
    assert_eq!(store.job_links(job_id).await.len(), 2);
}

#[tokio::test]
async fn s2_retry_then_success_yields_retry_count_two() {
    let store = MemoryStore::new();
    let job_id = JobId::new();
    store.seed_job(seed_job(job_id, 1, JobStatus::Running)).await;

    let step1 = WorkflowStep::builder()
        .job_id(job_id)
        .step_index(1)
        .service_id("subsetter".into())
        .operation(serde_json::json!({}))
        .work_item_count(1)
        .build();
    store.seed_workflow_step(step1).await;
    store
        .seed_user_work(
            UserWork::builder()
                .job_id(job_id)
                .service_id("subsetter".into())
                .running_count(1)
                .build(),
        )
        .await;

    let item = seed_item(job_id, "subsetter", 1, 0, WorkItemStatus::Running);
    let item_id = item.id;
    store.seed_work_item(item).await;

    let proc = processor(store.clone(), config(10, 100.0, 3));

    proc.process_message(update(item_id, WorkItemStatus::Failed, 1))
        .await
        .unwrap();
    proc.process_message(update(item_id, WorkItemStatus::Failed, 1))
        .await
        .unwrap();

    let item = {
        let mut lock = store.lock_job(job_id).await.unwrap();
        let item = store.get_work_item(&mut lock, item_id).await.unwrap().unwrap();
        store.commit(lock).await.unwrap();
        item
    };
    assert_eq!(item.status, WorkItemStatus::Ready);
    assert_eq!(item.retry_count, 2);

    let mut success = update(item_id, WorkItemStatus::Successful, 1);
    success.results = vec!["s3://final.nc".into()];
    success.output_item_sizes = vec![20];
    proc.process_message(success).await.unwrap();

    let job = store.get_job_snapshot(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Successful);
    assert_eq!(store.job_links(job_id).await.len(), 1);
}

#[tokio::test]
async fn s3_partial_failure_within_tolerance_completes_with_errors() {
    let store = MemoryStore::new();
    let job_id = JobId::new();
    store.seed_job(seed_job(job_id, 10, JobStatus::Running)).await;

    let step1 = WorkflowStep::builder()
        .job_id(job_id)
        .step_index(1)
        .service_id("subsetter".into())
        .operation(serde_json::json!({}))
        .work_item_count(10)
        .build();
    store.seed_workflow_step(step1).await;
    store
        .seed_user_work(
            UserWork::builder()
                .job_id(job_id)
                .service_id("subsetter".into())
                .running_count(10)
                .build(),
        )
        .await;

    let mut item_ids = Vec::new();
    for i in 0..10 {
        let item = seed_item(job_id, "subsetter", 1, i, WorkItemStatus::Running);
        item_ids.push(item.id);
        store.seed_work_item(item).await;
    }

    // retryLimit = 0: failures go straight to terminal FAILED for this test.
    let proc = processor(store.clone(), config(5, 100.0, 0));

    for &id in &item_ids[0..3] {
        proc.process_message(update(id, WorkItemStatus::Failed, 1)).await.unwrap();
    }
    for &id in &item_ids[3..10] {
        let mut u = update(id, WorkItemStatus::Successful, 1);
        u.results = vec!["s3://out.nc".into()];
        u.output_item_sizes = vec![1];
        proc.process_message(u).await.unwrap();
    }

    let job = store.get_job_snapshot(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::CompleteWithErrors);
    assert_eq!(store.job_links(job_id).await.len(), 7);
    let messages = store.job_messages(job_id).await;
    assert_eq!(
        messages
            .iter()
            .filter(|m| m.level == harmony_orchestrator::model::MessageLevel::Error)
            .count(),
        3
    );
}

#[tokio::test]
async fn s4_error_rate_exceeded_fails_job_and_ignores_further_updates() {
    let store = MemoryStore::new();
    let job_id = JobId::new();
    store.seed_job(seed_job(job_id, 10, JobStatus::Running)).await;

    let step1 = WorkflowStep::builder()
        .job_id(job_id)
        .step_index(1)
        .service_id("subsetter".into())
        .operation(serde_json::json!({}))
        .work_item_count(10)
        .build();
    store.seed_workflow_step(step1).await;
    store
        .seed_user_work(
            UserWork::builder()
                .job_id(job_id)
                .service_id("subsetter".into())
                .running_count(10)
                .build(),
        )
        .await;

    let mut item_ids = Vec::new();
    for i in 0..10 {
        let item = seed_item(job_id, "subsetter", 1, i, WorkItemStatus::Running);
        item_ids.push(item.id);
        store.seed_work_item(item).await;
    }

    // maxPercentErrorsForJob = 20, retryLimit = 0: 3/10 = 30% trips it.
    let proc = processor(store.clone(), config(100, 20.0, 0));

    for &id in &item_ids[0..3] {
        proc.process_message(update(id, WorkItemStatus::Failed, 1)).await.unwrap();
    }

    let job = store.get_job_snapshot(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);

    // A fourth item's later success must be ignored (job already terminal).
    let mut late_success = update(item_ids[3], WorkItemStatus::Successful, 1);
    late_success.results = vec!["s3://late.nc".into()];
    proc.process_message(late_success).await.unwrap();

    let job_after = store.get_job_snapshot(job_id).await.unwrap();
    assert_eq!(job_after.status, JobStatus::Failed);
    assert!(store.job_links(job_id).await.is_empty());
}

#[tokio::test]
async fn s5_aggregation_produces_one_work_item_once_prior_step_completes() {
    let store = MemoryStore::new();
    let job_id = JobId::new();
    store.seed_job(seed_job(job_id, 2, JobStatus::Running)).await;

    let step1 = WorkflowStep::builder()
        .job_id(job_id)
        .step_index(1)
        .service_id("subsetter".into())
        .operation(serde_json::json!({}))
        .work_item_count(2)
        .build();
    let step2 = WorkflowStep::builder()
        .job_id(job_id)
        .step_index(2)
        .service_id("concatenator".into())
        .operation(serde_json::json!({}))
        .has_aggregated_output(true)
        .work_item_count(0)
        .build();
    store.seed_workflow_step(step1).await;
    store.seed_workflow_step(step2).await;
    store
        .seed_user_work(
            UserWork::builder()
                .job_id(job_id)
                .service_id("subsetter".into())
                .running_count(2)
                .build(),
        )
        .await;

    let item0 = seed_item(job_id, "subsetter", 1, 0, WorkItemStatus::Running);
    let item1 = seed_item(job_id, "subsetter", 1, 1, WorkItemStatus::Running);
    let (id0, id1) = (item0.id, item1.id);
    store.seed_work_item(item0).await;
    store.seed_work_item(item1).await;

    let proc = processor(store.clone(), config(10, 100.0, 3));

    let mut u0 = update(id0, WorkItemStatus::Successful, 1);
    u0.results = vec!["s3://part-0".into()];
    u0.output_item_sizes = vec![1];
    proc.process_message(u0).await.unwrap();

    // Step 2 must not be planned yet: step 1 isn't complete.
    assert_eq!(store.get_workflow_step_snapshot(job_id, 2).await.unwrap().work_item_count, 0);

    let mut u1 = update(id1, WorkItemStatus::Successful, 1);
    u1.results = vec!["s3://part-1".into()];
    u1.output_item_sizes = vec![1];
    proc.process_message(u1).await.unwrap();

    let step2_after = store.get_workflow_step_snapshot(job_id, 2).await.unwrap();
    assert_eq!(step2_after.work_item_count, 1);

    let mut lock = store.lock_job(job_id).await.unwrap();
    let items = store.items_for_step(&mut lock, 2).await.unwrap();
    store.commit(lock).await.unwrap();
    assert_eq!(items.len(), 1);
    assert!(items[0]
        .stac_catalog_location
        .as_ref()
        .unwrap()
        .ends_with("catalog0.json"));
}

#[tokio::test]
async fn s6_preview_pause_then_resume_recomputes_ready_count() {
    let store = MemoryStore::new();
    let job_id = JobId::new();
    store.seed_job(seed_job(job_id, 1, JobStatus::Previewing)).await;

    let step1 = WorkflowStep::builder()
        .job_id(job_id)
        .step_index(1)
        .service_id("subsetter".into())
        .operation(serde_json::json!({}))
        .work_item_count(1)
        .build();
    store.seed_workflow_step(step1).await;
    store
        .seed_user_work(
            UserWork::builder()
                .job_id(job_id)
                .service_id("subsetter".into())
                .running_count(1)
                .build(),
        )
        .await;

    let item = seed_item(job_id, "subsetter", 1, 0, WorkItemStatus::Running);
    let item_id = item.id;
    store.seed_work_item(item).await;

    let proc = processor(store.clone(), config(10, 100.0, 3));

    let mut u = update(item_id, WorkItemStatus::Successful, 1);
    u.results = vec!["s3://preview.nc".into()];
    u.output_item_sizes = vec![1];
    proc.process_message(u).await.unwrap();

    let job = store.get_job_snapshot(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Paused);
    let user_work = {
        let mut lock = store.lock_job(job_id).await.unwrap();
        let row = store.get_user_work(&mut lock, "subsetter").await.unwrap();
        store.commit(lock).await.unwrap();
        row
    };
    assert_eq!(user_work.ready_count, 0);

    let resumed = {
        let mut lock = store.lock_job(job_id).await.unwrap();
        let resumed = lifecycle::resume_job(&store, &mut lock).await.unwrap();
        store.commit(lock).await.unwrap();
        resumed
    };
    assert_eq!(resumed.status, JobStatus::Running);
}
