//! Postgres-backed `StateStore`. `LockJob` is a `SELECT ... FOR UPDATE` on
//! the job row, held for the lifetime of the transaction; the scheduler's
//! batch claim uses `FOR UPDATE SKIP LOCKED` instead so competing
//! schedulers never block on each other.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::error::{OrchestratorError, Result};
use crate::model::{
    Job, JobId, JobLink, JobMessage, UserWork, WorkItem, WorkItemId, WorkItemStatus, WorkflowStep,
};

use super::StateStore;

#[derive(Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub struct PgJobLock {
    job_id: JobId,
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StateStore for PostgresStateStore {
    type Lock = PgJobLock;

    async fn lock_job(&self, job_id: JobId) -> Result<Self::Lock> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT id FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;
        if row.is_none() {
            return Err(OrchestratorError::Conflict(format!(
                "no such job {job_id}"
            )));
        }
        Ok(PgJobLock { job_id, tx })
    }

    async fn commit(&self, lock: Self::Lock) -> Result<()> {
        lock.tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self, lock: Self::Lock) -> Result<()> {
        lock.tx.rollback().await?;
        Ok(())
    }

    async fn get_job(&self, lock: &mut Self::Lock) -> Result<Job> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(lock.job_id)
            .fetch_one(&mut *lock.tx)
            .await?;
        Ok(job)
    }

    async fn save_job(&self, lock: &mut Self::Lock, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                status = $2, progress = $3, num_input_granules = $4,
                message = $5, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.status)
        .bind(job.progress)
        .bind(job.num_input_granules)
        .bind(&job.message)
        .execute(&mut *lock.tx)
        .await?;
        Ok(())
    }

    async fn get_workflow_step(
        &self,
        lock: &mut Self::Lock,
        step_index: i32,
    ) -> Result<Option<WorkflowStep>> {
        let step = sqlx::query_as::<_, WorkflowStep>(
            "SELECT * FROM workflow_steps WHERE job_id = $1 AND step_index = $2",
        )
        .bind(lock.job_id)
        .bind(step_index)
        .fetch_optional(&mut *lock.tx)
        .await?;
        Ok(step)
    }

    async fn save_workflow_step(&self, lock: &mut Self::Lock, step: &WorkflowStep) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workflow_steps SET
                work_item_count = $3, completed_work_item_count = $4, is_complete = $5
            WHERE job_id = $1 AND step_index = $2
            "#,
        )
        .bind(step.job_id)
        .bind(step.step_index)
        .bind(step.work_item_count)
        .bind(step.completed_work_item_count)
        .bind(step.is_complete)
        .execute(&mut *lock.tx)
        .await?;
        Ok(())
    }

    async fn get_work_item(
        &self,
        lock: &mut Self::Lock,
        item_id: WorkItemId,
    ) -> Result<Option<WorkItem>> {
        let item = sqlx::query_as::<_, WorkItem>("SELECT * FROM work_items WHERE id = $1")
            .bind(item_id)
            .fetch_optional(&mut *lock.tx)
            .await?;
        Ok(item)
    }

    async fn save_work_item(&self, lock: &mut Self::Lock, item: &WorkItem) -> Result<()> {
        // The WHERE clause enforces `StaleUpdate`: a terminal row can only be
        // rewritten to the same status it already holds (a duplicate,
        // harmless re-delivery), never to a different one.
        let result = sqlx::query(
            r#"
            UPDATE work_items SET
                status = $2, scroll_id = $3, stac_catalog_location = $4,
                results = $5, output_item_sizes = $6, retry_count = $7,
                started_at = $8, duration_ms = $9, message = $10,
                message_category = $11, updated_at = now()
            WHERE id = $1
              AND (status NOT IN ('successful', 'failed', 'warning', 'canceled')
                   OR status = $2)
            "#,
        )
        .bind(item.id)
        .bind(item.status)
        .bind(&item.scroll_id)
        .bind(&item.stac_catalog_location)
        .bind(&item.results)
        .bind(&item.output_item_sizes)
        .bind(item.retry_count)
        .bind(item.started_at)
        .bind(item.duration_ms)
        .bind(&item.message)
        .bind(&item.message_category)
        .execute(&mut *lock.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::Conflict(format!(
                "stale update for work item {}",
                item.id
            )));
        }
        Ok(())
    }

    async fn insert_work_items(&self, lock: &mut Self::Lock, items: &[WorkItem]) -> Result<()> {
        for item in items {
            sqlx::query(
                r#"
                INSERT INTO work_items (
                    id, job_id, service_id, workflow_step_index, status,
                    scroll_id, stac_catalog_location, results, output_item_sizes,
                    retry_count, started_at, duration_ms, sort_index, message,
                    message_category, created_at, updated_at
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,now(),now())
                "#,
            )
            .bind(item.id)
            .bind(item.job_id)
            .bind(&item.service_id)
            .bind(item.workflow_step_index)
            .bind(item.status)
            .bind(&item.scroll_id)
            .bind(&item.stac_catalog_location)
            .bind(&item.results)
            .bind(&item.output_item_sizes)
            .bind(item.retry_count)
            .bind(item.started_at)
            .bind(item.duration_ms)
            .bind(item.sort_index)
            .bind(&item.message)
            .bind(&item.message_category)
            .execute(&mut *lock.tx)
            .await?;
        }
        Ok(())
    }

    async fn get_user_work(&self, lock: &mut Self::Lock, service_id: &str) -> Result<UserWork> {
        let row = sqlx::query_as::<_, UserWork>(
            "SELECT * FROM user_work WHERE job_id = $1 AND service_id = $2",
        )
        .bind(lock.job_id)
        .bind(service_id)
        .fetch_optional(&mut *lock.tx)
        .await?;
        Ok(row.unwrap_or_else(|| {
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
        sqlx::query(
            r#"
            INSERT INTO user_work (job_id, service_id, ready_count, running_count)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (job_id, service_id) DO UPDATE SET
                ready_count = EXCLUDED.ready_count,
                running_count = EXCLUDED.running_count
            "#,
        )
        .bind(row.job_id)
        .bind(&row.service_id)
        .bind(row.ready_count)
        .bind(row.running_count)
        .execute(&mut *lock.tx)
        .await?;
        Ok(())
    }

    async fn recompute_ready_count(&self, lock: &mut Self::Lock, service_id: &str) -> Result<i64> {
        let true_count: i64 = sqlx::query_scalar(
            r#"
            SELECT count(*) FROM work_items
            WHERE job_id = $1 AND service_id = $2 AND status = 'ready'
            "#,
        )
        .bind(lock.job_id)
        .bind(service_id)
        .fetch_one(&mut *lock.tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO user_work (job_id, service_id, ready_count, running_count)
            VALUES ($1, $2, $3, 0)
            ON CONFLICT (job_id, service_id) DO UPDATE SET ready_count = EXCLUDED.ready_count
            "#,
        )
        .bind(lock.job_id)
        .bind(service_id)
        .bind(true_count)
        .execute(&mut *lock.tx)
        .await?;

        Ok(true_count)
    }

    async fn delete_user_work(&self, lock: &mut Self::Lock, service_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM user_work WHERE job_id = $1 AND service_id = $2")
            .bind(lock.job_id)
            .bind(service_id)
            .execute(&mut *lock.tx)
            .await?;
        Ok(())
    }

    async fn insert_job_link(&self, lock: &mut Self::Lock, link: &JobLink) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_links (job_id, href, rel, media_type, title,
                                    temporal_start, temporal_end, bbox)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            "#,
        )
        .bind(link.job_id)
        .bind(&link.href)
        .bind(&link.rel)
        .bind(&link.media_type)
        .bind(&link.title)
        .bind(link.temporal_start)
        .bind(link.temporal_end)
        .bind(&link.bbox)
        .execute(&mut *lock.tx)
        .await?;
        Ok(())
    }

    async fn insert_job_message(&self, lock: &mut Self::Lock, message: &JobMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_messages (job_id, url, message, level, category)
            VALUES ($1,$2,$3,$4,$5)
            "#,
        )
        .bind(message.job_id)
        .bind(&message.url)
        .bind(&message.message)
        .bind(message.level)
        .bind(&message.category)
        .execute(&mut *lock.tx)
        .await?;
        Ok(())
    }

    async fn max_sort_index(
        &self,
        lock: &mut Self::Lock,
        step_index: i32,
        service_id: &str,
    ) -> Result<i64> {
        let max: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT max(sort_index) FROM work_items
            WHERE job_id = $1 AND workflow_step_index = $2 AND service_id = $3
            "#,
        )
        .bind(lock.job_id)
        .bind(step_index)
        .bind(service_id)
        .fetch_one(&mut *lock.tx)
        .await?;
        Ok(max.unwrap_or(-1))
    }

    async fn candidate_jobs_for_service(&self, service_id: &str, limit: i64) -> Result<Vec<JobId>> {
        let rows = sqlx::query(
            r#"
            SELECT uw.job_id AS job_id
            FROM user_work uw
            JOIN jobs j ON j.id = uw.job_id
            WHERE uw.service_id = $1
              AND uw.ready_count > 0
              AND j.status NOT IN ('successful', 'failed', 'canceled', 'complete_with_errors', 'paused')
            ORDER BY j.updated_at ASC, uw.job_id ASC
            LIMIT $2
            "#,
        )
        .bind(service_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| r.get::<JobId, _>("job_id"))
            .collect())
    }

    async fn claim_ready_work_items(
        &self,
        lock: &mut Self::Lock,
        service_id: &str,
        limit: i64,
        use_service_queues: bool,
    ) -> Result<Vec<WorkItem>> {
        let next_status: WorkItemStatus = if use_service_queues {
            WorkItemStatus::Queued
        } else {
            WorkItemStatus::Running
        };

        let items = sqlx::query_as::<_, WorkItem>(
            r#"
            WITH next_items AS (
                SELECT id FROM work_items
                WHERE job_id = $1 AND service_id = $2 AND status = 'ready'
                ORDER BY id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE work_items
            SET status = $4, started_at = now(), updated_at = now()
            WHERE id IN (SELECT id FROM next_items)
            RETURNING *
            "#,
        )
        .bind(lock.job_id)
        .bind(service_id)
        .bind(limit)
        .bind(next_status)
        .fetch_all(&mut *lock.tx)
        .await?;

        Ok(items)
    }

    async fn find_stale_running_items(
        &self,
        older_than: chrono::Duration,
    ) -> Result<Vec<WorkItem>> {
        let cutoff = Utc::now() - older_than;
        let items = sqlx::query_as::<_, WorkItem>(
            r#"
            SELECT wi.* FROM work_items wi
            JOIN jobs j ON j.id = wi.job_id
            WHERE wi.status = 'running'
              AND wi.updated_at < $1
              AND j.status NOT IN ('successful', 'failed', 'canceled', 'complete_with_errors')
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn count_items_by_status(
        &self,
        lock: &mut Self::Lock,
        service_id: &str,
        status: WorkItemStatus,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT count(*) FROM work_items
            WHERE job_id = $1 AND service_id = $2 AND status = $3
            "#,
        )
        .bind(lock.job_id)
        .bind(service_id)
        .bind(status)
        .fetch_one(&mut *lock.tx)
        .await?;
        Ok(count)
    }

    async fn items_for_step(
        &self,
        lock: &mut Self::Lock,
        step_index: i32,
    ) -> Result<Vec<WorkItem>> {
        let items = sqlx::query_as::<_, WorkItem>(
            r#"
            SELECT * FROM work_items
            WHERE job_id = $1 AND workflow_step_index = $2
            ORDER BY sort_index ASC, id ASC
            "#,
        )
        .bind(lock.job_id)
        .bind(step_index)
        .fetch_all(&mut *lock.tx)
        .await?;
        Ok(items)
    }

    async fn job_id_for_item(&self, item_id: WorkItemId) -> Result<JobId> {
        let job_id: JobId = sqlx::query_scalar("SELECT job_id FROM work_items WHERE id = $1")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::Conflict(format!("no such work item {item_id}")))?;
        Ok(job_id)
    }

    async fn job_is_async(&self, job_id: JobId) -> Result<bool> {
        let is_async: bool = sqlx::query_scalar("SELECT is_async FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::Conflict(format!("no such job {job_id}")))?;
        Ok(is_async)
    }

    async fn steps_for_job(&self, lock: &mut Self::Lock) -> Result<Vec<WorkflowStep>> {
        let steps = sqlx::query_as::<_, WorkflowStep>(
            "SELECT * FROM workflow_steps WHERE job_id = $1 ORDER BY step_index ASC",
        )
        .bind(lock.job_id)
        .fetch_all(&mut *lock.tx)
        .await?;
        Ok(steps)
    }

    async fn job_messages_for_job(&self, lock: &mut Self::Lock) -> Result<Vec<JobMessage>> {
        let messages = sqlx::query_as::<_, JobMessage>(
            "SELECT * FROM job_messages WHERE job_id = $1",
        )
        .bind(lock.job_id)
        .fetch_all(&mut *lock.tx)
        .await?;
        Ok(messages)
    }

    async fn job_links_for_job(&self, lock: &mut Self::Lock) -> Result<Vec<JobLink>> {
        let links = sqlx::query_as::<_, JobLink>("SELECT * FROM job_links WHERE job_id = $1")
            .bind(lock.job_id)
            .fetch_all(&mut *lock.tx)
            .await?;
        Ok(links)
    }
}
