use anyhow::{Context, Result};
use std::env;

/// Runtime configuration loaded from the environment.
///
/// Mirrors the tunables a service fleet and orchestration core agree on:
/// retry limits, error tolerance, queue batching, and the reaper's scan
/// cadence.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,

    pub cmr_max_page_size: i64,
    pub max_errors_for_job: i64,
    pub max_percent_errors_for_job: f64,
    pub work_item_retry_limit: i32,
    pub aggregate_stac_catalog_max_page_size: usize,
    pub large_work_item_update_queue_max_batch_size: usize,
    pub work_item_update_queue_processor_delay_after_error_sec: u64,
    pub use_service_queues: bool,

    pub reaper_scan_interval_sec: u64,
    pub reaper_timeout_ceiling_sec: u64,

    pub artifact_bucket_root: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let port = env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .context("PORT must be a valid u16")?;

        let cmr_max_page_size = env::var("CMR_MAX_PAGE_SIZE")
            .unwrap_or_else(|_| "2000".to_string())
            .parse()
            .context("CMR_MAX_PAGE_SIZE must be an integer")?;

        let max_errors_for_job = env::var("MAX_ERRORS_FOR_JOB")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .context("MAX_ERRORS_FOR_JOB must be an integer")?;

        let max_percent_errors_for_job = env::var("MAX_PERCENT_ERRORS_FOR_JOB")
            .unwrap_or_else(|_| "10.0".to_string())
            .parse()
            .context("MAX_PERCENT_ERRORS_FOR_JOB must be a float")?;

        let work_item_retry_limit = env::var("WORK_ITEM_RETRY_LIMIT")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .context("WORK_ITEM_RETRY_LIMIT must be an integer")?;

        let aggregate_stac_catalog_max_page_size = env::var("AGGREGATE_STAC_CATALOG_MAX_PAGE_SIZE")
            .unwrap_or_else(|_| "2000".to_string())
            .parse()
            .context("AGGREGATE_STAC_CATALOG_MAX_PAGE_SIZE must be an integer")?;

        let large_work_item_update_queue_max_batch_size =
            env::var("LARGE_WORK_ITEM_UPDATE_QUEUE_MAX_BATCH_SIZE")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .context("LARGE_WORK_ITEM_UPDATE_QUEUE_MAX_BATCH_SIZE must be an integer")?;

        let work_item_update_queue_processor_delay_after_error_sec =
            env::var("WORK_ITEM_UPDATE_QUEUE_PROCESSOR_DELAY_AFTER_ERROR_SEC")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("WORK_ITEM_UPDATE_QUEUE_PROCESSOR_DELAY_AFTER_ERROR_SEC must be an integer")?;

        let use_service_queues = env::var("USE_SERVICE_QUEUES")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .context("USE_SERVICE_QUEUES must be a bool")?;

        let reaper_scan_interval_sec = env::var("REAPER_SCAN_INTERVAL_SEC")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .context("REAPER_SCAN_INTERVAL_SEC must be an integer")?;

        let reaper_timeout_ceiling_sec = env::var("REAPER_TIMEOUT_CEILING_SEC")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()
            .context("REAPER_TIMEOUT_CEILING_SEC must be an integer")?;

        let artifact_bucket_root = env::var("ARTIFACT_BUCKET_ROOT")
            .unwrap_or_else(|_| "/tmp/harmony-artifacts".to_string());

        Ok(Self {
            database_url,
            port,
            cmr_max_page_size,
            max_errors_for_job,
            max_percent_errors_for_job,
            work_item_retry_limit,
            aggregate_stac_catalog_max_page_size,
            large_work_item_update_queue_max_batch_size,
            work_item_update_queue_processor_delay_after_error_sec,
            use_service_queues,
            reaper_scan_interval_sec,
            reaper_timeout_ceiling_sec,
            artifact_bucket_root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_fails_without_database_url() {
        env::remove_var("DATABASE_URL");
        assert!(Config::from_env().is_err());
    }
}
