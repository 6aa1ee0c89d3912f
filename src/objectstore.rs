//! Object storage as an injected collaborator rather than a concrete SDK
//! client, the way the teacher treats `BaseWebScraper`/`BaseAI` in
//! `kernel::server_kernel::ServerKernel` as trait objects swapped in at
//! composition time. Generic object storage is explicitly out of scope as
//! a *system* (spec.md §1 Non-goals); this trait is the seam a real S3/GCS
//! driver plugs into, with a filesystem implementation for local runs and
//! tests.
//!
//! Layout, per spec.md §6:
//! - `<root>/<jobID>/<workItemID>/outputs/` — per-item outputs.
//! - `<root>/<jobID>/aggregate-<workItemID>/outputs/` — aggregation inputs.
//! - `<root>/<jobID>/<workItemID>/logs.json` — logs.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::{OrchestratorError, Result};
use crate::model::{JobId, WorkItemId};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    /// Keys with the given prefix, in lexical order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    /// Object size in bytes without fetching the body, used by the update
    /// processor to resolve `outputItemSizes` when a service does not
    /// report them inline (spec.md §4.4 preprocessing).
    async fn size(&self, key: &str) -> Result<u64>;
    fn url_for(&self, key: &str) -> String;
}

/// Per-item staging prefix the scheduler appends to a step's operation so
/// each claimed work item writes to a unique path (spec.md §4.3).
pub fn staging_prefix(job_id: JobId, work_item_id: WorkItemId) -> String {
    format!("{job_id}/{work_item_id}/")
}

pub fn aggregate_prefix(job_id: JobId, work_item_id: WorkItemId) -> String {
    format!("{job_id}/aggregate-{work_item_id}/outputs/")
}

pub fn logs_key(job_id: JobId, work_item_id: WorkItemId) -> String {
    format!("{job_id}/{work_item_id}/logs.json")
}

/// Filesystem-backed `ObjectStore` rooted at a configured directory.
/// Write-once in practice: callers never overwrite an existing staging
/// prefix, matching spec.md §5's "readers assume immutability".
#[derive(Clone)]
pub struct FilesystemObjectStore {
    root: PathBuf,
}

impl FilesystemObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl ObjectStore for FilesystemObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| OrchestratorError::Data(format!("create_dir_all {key}: {e}")))?;
        }
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| OrchestratorError::Data(format!("write {key}: {e}")))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.path_for(key))
            .await
            .map_err(|e| OrchestratorError::Data(format!("read {key}: {e}")))
    }

    async fn size(&self, key: &str) -> Result<u64> {
        let meta = tokio::fs::metadata(self.path_for(key))
            .await
            .map_err(|e| OrchestratorError::Data(format!("stat {key}: {e}")))?;
        Ok(meta.len())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.path_for(prefix);
        let mut entries = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(OrchestratorError::Data(format!("list {prefix}: {e}"))),
        };
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| OrchestratorError::Data(format!("list {prefix}: {e}")))?
        {
            if let Ok(relative) = entry.path().strip_prefix(&self.root) {
                entries.push(relative.to_string_lossy().replace(Path::MAIN_SEPARATOR, "/"));
            }
        }
        entries.sort();
        Ok(entries)
    }

    fn url_for(&self, key: &str) -> String {
        format!("file://{}", self.path_for(key).display())
    }
}
