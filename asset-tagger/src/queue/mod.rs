//! Durable job queue with leased dequeue.
//!
//! A queue holds at most one job per file. [`JobQueue::fetch`] hands out a
//! [`LeasedTask`] that is exclusively owned until its lease expires; the owner
//! finishes it with [`LeasedTask::ack`] or [`LeasedTask::nack`]. Expired leases
//! and elapsed retry delays make a job fetchable again.
//!
//! Backends:
//! - [`DbJobQueue`]: the `ai_job` table, survives restarts.
//! - [`MemoryJobQueue`]: in-process lists and sorted maps with a reaper task.
//! - `RedisJobQueue` (feature `redis-backend`): the same layout in Redis.

mod db;
mod memory;
#[cfg(feature = "redis-backend")]
mod redis;

pub use db::DbJobQueue;
pub use memory::MemoryJobQueue;
#[cfg(feature = "redis-backend")]
pub use redis::RedisJobQueue;

pub use crate::database::models::QueueMetrics;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::QueueBackendKind;
use crate::database::DbPool;
use crate::database::models::AiTaggingStatus;
use crate::database::repositories::{FileRepository, SqlxJobRepository};
use crate::database::time::{duration_ms, now_ms};
use crate::{Error, Result};

/// Default lease handed out by the task fetcher.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// A pending file whose heartbeat is younger than this is treated as being
/// processed elsewhere, and enqueueing it is a no-op.
pub const ACTIVE_HEARTBEAT_WINDOW: Duration = Duration::from_secs(120);

/// Result of [`JobQueue::enqueue_unique`]. Every variant is a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new job was created.
    Inserted,
    /// An existing job was put back to `queued`.
    Requeued,
    /// The file is pending with a fresh heartbeat.
    FileInProgress,
    /// The job already finished (`done`, `ignored` or `skipped`).
    AlreadySettled,
    /// The job is leased and the lease has not expired.
    LeaseActive,
    /// The job is already waiting in the queue.
    AlreadyQueued,
}

impl EnqueueOutcome {
    /// True when this call put the file in line for processing.
    pub fn is_enqueued(&self) -> bool {
        matches!(self, Self::Inserted | Self::Requeued)
    }
}

/// Identity of one lease: the job, its file and the token the lease was granted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLease {
    pub job_id: String,
    pub file_id: String,
    pub token: String,
}

/// Backend half of a lease: settles the job a [`TaskLease`] refers to.
#[async_trait]
pub trait LeaseControl: Send + Sync {
    async fn ack(&self, lease: &TaskLease) -> Result<()>;
    async fn nack(
        &self,
        lease: &TaskLease,
        delay: Duration,
        to_dlq: bool,
        reason: &str,
    ) -> Result<()>;
    /// Push the lease out to `now + extend` if `lease` still owns the job.
    /// Returns false once another worker has reclaimed it or it was settled.
    async fn renew(&self, lease: &TaskLease, extend: Duration) -> Result<bool>;
}

/// A fetched job. Consumed by exactly one of `ack` / `nack`.
pub struct LeasedTask {
    lease: TaskLease,
    control: Arc<dyn LeaseControl>,
}

impl LeasedTask {
    pub fn new(lease: TaskLease, control: Arc<dyn LeaseControl>) -> Self {
        Self { lease, control }
    }

    pub fn file_id(&self) -> &str {
        &self.lease.file_id
    }

    pub fn job_id(&self) -> &str {
        &self.lease.job_id
    }

    pub fn lease(&self) -> &TaskLease {
        &self.lease
    }

    /// Extend the lease; false means this worker no longer owns the job and
    /// must not write to its file.
    pub async fn renew(&self, extend: Duration) -> Result<bool> {
        self.control.renew(&self.lease, extend).await
    }

    /// Mark the job `done`.
    pub async fn ack(self) -> Result<()> {
        self.control.ack(&self.lease).await
    }

    /// Give the job back. `to_dlq` dead-letters it; otherwise it becomes
    /// fetchable again after `delay` with its try counter incremented.
    pub async fn nack(self, delay: Duration, to_dlq: bool, reason: &str) -> Result<()> {
        self.control.nack(&self.lease, delay, to_dlq, reason).await
    }
}

impl std::fmt::Debug for LeasedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedTask")
            .field("job_id", &self.lease.job_id)
            .field("file_id", &self.lease.file_id)
            .finish()
    }
}

/// Job queue contract shared by every backend.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Idempotently queue `file_id`. Higher `priority` is fetched first.
    async fn enqueue_unique(&self, file_id: &str, priority: i64) -> Result<EnqueueOutcome>;
    /// Lease the next eligible job for `lease`, or `None` when nothing is ready.
    async fn fetch(&self, lease: Duration) -> Result<Option<LeasedTask>>;
    async fn metrics(&self) -> Result<QueueMetrics>;
    /// Forget finished jobs for these files so the next enqueue starts a new round.
    async fn purge_terminal(&self, file_ids: &[String]) -> Result<u64>;
    /// Drop finished jobs last touched more than `older_than` ago.
    async fn cleanup_terminal(&self, older_than: Duration) -> Result<u64>;
    /// Stop background work. Further fetches return `None`.
    async fn close(&self);
}

/// Token recorded as `lease_by`: the worker id plus a per-lease suffix, so a
/// worker that lost and re-acquired a job cannot settle the stale lease.
pub(crate) fn lease_token(worker_id: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}:{}", worker_id, &suffix[..12])
}

/// Enqueue rule 1: is somebody actively working on this file right now?
pub(crate) async fn file_in_progress(files: &dyn FileRepository, file_id: &str) -> Result<bool> {
    let Some(file) = files.find_file(file_id).await? else {
        return Ok(false);
    };
    Ok(file.tagging_status() == Some(AiTaggingStatus::Pending)
        && file.has_fresh_heartbeat(now_ms(), duration_ms(ACTIVE_HEARTBEAT_WINDOW)))
}

/// Construct the configured backend.
pub async fn build_queue(
    kind: QueueBackendKind,
    pool: DbPool,
    files: Arc<dyn FileRepository>,
    worker_id: &str,
    redis_url: Option<&str>,
) -> Result<Arc<dyn JobQueue>> {
    match kind {
        QueueBackendKind::Db => Ok(Arc::new(DbJobQueue::new(
            Arc::new(SqlxJobRepository::new(pool)),
            files,
            worker_id,
        ))),
        QueueBackendKind::Memory => Ok(MemoryJobQueue::start(files, worker_id)),
        #[cfg(feature = "redis-backend")]
        QueueBackendKind::Redis => {
            let url = redis_url
                .ok_or_else(|| Error::config("REDIS_URL is required for the redis queue backend"))?;
            let queue = RedisJobQueue::connect(url, files, worker_id).await?;
            Ok(queue)
        }
        #[cfg(not(feature = "redis-backend"))]
        QueueBackendKind::Redis => {
            let _ = redis_url;
            Err(Error::config(
                "redis queue backend requested but the `redis-backend` feature is not enabled",
            ))
        }
    }
}
