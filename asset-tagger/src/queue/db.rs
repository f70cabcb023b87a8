//! Relational queue backend over the `ai_job` table.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{
    EnqueueOutcome, JobQueue, LeaseControl, LeasedTask, QueueMetrics, TaskLease, file_in_progress,
    lease_token,
};
use crate::Result;
use crate::database::models::JobStatus;
use crate::database::repositories::{FileRepository, JobRepository};
use crate::database::time::{ms_after, ms_before, now_ms};

/// Queue backed by the `ai_job` table.
///
/// Recovery after a crash needs no special handling: rows left in
/// `processing` become fetchable once their lease expires.
pub struct DbJobQueue {
    jobs: Arc<dyn JobRepository>,
    files: Arc<dyn FileRepository>,
    control: Arc<DbLeaseControl>,
    worker_id: String,
    closed: AtomicBool,
}

impl DbJobQueue {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        files: Arc<dyn FileRepository>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            control: Arc::new(DbLeaseControl { jobs: jobs.clone() }),
            jobs,
            files,
            worker_id: worker_id.into(),
            closed: AtomicBool::new(false),
        }
    }

    async fn place(&self, file_id: &str, priority: i64) -> Result<EnqueueOutcome> {
        let Some(job) = self.jobs.find_by_file(file_id).await? else {
            if self.jobs.insert_queued(file_id, priority).await? {
                return Ok(EnqueueOutcome::Inserted);
            }
            // Lost an insert race; the winner's row is already queued.
            return Ok(EnqueueOutcome::AlreadyQueued);
        };

        let now = now_ms();
        match job.job_status() {
            Some(status) if status.blocks_enqueue() => Ok(EnqueueOutcome::AlreadySettled),
            Some(JobStatus::Processing) if job.lease_until.is_some_and(|l| l > now) => {
                Ok(EnqueueOutcome::LeaseActive)
            }
            Some(JobStatus::Queued)
                if job.lease_until.is_none_or(|l| l <= now) && job.priority >= priority =>
            {
                Ok(EnqueueOutcome::AlreadyQueued)
            }
            // Backing off after a nack; the delay stands.
            Some(JobStatus::Queued) if job.lease_until.is_some_and(|l| l > now) => {
                Ok(EnqueueOutcome::AlreadyQueued)
            }
            _ => {
                self.jobs.requeue(file_id, priority).await?;
                Ok(EnqueueOutcome::Requeued)
            }
        }
    }
}

#[async_trait]
impl JobQueue for DbJobQueue {
    async fn enqueue_unique(&self, file_id: &str, priority: i64) -> Result<EnqueueOutcome> {
        if file_in_progress(self.files.as_ref(), file_id).await? {
            return Ok(EnqueueOutcome::FileInProgress);
        }

        let outcome = self.place(file_id, priority).await?;
        if outcome.is_enqueued() || outcome == EnqueueOutcome::AlreadyQueued {
            self.files.mark_pending(file_id).await?;
        }
        tracing::debug!(file_id, ?outcome, "Enqueue");
        Ok(outcome)
    }

    async fn fetch(&self, lease: Duration) -> Result<Option<LeasedTask>> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }

        let token = lease_token(&self.worker_id);
        let Some(job) = self.jobs.claim_next(&token, ms_after(lease)).await? else {
            return Ok(None);
        };

        Ok(Some(LeasedTask::new(
            TaskLease {
                job_id: job.id,
                file_id: job.file_id,
                token,
            },
            self.control.clone(),
        )))
    }

    async fn metrics(&self) -> Result<QueueMetrics> {
        self.jobs.metrics().await
    }

    async fn purge_terminal(&self, file_ids: &[String]) -> Result<u64> {
        self.jobs.purge_terminal_for(file_ids).await
    }

    async fn cleanup_terminal(&self, older_than: Duration) -> Result<u64> {
        self.jobs.cleanup_terminal(ms_before(older_than)).await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct DbLeaseControl {
    jobs: Arc<dyn JobRepository>,
}

#[async_trait]
impl LeaseControl for DbLeaseControl {
    async fn ack(&self, lease: &TaskLease) -> Result<()> {
        if !self.jobs.complete(&lease.job_id, &lease.token).await? {
            tracing::debug!(file_id = %lease.file_id, "Ack ignored: lease no longer held");
        }
        Ok(())
    }

    async fn nack(
        &self,
        lease: &TaskLease,
        delay: Duration,
        to_dlq: bool,
        reason: &str,
    ) -> Result<()> {
        let settled = if to_dlq {
            self.jobs
                .dead_letter(&lease.job_id, &lease.token, reason)
                .await?
        } else {
            self.jobs
                .release(&lease.job_id, &lease.token, ms_after(delay), reason)
                .await?
        };
        if !settled {
            tracing::debug!(file_id = %lease.file_id, "Nack ignored: lease no longer held");
        }
        Ok(())
    }

    async fn renew(&self, lease: &TaskLease, extend: Duration) -> Result<bool> {
        self.jobs
            .renew_lease(&lease.job_id, &lease.token, ms_after(extend))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{AiTaggingStatus, FileDbModel};
    use crate::database::repositories::{SqlxFileRepository, SqlxJobRepository};
    use crate::database::test_pool;

    async fn queue_with_file(file_id: &str) -> (tempfile::TempDir, DbJobQueue, Arc<SqlxFileRepository>) {
        let (dir, pool) = test_pool().await;
        let files = Arc::new(SqlxFileRepository::new(pool.clone()));
        files
            .insert_file(&FileDbModel::new(file_id, "u1"))
            .await
            .unwrap();
        let queue = DbJobQueue::new(
            Arc::new(SqlxJobRepository::new(pool)),
            files.clone(),
            "worker-a",
        );
        (dir, queue, files)
    }

    #[tokio::test]
    async fn test_enqueue_marks_file_pending_and_is_idempotent() {
        let (_dir, queue, files) = queue_with_file("f1").await;

        assert_eq!(
            queue.enqueue_unique("f1", 0).await.unwrap(),
            EnqueueOutcome::Inserted
        );
        let file = files.get_file("f1").await.unwrap();
        assert_eq!(file.tagging_status(), Some(AiTaggingStatus::Pending));
        assert!(file.ai_last_heartbeat_at.is_some());

        for _ in 0..3 {
            assert!(!queue.enqueue_unique("f1", 0).await.unwrap().is_enqueued());
        }
        let metrics = queue.metrics().await.unwrap();
        assert_eq!(metrics.queued, 1);
    }

    #[tokio::test]
    async fn test_single_owner_until_settled() {
        let (_dir, queue, _files) = queue_with_file("f1").await;
        queue.enqueue_unique("f1", 0).await.unwrap();

        let task = queue.fetch(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(task.file_id(), "f1");
        assert!(queue.fetch(Duration::from_secs(30)).await.unwrap().is_none());

        task.ack().await.unwrap();
        assert!(queue.fetch(Duration::from_secs(30)).await.unwrap().is_none());
        assert_eq!(
            queue.enqueue_unique("f1", 0).await.unwrap(),
            EnqueueOutcome::FileInProgress
        );
    }

    #[tokio::test]
    async fn test_nack_then_wait_then_fetch() {
        let (_dir, queue, _files) = queue_with_file("f1").await;
        queue.enqueue_unique("f1", 0).await.unwrap();

        let task = queue.fetch(Duration::from_secs(30)).await.unwrap().unwrap();
        task.nack(Duration::from_millis(200), false, "transient")
            .await
            .unwrap();
        assert!(queue.fetch(Duration::from_secs(30)).await.unwrap().is_none());
        assert_eq!(queue.metrics().await.unwrap().delayed, 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        let again = queue.fetch(Duration::from_secs(30)).await.unwrap();
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn test_enqueue_keeps_backoff_delay() {
        let (_dir, queue, files) = queue_with_file("f1").await;
        queue.enqueue_unique("f1", 0).await.unwrap();
        let task = queue.fetch(Duration::from_secs(30)).await.unwrap().unwrap();
        task.nack(Duration::from_secs(60), false, "transient")
            .await
            .unwrap();

        // File no longer pending, so enqueue reaches the queue itself.
        files.reset_to_none(&["f1".to_string()]).await.unwrap();
        assert_eq!(
            queue.enqueue_unique("f1", 0).await.unwrap(),
            EnqueueOutcome::AlreadyQueued
        );
        let metrics = queue.metrics().await.unwrap();
        assert_eq!(metrics.delayed, 1);
        assert_eq!(metrics.queued, 0);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let (_dir, queue, _files) = queue_with_file("f1").await;
        queue.enqueue_unique("f1", 0).await.unwrap();

        let stale = queue.fetch(Duration::from_millis(50)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let fresh = queue.fetch(Duration::from_secs(30)).await.unwrap().unwrap();

        // The original holder can no longer settle the job.
        stale.ack().await.unwrap();
        assert_eq!(queue.metrics().await.unwrap().in_flight, 1);
        fresh.ack().await.unwrap();
        assert_eq!(queue.metrics().await.unwrap().in_flight, 0);
    }

    #[tokio::test]
    async fn test_renew_only_succeeds_for_current_owner() {
        let (_dir, queue, _files) = queue_with_file("f1").await;
        queue.enqueue_unique("f1", 0).await.unwrap();

        let held = queue.fetch(Duration::from_millis(100)).await.unwrap().unwrap();
        assert!(held.renew(Duration::from_secs(30)).await.unwrap());
        // Renewed past the original expiry, so nobody else can claim it.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(queue.fetch(Duration::from_secs(30)).await.unwrap().is_none());

        assert!(held.renew(Duration::from_secs(30)).await.unwrap());
        held.ack().await.unwrap();
        assert_eq!(queue.metrics().await.unwrap().in_flight, 0);
    }

    #[tokio::test]
    async fn test_renew_fails_after_reclaim() {
        let (_dir, queue, _files) = queue_with_file("f1").await;
        queue.enqueue_unique("f1", 0).await.unwrap();

        let stale = queue.fetch(Duration::from_millis(50)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let fresh = queue.fetch(Duration::from_secs(30)).await.unwrap().unwrap();

        assert!(!stale.renew(Duration::from_secs(30)).await.unwrap());
        assert!(fresh.renew(Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_dead_letter_then_purge_allows_new_round() {
        let (_dir, queue, files) = queue_with_file("f1").await;
        queue.enqueue_unique("f1", 0).await.unwrap();
        let task = queue.fetch(Duration::from_secs(30)).await.unwrap().unwrap();
        task.nack(Duration::ZERO, true, "fatal").await.unwrap();
        assert_eq!(queue.metrics().await.unwrap().dlq, 1);

        files.reset_to_none(&["f1".to_string()]).await.unwrap();
        assert_eq!(queue.purge_terminal(&["f1".to_string()]).await.unwrap(), 1);
        assert_eq!(
            queue.enqueue_unique("f1", 0).await.unwrap(),
            EnqueueOutcome::Inserted
        );
    }

    #[tokio::test]
    async fn test_closed_queue_fetches_nothing() {
        let (_dir, queue, _files) = queue_with_file("f1").await;
        queue.enqueue_unique("f1", 0).await.unwrap();
        queue.close().await;
        assert!(queue.fetch(Duration::from_secs(30)).await.unwrap().is_none());
    }
}
