//! Queue job repository (`ai_job` table).
//!
//! Claims use an optimistic compare-and-set: a candidate is selected, then
//! updated with the same eligibility predicate in the `WHERE` clause. Zero
//! affected rows means another worker won the race.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{AiJobDbModel, JobStatus, QueueMetrics};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::Result;

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn find_by_file(&self, file_id: &str) -> Result<Option<AiJobDbModel>>;
    /// Insert a `queued` row; returns false when a row for the file already exists.
    async fn insert_queued(&self, file_id: &str, priority: i64) -> Result<bool>;
    /// Back to `queued` with the lease cleared. Keeps the higher of the two priorities.
    async fn requeue(&self, file_id: &str, priority: i64) -> Result<u64>;
    /// Claim the next eligible job for `lease_by` until `lease_until`.
    async fn claim_next(&self, lease_by: &str, lease_until: i64) -> Result<Option<AiJobDbModel>>;
    /// `processing → done`, guarded by the lease token.
    async fn complete(&self, job_id: &str, lease_by: &str) -> Result<bool>;
    /// Move `lease_until` forward while `lease_by` still holds the job.
    async fn renew_lease(&self, job_id: &str, lease_by: &str, lease_until: i64) -> Result<bool>;
    /// `processing → queued` with `tries + 1`, ready again at `ready_at`.
    async fn release(
        &self,
        job_id: &str,
        lease_by: &str,
        ready_at: i64,
        error: &str,
    ) -> Result<bool>;
    /// `processing → failed` with `tries + 1`.
    async fn dead_letter(&self, job_id: &str, lease_by: &str, error: &str) -> Result<bool>;
    async fn metrics(&self) -> Result<QueueMetrics>;
    /// Delete terminal rows for the given files so they can be enqueued afresh.
    async fn purge_terminal_for(&self, file_ids: &[String]) -> Result<u64>;
    /// Delete terminal rows last updated before `cutoff_ms`.
    async fn cleanup_terminal(&self, cutoff_ms: i64) -> Result<u64>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const ELIGIBLE: &str = "((status = 'queued' AND (lease_until IS NULL OR lease_until <= ?)) \
     OR (status = 'processing' AND lease_until < ?))";

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn find_by_file(&self, file_id: &str) -> Result<Option<AiJobDbModel>> {
        let job = sqlx::query_as::<_, AiJobDbModel>("SELECT * FROM ai_job WHERE file_id = ?")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn insert_queued(&self, file_id: &str, priority: i64) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            INSERT INTO ai_job (id, file_id, status, tries, priority, created_at, updated_at)
            VALUES (?, ?, 'queued', 0, ?, ?, ?)
            ON CONFLICT(file_id) DO NOTHING
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(file_id)
        .bind(priority)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn requeue(&self, file_id: &str, priority: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE ai_job
            SET status = 'queued',
                lease_until = NULL,
                lease_by = NULL,
                priority = MAX(priority, ?),
                updated_at = ?
            WHERE file_id = ?
            "#,
        )
        .bind(priority)
        .bind(now_ms())
        .bind(file_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn claim_next(&self, lease_by: &str, lease_until: i64) -> Result<Option<AiJobDbModel>> {
        let now = now_ms();
        let select = format!(
            "SELECT * FROM ai_job WHERE {} ORDER BY priority DESC, created_at ASC LIMIT 1",
            ELIGIBLE
        );
        let Some(mut job) = sqlx::query_as::<_, AiJobDbModel>(&select)
            .bind(now)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let update = format!(
            "UPDATE ai_job SET status = 'processing', lease_until = ?, lease_by = ?, updated_at = ? \
             WHERE id = ? AND {}",
            ELIGIBLE
        );
        let claimed = retry_on_sqlite_busy("claim_job", || async {
            let result = sqlx::query(&update)
                .bind(lease_until)
                .bind(lease_by)
                .bind(now)
                .bind(&job.id)
                .bind(now)
                .bind(now)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if claimed == 0 {
            return Ok(None);
        }

        job.status = JobStatus::Processing.as_str().to_string();
        job.lease_until = Some(lease_until);
        job.lease_by = Some(lease_by.to_string());
        job.updated_at = now;
        Ok(Some(job))
    }

    async fn complete(&self, job_id: &str, lease_by: &str) -> Result<bool> {
        retry_on_sqlite_busy("complete_job", || async {
            let result = sqlx::query(
                r#"
                UPDATE ai_job
                SET status = 'done', lease_until = NULL, last_error = NULL, updated_at = ?
                WHERE id = ? AND status = 'processing' AND lease_by = ?
                "#,
            )
            .bind(now_ms())
            .bind(job_id)
            .bind(lease_by)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn renew_lease(&self, job_id: &str, lease_by: &str, lease_until: i64) -> Result<bool> {
        retry_on_sqlite_busy("renew_job", || async {
            let result = sqlx::query(
                r#"
                UPDATE ai_job
                SET lease_until = ?, updated_at = ?
                WHERE id = ? AND status = 'processing' AND lease_by = ?
                "#,
            )
            .bind(lease_until)
            .bind(now_ms())
            .bind(job_id)
            .bind(lease_by)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn release(
        &self,
        job_id: &str,
        lease_by: &str,
        ready_at: i64,
        error: &str,
    ) -> Result<bool> {
        retry_on_sqlite_busy("release_job", || async {
            let result = sqlx::query(
                r#"
                UPDATE ai_job
                SET status = 'queued',
                    tries = tries + 1,
                    last_error = ?,
                    lease_until = ?,
                    lease_by = NULL,
                    updated_at = ?
                WHERE id = ? AND status = 'processing' AND lease_by = ?
                "#,
            )
            .bind(error)
            .bind(ready_at)
            .bind(now_ms())
            .bind(job_id)
            .bind(lease_by)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn dead_letter(&self, job_id: &str, lease_by: &str, error: &str) -> Result<bool> {
        retry_on_sqlite_busy("dead_letter_job", || async {
            let result = sqlx::query(
                r#"
                UPDATE ai_job
                SET status = 'failed',
                    tries = tries + 1,
                    last_error = ?,
                    lease_until = NULL,
                    updated_at = ?
                WHERE id = ? AND status = 'processing' AND lease_by = ?
                "#,
            )
            .bind(error)
            .bind(now_ms())
            .bind(job_id)
            .bind(lease_by)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn metrics(&self) -> Result<QueueMetrics> {
        let now = now_ms();
        let (queued, in_flight, delayed, dlq): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'queued' AND (lease_until IS NULL OR lease_until <= ?) THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'queued' AND lease_until > ? THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
            FROM ai_job
            "#,
        )
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(QueueMetrics {
            queued,
            in_flight,
            delayed,
            dlq,
        })
    }

    async fn purge_terminal_for(&self, file_ids: &[String]) -> Result<u64> {
        if file_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            DELETE FROM ai_job
            WHERE file_id IN (SELECT value FROM json_each(?))
              AND status IN ('done', 'failed', 'ignored', 'skipped')
            "#,
        )
        .bind(serde_json::to_string(file_ids)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn cleanup_terminal(&self, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM ai_job
            WHERE status IN ('done', 'failed', 'ignored', 'skipped')
              AND updated_at < ?
            "#,
        )
        .bind(cutoff_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_pool;

    #[tokio::test]
    async fn test_insert_is_unique_per_file() {
        let (_dir, pool) = test_pool().await;
        let repo = SqlxJobRepository::new(pool.clone());
        assert!(repo.insert_queued("f1", 0).await.unwrap());
        assert!(!repo.insert_queued("f1", 5).await.unwrap());

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ai_job WHERE file_id = 'f1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority() {
        let (_dir, pool) = test_pool().await;
        let repo = SqlxJobRepository::new(pool);
        repo.insert_queued("low", 0).await.unwrap();
        repo.insert_queued("high", 10).await.unwrap();

        let lease = now_ms() + 30_000;
        let first = repo.claim_next("w1", lease).await.unwrap().unwrap();
        assert_eq!(first.file_id, "high");
        assert_eq!(first.job_status(), Some(JobStatus::Processing));
        let second = repo.claim_next("w1", lease).await.unwrap().unwrap();
        assert_eq!(second.file_id, "low");
        assert!(repo.claim_next("w1", lease).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lease_token_guards_completion() {
        let (_dir, pool) = test_pool().await;
        let repo = SqlxJobRepository::new(pool);
        repo.insert_queued("f1", 0).await.unwrap();
        let job = repo
            .claim_next("w1", now_ms() + 30_000)
            .await
            .unwrap()
            .unwrap();

        assert!(!repo.complete(&job.id, "someone-else").await.unwrap());
        assert!(repo.complete(&job.id, "w1").await.unwrap());
        let stored = repo.find_by_file("f1").await.unwrap().unwrap();
        assert_eq!(stored.job_status(), Some(JobStatus::Done));
    }

    #[tokio::test]
    async fn test_release_delays_and_counts() {
        let (_dir, pool) = test_pool().await;
        let repo = SqlxJobRepository::new(pool);
        repo.insert_queued("f1", 0).await.unwrap();
        let job = repo
            .claim_next("w1", now_ms() + 30_000)
            .await
            .unwrap()
            .unwrap();
        assert!(
            repo.release(&job.id, "w1", now_ms() + 60_000, "boom")
                .await
                .unwrap()
        );

        let metrics = repo.metrics().await.unwrap();
        assert_eq!(metrics.delayed, 1);
        assert_eq!(metrics.queued, 0);
        assert!(repo.claim_next("w2", now_ms() + 30_000).await.unwrap().is_none());

        let stored = repo.find_by_file("f1").await.unwrap().unwrap();
        assert_eq!(stored.tries, 1);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_purge_only_touches_terminal_rows() {
        let (_dir, pool) = test_pool().await;
        let repo = SqlxJobRepository::new(pool);
        repo.insert_queued("done", 0).await.unwrap();
        let job = repo
            .claim_next("w1", now_ms() + 30_000)
            .await
            .unwrap()
            .unwrap();
        repo.complete(&job.id, "w1").await.unwrap();
        repo.insert_queued("queued", 0).await.unwrap();

        let purged = repo
            .purge_terminal_for(&[job.file_id.clone(), "queued".to_string()])
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(repo.find_by_file(&job.file_id).await.unwrap().is_none());
        assert!(repo.find_by_file("queued").await.unwrap().is_some());
    }
}
