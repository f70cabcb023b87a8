//! File repository.
//!
//! Only the AI-tagging columns of `files` are written here; the rest of the
//! row belongs to the hosting service.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{
    AiTaggingStatus, CandidateFilter, FileAiInfoDbModel, FileDbModel, FileStatus,
    FileStatusCounts,
};
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Attempts after which a file stops being picked up automatically.
pub const MAX_TAGGING_TRIES: i64 = 3;

/// File repository trait.
#[async_trait]
pub trait FileRepository: Send + Sync {
    async fn insert_file(&self, file: &FileDbModel) -> Result<()>;
    async fn find_file(&self, id: &str) -> Result<Option<FileDbModel>>;

    async fn get_file(&self, id: &str) -> Result<FileDbModel> {
        self.find_file(id)
            .await?
            .ok_or_else(|| Error::not_found("File", id))
    }

    /// Enter a tagging round: status `pending`, heartbeat now.
    async fn mark_pending(&self, id: &str) -> Result<()>;
    async fn touch_heartbeat(&self, id: &str, worker_id: &str) -> Result<()>;
    async fn set_tagging_status(&self, id: &str, status: AiTaggingStatus) -> Result<()>;
    /// Status `none`, tries 0, heartbeat cleared. Returns rows changed.
    async fn reset_to_none(&self, ids: &[String]) -> Result<u64>;
    /// Status `pending`, tries 0, heartbeat cleared, so the next enqueue is not short-circuited.
    async fn rescue_exhausted(&self, ids: &[String]) -> Result<u64>;
    /// Record a failed AI attempt on a `pending` file. `exhausted` also moves it to `failed`.
    async fn record_failed_attempt(&self, id: &str, tries: i64, exhausted: bool) -> Result<()>;
    /// Mark as `ignored` where not already; returns the ids that changed.
    async fn ignore_files(&self, ids: &[String]) -> Result<Vec<String>>;
    /// `ignored → none` with tries reset; returns the ids that changed.
    async fn unignore_files(&self, ids: &[String]) -> Result<Vec<String>>;
    async fn select_candidates(&self, filter: CandidateFilter, limit: i64) -> Result<Vec<String>>;
    /// Bulk `pending → none`, used when nothing is processing.
    async fn reset_pending_to_none(&self) -> Result<u64>;
    /// `pending` files whose heartbeat (or, lacking one, `updated_at`) is older
    /// than `cutoff_ms` become `failed` with tries incremented.
    async fn fail_stale_pending(&self, cutoff_ms: i64) -> Result<u64>;
    async fn count_by_status(&self) -> Result<FileStatusCounts>;
    async fn get_ai_info(&self, file_id: &str) -> Result<Option<FileAiInfoDbModel>>;
    async fn set_lifecycle_status(&self, id: &str, status: FileStatus) -> Result<()>;
    /// Drop per-file side tables (tags, side data) and refresh affected tag counts.
    async fn purge_side_tables(&self, id: &str) -> Result<()>;
}

/// SQLx implementation of FileRepository.
pub struct SqlxFileRepository {
    pool: SqlitePool,
}

impl SqlxFileRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FileRepository for SqlxFileRepository {
    async fn insert_file(&self, file: &FileDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO files (
                id, user_id, status, nsfw, description, category_id,
                storage_provider_id, storage_type, local_file_path, local_thumb_path, format,
                ai_tagging_status, ai_tagging_tries, ai_tagging_duration, ai_http_duration,
                ai_last_heartbeat_at, ai_processing_worker_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&file.id)
        .bind(&file.user_id)
        .bind(&file.status)
        .bind(file.nsfw)
        .bind(&file.description)
        .bind(&file.category_id)
        .bind(&file.storage_provider_id)
        .bind(&file.storage_type)
        .bind(&file.local_file_path)
        .bind(&file.local_thumb_path)
        .bind(&file.format)
        .bind(&file.ai_tagging_status)
        .bind(file.ai_tagging_tries)
        .bind(file.ai_tagging_duration)
        .bind(file.ai_http_duration)
        .bind(file.ai_last_heartbeat_at)
        .bind(&file.ai_processing_worker_id)
        .bind(file.created_at)
        .bind(file.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_file(&self, id: &str) -> Result<Option<FileDbModel>> {
        let file = sqlx::query_as::<_, FileDbModel>("SELECT * FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(file)
    }

    async fn mark_pending(&self, id: &str) -> Result<()> {
        let now = now_ms();
        sqlx::query(
            "UPDATE files SET ai_tagging_status = 'pending', ai_last_heartbeat_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_heartbeat(&self, id: &str, worker_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE files SET ai_last_heartbeat_at = ?, ai_processing_worker_id = ? WHERE id = ?",
        )
        .bind(now_ms())
        .bind(worker_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_tagging_status(&self, id: &str, status: AiTaggingStatus) -> Result<()> {
        sqlx::query("UPDATE files SET ai_tagging_status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reset_to_none(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE files
            SET ai_tagging_status = 'none',
                ai_tagging_tries = 0,
                ai_last_heartbeat_at = NULL,
                updated_at = ?
            WHERE id IN (SELECT value FROM json_each(?))
            "#,
        )
        .bind(now_ms())
        .bind(serde_json::to_string(ids)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn rescue_exhausted(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE files
            SET ai_tagging_status = 'pending',
                ai_tagging_tries = 0,
                ai_last_heartbeat_at = NULL,
                updated_at = ?
            WHERE id IN (SELECT value FROM json_each(?))
            "#,
        )
        .bind(now_ms())
        .bind(serde_json::to_string(ids)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn record_failed_attempt(&self, id: &str, tries: i64, exhausted: bool) -> Result<()> {
        let now = now_ms();
        if exhausted {
            sqlx::query(
                "UPDATE files SET ai_tagging_status = 'failed', ai_tagging_tries = ?, updated_at = ? \
                 WHERE id = ? AND ai_tagging_status = 'pending'",
            )
            .bind(tries)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE files SET ai_tagging_tries = ?, updated_at = ? \
                 WHERE id = ? AND ai_tagging_status = 'pending'",
            )
            .bind(tries)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn ignore_files(&self, ids: &[String]) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE files
            SET ai_tagging_status = 'ignored', updated_at = ?
            WHERE id IN (SELECT value FROM json_each(?))
              AND ai_tagging_status != 'ignored'
            RETURNING id
            "#,
        )
        .bind(now_ms())
        .bind(serde_json::to_string(ids)?)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn unignore_files(&self, ids: &[String]) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE files
            SET ai_tagging_status = 'none',
                ai_tagging_tries = 0,
                ai_last_heartbeat_at = NULL,
                updated_at = ?
            WHERE id IN (SELECT value FROM json_each(?))
              AND ai_tagging_status = 'ignored'
            RETURNING id
            "#,
        )
        .bind(now_ms())
        .bind(serde_json::to_string(ids)?)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn select_candidates(&self, filter: CandidateFilter, limit: i64) -> Result<Vec<String>> {
        let predicate = match filter {
            CandidateFilter::Regular => {
                "ai_tagging_status IN ('none', 'failed', 'skipped') AND ai_tagging_tries < ?"
            }
            CandidateFilter::Exhausted => {
                "ai_tagging_status IN ('none', 'failed', 'skipped') AND ai_tagging_tries >= ?"
            }
            CandidateFilter::RetryableFailed => {
                "((ai_tagging_status IN ('failed', 'none') AND ai_tagging_tries >= ?) OR ai_tagging_status = 'skipped')"
            }
            CandidateFilter::Missed => {
                "ai_tagging_status IN ('none', 'failed') AND ai_tagging_tries < ?"
            }
        };
        let sql = format!(
            "SELECT id FROM files WHERE {} AND status NOT IN ('pending_deletion', 'deleted') ORDER BY created_at ASC, id ASC LIMIT ?",
            predicate
        );
        let rows: Vec<(String,)> = sqlx::query_as(&sql)
            .bind(MAX_TAGGING_TRIES)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn reset_pending_to_none(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE files
            SET ai_tagging_status = 'none', ai_last_heartbeat_at = NULL, updated_at = ?
            WHERE ai_tagging_status = 'pending'
            "#,
        )
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn fail_stale_pending(&self, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE files
            SET ai_tagging_status = 'failed',
                ai_tagging_tries = ai_tagging_tries + 1,
                ai_last_heartbeat_at = NULL,
                updated_at = ?
            WHERE ai_tagging_status = 'pending'
              AND (
                (ai_last_heartbeat_at IS NOT NULL AND ai_last_heartbeat_at < ?)
                OR (ai_last_heartbeat_at IS NULL AND updated_at < ?)
              )
            "#,
        )
        .bind(now_ms())
        .bind(cutoff_ms)
        .bind(cutoff_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_by_status(&self) -> Result<FileStatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT ai_tagging_status, COUNT(*) FROM files GROUP BY ai_tagging_status",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut counts = FileStatusCounts::default();
        for (status, count) in rows {
            counts.add(&status, count);
        }
        Ok(counts)
    }

    async fn get_ai_info(&self, file_id: &str) -> Result<Option<FileAiInfoDbModel>> {
        let info =
            sqlx::query_as::<_, FileAiInfoDbModel>("SELECT * FROM file_ai_info WHERE file_id = ?")
                .bind(file_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(info)
    }

    async fn set_lifecycle_status(&self, id: &str, status: FileStatus) -> Result<()> {
        let result = sqlx::query("UPDATE files SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("File", id));
        }
        Ok(())
    }

    async fn purge_side_tables(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let tag_ids: Vec<(i64,)> = sqlx::query_as("SELECT tag_id FROM file_tags WHERE file_id = ?")
            .bind(id)
            .fetch_all(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM file_tags WHERE file_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM file_side_data WHERE file_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let tag_ids: Vec<i64> = tag_ids.into_iter().map(|(t,)| t).collect();
        if !tag_ids.is_empty() {
            sqlx::query(
                r#"
                UPDATE tags
                SET usage_count = (SELECT COUNT(*) FROM file_tags ft WHERE ft.tag_id = tags.id),
                    updated_at = ?
                WHERE id IN (SELECT value FROM json_each(?))
                "#,
            )
            .bind(now_ms())
            .bind(serde_json::to_string(&tag_ids)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_pool;

    async fn seed(repo: &SqlxFileRepository, id: &str, status: AiTaggingStatus, tries: i64) {
        let mut file = FileDbModel::new(id, "u1");
        file.ai_tagging_status = status.as_str().to_string();
        file.ai_tagging_tries = tries;
        repo.insert_file(&file).await.unwrap();
    }

    #[tokio::test]
    async fn test_candidate_filters() {
        let (_dir, pool) = test_pool().await;
        let repo = SqlxFileRepository::new(pool);
        seed(&repo, "a", AiTaggingStatus::None, 0).await;
        seed(&repo, "b", AiTaggingStatus::Failed, 3).await;
        seed(&repo, "c", AiTaggingStatus::Skipped, 0).await;
        seed(&repo, "d", AiTaggingStatus::Done, 0).await;

        let regular = repo.select_candidates(CandidateFilter::Regular, 10).await.unwrap();
        assert_eq!(regular, vec!["a".to_string(), "c".to_string()]);

        let exhausted = repo.select_candidates(CandidateFilter::Exhausted, 10).await.unwrap();
        assert_eq!(exhausted, vec!["b".to_string()]);

        let retryable = repo
            .select_candidates(CandidateFilter::RetryableFailed, 10)
            .await
            .unwrap();
        assert_eq!(retryable, vec!["b".to_string(), "c".to_string()]);

        let missed = repo.select_candidates(CandidateFilter::Missed, 1).await.unwrap();
        assert_eq!(missed, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_ignore_reports_only_changed_rows() {
        let (_dir, pool) = test_pool().await;
        let repo = SqlxFileRepository::new(pool);
        seed(&repo, "a", AiTaggingStatus::None, 0).await;
        seed(&repo, "b", AiTaggingStatus::Ignored, 0).await;

        let changed = repo
            .ignore_files(&["a".to_string(), "b".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(changed, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_unignore_only_touches_ignored() {
        let (_dir, pool) = test_pool().await;
        let repo = SqlxFileRepository::new(pool);
        seed(&repo, "a", AiTaggingStatus::Ignored, 2).await;
        seed(&repo, "b", AiTaggingStatus::Done, 0).await;

        let changed = repo
            .unignore_files(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(changed, vec!["a".to_string()]);

        let a = repo.get_file("a").await.unwrap();
        assert_eq!(a.ai_tagging_status, "none");
        assert_eq!(a.ai_tagging_tries, 0);
        assert_eq!(repo.get_file("b").await.unwrap().ai_tagging_status, "done");
    }

    #[tokio::test]
    async fn test_fail_stale_pending_increments_tries() {
        let (_dir, pool) = test_pool().await;
        let repo = SqlxFileRepository::new(pool);
        let mut stale = FileDbModel::new("stale", "u1");
        stale.ai_tagging_status = "pending".into();
        stale.ai_tagging_tries = 1;
        stale.ai_last_heartbeat_at = Some(now_ms() - 60 * 60 * 1000);
        repo.insert_file(&stale).await.unwrap();

        let mut fresh = FileDbModel::new("fresh", "u1");
        fresh.ai_tagging_status = "pending".into();
        fresh.ai_last_heartbeat_at = Some(now_ms());
        repo.insert_file(&fresh).await.unwrap();

        let changed = repo
            .fail_stale_pending(now_ms() - 5 * 60 * 1000)
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let stale = repo.get_file("stale").await.unwrap();
        assert_eq!(stale.tagging_status(), Some(AiTaggingStatus::Failed));
        assert_eq!(stale.ai_tagging_tries, 2);
        assert!(stale.ai_last_heartbeat_at.is_none());
        assert_eq!(
            repo.get_file("fresh").await.unwrap().tagging_status(),
            Some(AiTaggingStatus::Pending)
        );
    }

    #[tokio::test]
    async fn test_failed_attempt_only_touches_pending_files() {
        let (_dir, pool) = test_pool().await;
        let repo = SqlxFileRepository::new(pool);
        seed(&repo, "tagged", AiTaggingStatus::Done, 0).await;
        seed(&repo, "working", AiTaggingStatus::Pending, 2).await;

        repo.record_failed_attempt("tagged", 3, true).await.unwrap();
        let tagged = repo.get_file("tagged").await.unwrap();
        assert_eq!(tagged.tagging_status(), Some(AiTaggingStatus::Done));
        assert_eq!(tagged.ai_tagging_tries, 0);

        repo.record_failed_attempt("working", 3, true).await.unwrap();
        let working = repo.get_file("working").await.unwrap();
        assert_eq!(working.tagging_status(), Some(AiTaggingStatus::Failed));
        assert_eq!(working.ai_tagging_tries, 3);
    }

    #[tokio::test]
    async fn test_get_missing_file_is_not_found() {
        let (_dir, pool) = test_pool().await;
        let repo = SqlxFileRepository::new(pool);
        let err = repo.get_file("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
