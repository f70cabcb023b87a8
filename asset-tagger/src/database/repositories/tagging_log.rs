//! Tagging audit log repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{NewTaggingLog, TaggingLogDbModel};
use crate::database::time::now_ms;
use crate::Result;

/// Tagging log repository trait.
#[async_trait]
pub trait TaggingLogRepository: Send + Sync {
    /// Append one row; returns its id.
    async fn append(&self, entry: &NewTaggingLog) -> Result<i64>;
    /// Newest first, optionally restricted to one file.
    async fn list(
        &self,
        file_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TaggingLogDbModel>>;
    async fn count(&self, file_id: Option<&str>) -> Result<i64>;
}

/// SQLx implementation of TaggingLogRepository.
pub struct SqlxTaggingLogRepository {
    pool: SqlitePool,
}

impl SqlxTaggingLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaggingLogRepository for SqlxTaggingLogRepository {
    async fn append(&self, entry: &NewTaggingLog) -> Result<i64> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            INSERT INTO file_tagging_log
                (file_id, status, action, type, data, operator_id, duration, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.file_id)
        .bind(&entry.status)
        .bind(entry.action.as_str())
        .bind(&entry.event_type)
        .bind(serde_json::to_string(&entry.data)?)
        .bind(&entry.operator_id)
        .bind(entry.duration_ms)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn list(
        &self,
        file_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TaggingLogDbModel>> {
        let rows = sqlx::query_as::<_, TaggingLogDbModel>(
            r#"
            SELECT * FROM file_tagging_log
            WHERE (? IS NULL OR file_id = ?)
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(file_id)
        .bind(file_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn count(&self, file_id: Option<&str>) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM file_tagging_log WHERE (? IS NULL OR file_id = ?)",
        )
        .bind(file_id)
        .bind(file_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
