//! Transactional operations for persisting AI results.
//!
//! These operate within an existing transaction and do NOT commit.
//! The caller is responsible for committing or rolling back.

use sqlx::SqliteConnection;

use crate::database::models::{CATEGORY_SOURCE_AI, FileAiInfoDbModel, FileDbModel, FileStatus, TagSource};
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Outcome of linking a file to a category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryLink {
    pub category_id: String,
    /// The file was not in this category before.
    pub changed: bool,
    /// A new `ai_suggestion` category was created.
    pub created: bool,
}

/// Transactional operations for AI results.
pub struct AiResultTxOps;

impl AiResultTxOps {
    pub async fn load_file(tx: &mut SqliteConnection, file_id: &str) -> Result<FileDbModel> {
        sqlx::query_as::<_, FileDbModel>("SELECT * FROM files WHERE id = ?")
            .bind(file_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::not_found("File", file_id))
    }

    /// Insert or fully overwrite the AI row for `info.file_id`.
    pub async fn upsert_ai_info(tx: &mut SqliteConnection, info: &FileAiInfoDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO file_ai_info (
                file_id, description, search_content, semantic_keywords, tags,
                dominant_color, color_palette, objects_count, composition, dimensions, resolution,
                is_nsfw, nsfw_score, nsfw_categories, nsfw_evaluation, nsfw_reason,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_id) DO UPDATE SET
                description = excluded.description,
                search_content = excluded.search_content,
                semantic_keywords = excluded.semantic_keywords,
                tags = excluded.tags,
                dominant_color = excluded.dominant_color,
                color_palette = excluded.color_palette,
                objects_count = excluded.objects_count,
                composition = excluded.composition,
                dimensions = excluded.dimensions,
                resolution = excluded.resolution,
                is_nsfw = excluded.is_nsfw,
                nsfw_score = excluded.nsfw_score,
                nsfw_categories = excluded.nsfw_categories,
                nsfw_evaluation = excluded.nsfw_evaluation,
                nsfw_reason = excluded.nsfw_reason,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&info.file_id)
        .bind(&info.description)
        .bind(&info.search_content)
        .bind(&info.semantic_keywords)
        .bind(&info.tags)
        .bind(&info.dominant_color)
        .bind(&info.color_palette)
        .bind(info.objects_count)
        .bind(&info.composition)
        .bind(&info.dimensions)
        .bind(&info.resolution)
        .bind(info.is_nsfw)
        .bind(info.nsfw_score)
        .bind(&info.nsfw_categories)
        .bind(&info.nsfw_evaluation)
        .bind(&info.nsfw_reason)
        .bind(info.created_at)
        .bind(info.updated_at)
        .execute(&mut *tx)
        .await?;
        Ok(())
    }

    pub async fn set_description(
        tx: &mut SqliteConnection,
        file_id: &str,
        description: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE files SET description = ?, updated_at = ? WHERE id = ?")
            .bind(description)
            .bind(now_ms())
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        Ok(())
    }

    /// Flag the file as NSFW and move it to `status`.
    pub async fn mark_nsfw(
        tx: &mut SqliteConnection,
        file_id: &str,
        status: FileStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE files SET status = ?, nsfw = 1, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_ms())
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        Ok(())
    }

    /// Point the file at the owner's category called `name`, creating an
    /// `ai_suggestion` category when the owner has none by that name.
    pub async fn link_category(
        tx: &mut SqliteConnection,
        file: &FileDbModel,
        name: &str,
    ) -> Result<CategoryLink> {
        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM categories WHERE user_id = ? AND name = ? COLLATE NOCASE LIMIT 1",
        )
        .bind(&file.user_id)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;

        let (category_id, created) = match existing {
            Some((id,)) => (id, false),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                let now = now_ms();
                sqlx::query(
                    r#"
                    INSERT INTO categories (id, user_id, name, source, file_count, created_at, updated_at)
                    VALUES (?, ?, ?, ?, 0, ?, ?)
                    "#,
                )
                .bind(&id)
                .bind(&file.user_id)
                .bind(name)
                .bind(CATEGORY_SOURCE_AI)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                (id, true)
            }
        };

        let changed = file.category_id.as_deref() != Some(category_id.as_str());
        if changed {
            sqlx::query("UPDATE files SET category_id = ?, updated_at = ? WHERE id = ?")
                .bind(&category_id)
                .bind(now_ms())
                .bind(&file.id)
                .execute(&mut *tx)
                .await?;
        }

        Ok(CategoryLink {
            category_id,
            changed,
            created,
        })
    }

    /// Count one more file in `category_id`. Runs outside the result transaction.
    pub async fn bump_category_count(conn: &mut SqliteConnection, category_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE categories SET file_count = file_count + 1, updated_at = ? WHERE id = ?",
        )
        .bind(now_ms())
        .bind(category_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Make the model's tags for `file_id` exactly `names`.
    ///
    /// Relations a person added are kept; their marker drops or gains the
    /// `ai` origin. Returns the ids of tags whose relation count may have changed.
    pub async fn replace_ai_tags(
        tx: &mut SqliteConnection,
        file_id: &str,
        names: &[String],
    ) -> Result<Vec<i64>> {
        let now = now_ms();
        let current: Vec<(i64, String, String)> = sqlx::query_as(
            r#"
            SELECT t.id, t.name, ft.source
            FROM file_tags ft JOIN tags t ON t.id = ft.tag_id
            WHERE ft.file_id = ?
            "#,
        )
        .bind(file_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut touched = Vec::new();

        for (tag_id, name, source) in &current {
            if names.iter().any(|n| n == name) {
                continue;
            }
            match TagSource::parse(source) {
                Some(TagSource::Ai) | None => {
                    sqlx::query("DELETE FROM file_tags WHERE file_id = ? AND tag_id = ?")
                        .bind(file_id)
                        .bind(tag_id)
                        .execute(&mut *tx)
                        .await?;
                    touched.push(*tag_id);
                }
                Some(TagSource::UserAndAi) => {
                    sqlx::query("UPDATE file_tags SET source = ? WHERE file_id = ? AND tag_id = ?")
                        .bind(TagSource::User.as_str())
                        .bind(file_id)
                        .bind(tag_id)
                        .execute(&mut *tx)
                        .await?;
                }
                Some(TagSource::User) => {}
            }
        }

        for name in names {
            let existing = current.iter().find(|(_, n, _)| n == name);
            match existing {
                Some((tag_id, _, source)) => {
                    let merged = TagSource::parse(source).unwrap_or(TagSource::Ai).with_ai();
                    if merged.as_str() != source {
                        sqlx::query(
                            "UPDATE file_tags SET source = ? WHERE file_id = ? AND tag_id = ?",
                        )
                        .bind(merged.as_str())
                        .bind(file_id)
                        .bind(tag_id)
                        .execute(&mut *tx)
                        .await?;
                    }
                }
                None => {
                    sqlx::query(
                        r#"
                        INSERT INTO tags (name, usage_count, created_at, updated_at)
                        VALUES (?, 0, ?, ?)
                        ON CONFLICT(name) DO NOTHING
                        "#,
                    )
                    .bind(name)
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;

                    let (tag_id,): (i64,) = sqlx::query_as("SELECT id FROM tags WHERE name = ?")
                        .bind(name)
                        .fetch_optional(&mut *tx)
                        .await?
                        .ok_or_else(|| Error::not_found("Tag", name.as_str()))?;

                    sqlx::query(
                        "INSERT INTO file_tags (file_id, tag_id, source, created_at) VALUES (?, ?, ?, ?)",
                    )
                    .bind(file_id)
                    .bind(tag_id)
                    .bind(TagSource::Ai.as_str())
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    touched.push(tag_id);
                }
            }
        }

        Ok(touched)
    }

    /// Set `usage_count` of each tag to its relation count.
    pub async fn recompute_tag_usage(tx: &mut SqliteConnection, tag_ids: &[i64]) -> Result<()> {
        if tag_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE tags
            SET usage_count = (SELECT COUNT(*) FROM file_tags ft WHERE ft.tag_id = tags.id),
                updated_at = ?
            WHERE id IN (SELECT value FROM json_each(?))
            "#,
        )
        .bind(now_ms())
        .bind(serde_json::to_string(tag_ids)?)
        .execute(&mut *tx)
        .await?;
        Ok(())
    }

    /// Close the round: status `done`, tries reset, durations recorded.
    pub async fn mark_done(
        tx: &mut SqliteConnection,
        file_id: &str,
        http_duration_ms: i64,
        total_duration_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE files
            SET ai_tagging_status = 'done',
                ai_tagging_tries = 0,
                ai_http_duration = ?,
                ai_tagging_duration = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(http_duration_ms)
        .bind(total_duration_ms)
        .bind(now_ms())
        .bind(file_id)
        .execute(&mut *tx)
        .await?;
        Ok(())
    }
}
