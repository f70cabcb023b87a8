//! Transactional save of a model result.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::collaborators::{FileDeleter, NSFW_REVIEW_TEMPLATE, NotificationSink};
use crate::Result;
use crate::config::{NsfwPolicy, SettingsService};
use crate::database::models::{FileAiInfoDbModel, FileStatus};
use crate::database::repositories::{AiResultTxOps, CategoryLink};
use crate::database::retry::retry_with_linear_backoff;
use crate::database::time::now_ms;
use crate::database::{DbPool, begin_immediate};
use crate::vision::VisionAnalysis;

const CATEGORY_BUMP_ATTEMPTS: usize = 3;
const CATEGORY_BUMP_STEP: Duration = Duration::from_millis(100);

/// What a successful save changed.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistOutcome {
    pub tag_count: usize,
    pub nsfw: bool,
    /// New lifecycle status when the NSFW policy moved the file.
    pub lifecycle: Option<FileStatus>,
    pub category: Option<CategoryLink>,
}

pub struct ResultPersister {
    pool: DbPool,
    settings: Arc<SettingsService>,
    notifier: Arc<dyn NotificationSink>,
    deleter: Arc<dyn FileDeleter>,
}

impl ResultPersister {
    pub fn new(
        pool: DbPool,
        settings: Arc<SettingsService>,
        notifier: Arc<dyn NotificationSink>,
        deleter: Arc<dyn FileDeleter>,
    ) -> Self {
        Self {
            pool,
            settings,
            notifier,
            deleter,
        }
    }

    /// Save `analysis` for `file_id` and close the tagging round.
    ///
    /// Everything up to `done` happens in one `BEGIN IMMEDIATE` transaction.
    /// The category counter, physical deletion and user notification run
    /// afterwards in the background and never fail the save.
    pub async fn persist(
        &self,
        file_id: &str,
        analysis: &VisionAnalysis,
        http_duration_ms: i64,
        total_duration_ms: i64,
    ) -> Result<PersistOutcome> {
        let settings = self.settings.tagging_settings(false).await;
        let nsfw = analysis.content_safety.is_nsfw_at(settings.nsfw_threshold);
        let lifecycle = nsfw.then(|| match settings.nsfw_policy {
            NsfwPolicy::DeleteOnNsfw => FileStatus::PendingDeletion,
            NsfwPolicy::MarkOnly | NsfwPolicy::Review => FileStatus::PendingReview,
        });
        let deleting = lifecycle == Some(FileStatus::PendingDeletion);
        let tags = if deleting {
            Vec::new()
        } else {
            analysis.normalized_tags()
        };
        let info = ai_info_row(file_id, analysis, &tags, nsfw)?;

        let mut tx = begin_immediate(&self.pool).await?;
        let file = AiResultTxOps::load_file(&mut tx, file_id).await?;

        AiResultTxOps::upsert_ai_info(&mut tx, &info).await?;
        if !analysis.description.trim().is_empty() {
            AiResultTxOps::set_description(&mut tx, file_id, analysis.description.trim()).await?;
        }
        if let Some(status) = lifecycle {
            AiResultTxOps::mark_nsfw(&mut tx, file_id, status).await?;
        }

        let category = match analysis.category.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() && !deleting => {
                Some(AiResultTxOps::link_category(&mut tx, &file, name).await?)
            }
            _ => None,
        };

        let touched = AiResultTxOps::replace_ai_tags(&mut tx, file_id, &tags).await?;
        AiResultTxOps::recompute_tag_usage(&mut tx, &touched).await?;
        AiResultTxOps::mark_done(&mut tx, file_id, http_duration_ms, total_duration_ms).await?;
        tx.commit().await?;

        if let Some(link) = category.as_ref().filter(|l| l.changed) {
            self.spawn_category_bump(link.category_id.clone());
        }
        match lifecycle {
            Some(FileStatus::PendingDeletion) => {
                let deleter = self.deleter.clone();
                tokio::spawn(async move {
                    if let Err(e) = deleter.delete_file(&file).await {
                        tracing::warn!(file_id = %file.id, error = %e, "NSFW deletion failed; file stays pending_deletion");
                    }
                });
            }
            Some(_) => {
                let notifier = self.notifier.clone();
                let params = json!({
                    "file_id": file.id,
                    "reason": analysis.content_safety.nsfw_reason,
                    "score": info.nsfw_score,
                });
                tokio::spawn(async move {
                    if let Err(e) = notifier
                        .notify(&file.user_id, NSFW_REVIEW_TEMPLATE, params)
                        .await
                    {
                        tracing::warn!(file_id = %file.id, error = %e, "Review notification failed");
                    }
                });
            }
            None => {}
        }

        Ok(PersistOutcome {
            tag_count: tags.len(),
            nsfw,
            lifecycle,
            category,
        })
    }

    fn spawn_category_bump(&self, category_id: String) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let bumped = retry_with_linear_backoff(
                "bump_category_count",
                CATEGORY_BUMP_ATTEMPTS,
                CATEGORY_BUMP_STEP,
                || {
                    let pool = pool.clone();
                    let category_id = category_id.clone();
                    async move {
                        let mut conn = pool.acquire().await?;
                        AiResultTxOps::bump_category_count(&mut conn, &category_id).await
                    }
                },
            )
            .await;
            if let Err(e) = bumped {
                tracing::debug!(category_id = %category_id, error = %e, "Gave up on category count");
            }
        });
    }
}

fn ai_info_row(
    file_id: &str,
    analysis: &VisionAnalysis,
    tags: &[String],
    nsfw: bool,
) -> Result<FileAiInfoDbModel> {
    let basic = &analysis.basic_info;
    let visual = &analysis.visual_elements;
    let safety = &analysis.content_safety;
    let now = now_ms();

    let dimensions = if basic.width > 0 && basic.height > 0 {
        format!("{}x{}", basic.width, basic.height)
    } else {
        String::new()
    };
    let score = if safety.nsfw_score.is_finite() {
        safety.nsfw_score.clamp(0.0, 1.0)
    } else {
        0.0
    };

    Ok(FileAiInfoDbModel {
        file_id: file_id.to_string(),
        description: analysis.description.trim().to_string(),
        search_content: analysis.search_content.trim().to_string(),
        semantic_keywords: serde_json::to_string(&analysis.semantic_keywords)?,
        tags: serde_json::to_string(tags)?,
        dominant_color: visual.dominant_color.clone(),
        color_palette: serde_json::to_string(&visual.color_palette)?,
        objects_count: visual.objects_count.max(0),
        composition: visual.composition.clone(),
        dimensions,
        resolution: basic.resolution.clone(),
        is_nsfw: nsfw,
        nsfw_score: score,
        nsfw_categories: serde_json::to_string(&safety.categories)?,
        nsfw_evaluation: safety.evaluation_result.clone(),
        nsfw_reason: safety.nsfw_reason.clone(),
        created_at: now,
        updated_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::keys;
    use crate::database::models::FileDbModel;
    use crate::database::repositories::{
        FileRepository, SqlxFileRepository, SqlxSettingsRepository,
    };
    use crate::database::test_pool;
    use crate::tagging::LogNotificationSink;
    use crate::vision::ContentSafety;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingDeleter {
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FileDeleter for RecordingDeleter {
        async fn delete_file(&self, file: &FileDbModel) -> Result<()> {
            self.deleted.lock().push(file.id.clone());
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        pool: DbPool,
        files: SqlxFileRepository,
        settings: Arc<SettingsService>,
        deleter: Arc<RecordingDeleter>,
        persister: ResultPersister,
    }

    async fn fixture() -> Fixture {
        let (dir, pool) = test_pool().await;
        let files = SqlxFileRepository::new(pool.clone());
        let settings = Arc::new(SettingsService::new(Arc::new(SqlxSettingsRepository::new(
            pool.clone(),
        ))));
        let deleter = Arc::new(RecordingDeleter::default());
        let persister = ResultPersister::new(
            pool.clone(),
            settings.clone(),
            Arc::new(LogNotificationSink),
            deleter.clone(),
        );
        Fixture {
            _dir: dir,
            pool,
            files,
            settings,
            deleter,
            persister,
        }
    }

    fn analysis(tags: &[&str], score: f64) -> VisionAnalysis {
        VisionAnalysis {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            category: Some("Animals".into()),
            description: "A cat on a sofa".into(),
            content_safety: ContentSafety {
                nsfw_score: score,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn tag_names(pool: &DbPool, file_id: &str) -> Vec<(String, String)> {
        sqlx::query_as(
            "SELECT t.name, ft.source FROM file_tags ft JOIN tags t ON t.id = ft.tag_id WHERE ft.file_id = ? ORDER BY t.name",
        )
        .bind(file_id)
        .fetch_all(pool)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_success_closes_round() {
        let f = fixture().await;
        let mut file = FileDbModel::new("f1", "u1");
        file.ai_tagging_status = "pending".into();
        file.ai_tagging_tries = 2;
        f.files.insert_file(&file).await.unwrap();

        let outcome = f
            .persister
            .persist("f1", &analysis(&["Cat", "sofa", "cat"], 0.1), 120, 400)
            .await
            .unwrap();
        assert_eq!(outcome.tag_count, 2);
        assert!(!outcome.nsfw);
        assert!(outcome.category.as_ref().is_some_and(|c| c.created && c.changed));

        let saved = f.files.get_file("f1").await.unwrap();
        assert_eq!(saved.ai_tagging_status, "done");
        assert_eq!(saved.ai_tagging_tries, 0);
        assert_eq!(saved.ai_http_duration, 120);
        assert_eq!(saved.description.as_deref(), Some("A cat on a sofa"));

        let info = f.files.get_ai_info("f1").await.unwrap().unwrap();
        assert_eq!(info.tag_list(), vec!["cat", "sofa"]);
        assert_eq!(
            tag_names(&f.pool, "f1").await,
            vec![("cat".into(), "ai".into()), ("sofa".into(), "ai".into())]
        );
    }

    #[tokio::test]
    async fn test_second_save_replaces_ai_tags_and_keeps_user_tags() {
        let f = fixture().await;
        f.files.insert_file(&FileDbModel::new("f1", "u1")).await.unwrap();
        f.persister
            .persist("f1", &analysis(&["cat", "sofa"], 0.0), 1, 1)
            .await
            .unwrap();
        sqlx::query("UPDATE file_tags SET source = 'user,ai' WHERE tag_id = (SELECT id FROM tags WHERE name = 'sofa')")
            .execute(&f.pool)
            .await
            .unwrap();

        f.persister
            .persist("f1", &analysis(&["dog"], 0.0), 1, 1)
            .await
            .unwrap();
        assert_eq!(
            tag_names(&f.pool, "f1").await,
            vec![("dog".into(), "ai".into()), ("sofa".into(), "user".into())]
        );

        let (cat_usage,): (i64,) = sqlx::query_as("SELECT usage_count FROM tags WHERE name = 'cat'")
            .fetch_one(&f.pool)
            .await
            .unwrap();
        assert_eq!(cat_usage, 0);
    }

    #[tokio::test]
    async fn test_threshold_is_inclusive_and_review_policy_holds_file() {
        let f = fixture().await;
        f.files.insert_file(&FileDbModel::new("f1", "u1")).await.unwrap();

        let outcome = f
            .persister
            .persist("f1", &analysis(&["beach"], 0.6), 1, 1)
            .await
            .unwrap();
        assert!(outcome.nsfw);
        assert_eq!(outcome.lifecycle, Some(FileStatus::PendingReview));

        let saved = f.files.get_file("f1").await.unwrap();
        assert_eq!(saved.status, "pending_review");
        assert!(saved.nsfw);
        assert_eq!(saved.ai_tagging_status, "done");
    }

    #[tokio::test]
    async fn test_delete_policy_schedules_deletion_without_tags() {
        let f = fixture().await;
        f.settings
            .set(keys::NSFW_POLICY, serde_json::json!("delete_on_nsfw"))
            .await
            .unwrap();
        f.files.insert_file(&FileDbModel::new("f1", "u1")).await.unwrap();

        let outcome = f
            .persister
            .persist("f1", &analysis(&["beach"], 0.95), 1, 1)
            .await
            .unwrap();
        assert_eq!(outcome.lifecycle, Some(FileStatus::PendingDeletion));
        assert_eq!(outcome.tag_count, 0);
        assert!(tag_names(&f.pool, "f1").await.is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.deleter.deleted.lock().as_slice(), ["f1".to_string()]);
        assert_eq!(f.files.get_file("f1").await.unwrap().status, "pending_deletion");
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let f = fixture().await;
        let err = f
            .persister
            .persist("ghost", &analysis(&["x"], 0.0), 1, 1)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
