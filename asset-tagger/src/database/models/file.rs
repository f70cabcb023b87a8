//! File models.
//!
//! The `files` table is owned by the wider hosting service; the tagging core
//! only reads and writes the columns modelled here.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// File database model.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FileDbModel {
    pub id: String,
    pub user_id: String,
    /// Lifecycle status: active, pending_review, pending_deletion, deleted
    pub status: String,
    pub nsfw: bool,
    pub description: Option<String>,
    pub category_id: Option<String>,
    pub storage_provider_id: String,
    pub storage_type: String,
    pub local_file_path: Option<String>,
    pub local_thumb_path: Option<String>,
    pub format: Option<String>,
    /// AI tagging status: none, pending, done, failed, skipped, ignored
    pub ai_tagging_status: String,
    pub ai_tagging_tries: i64,
    pub ai_tagging_duration: i64,
    pub ai_http_duration: i64,
    pub ai_last_heartbeat_at: Option<i64>,
    pub ai_processing_worker_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl FileDbModel {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            status: FileStatus::Active.as_str().to_string(),
            nsfw: false,
            description: None,
            category_id: None,
            storage_provider_id: "local".to_string(),
            storage_type: "local".to_string(),
            local_file_path: None,
            local_thumb_path: None,
            format: None,
            ai_tagging_status: AiTaggingStatus::None.as_str().to_string(),
            ai_tagging_tries: 0,
            ai_tagging_duration: 0,
            ai_http_duration: 0,
            ai_last_heartbeat_at: None,
            ai_processing_worker_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn tagging_status(&self) -> Option<AiTaggingStatus> {
        AiTaggingStatus::parse(&self.ai_tagging_status)
    }

    /// True when another worker touched this file within `window_ms`.
    pub fn has_fresh_heartbeat(&self, now: i64, window_ms: i64) -> bool {
        self.ai_last_heartbeat_at
            .is_some_and(|hb| now.saturating_sub(hb) < window_ms)
    }
}

/// AI tagging status of a file.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AiTaggingStatus {
    None,
    Pending,
    Done,
    Failed,
    Skipped,
    Ignored,
}

impl AiTaggingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Ignored => "ignored",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "pending" => Some(Self::Pending),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "ignored" => Some(Self::Ignored),
            _ => None,
        }
    }

    /// Check if a tagging round has ended in this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Failed | Self::Skipped | Self::Ignored
        )
    }
}

/// Lifecycle status of a file, as far as the NSFW policy is concerned.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Active,
    PendingReview,
    PendingDeletion,
    Deleted,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PendingReview => "pending_review",
            Self::PendingDeletion => "pending_deletion",
            Self::Deleted => "deleted",
        }
    }
}

/// Per-status file counts, the `queue_stats` block of the stats payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatusCounts {
    pub total: i64,
    pub none: i64,
    pub pending: i64,
    pub done: i64,
    pub failed: i64,
    pub ignored: i64,
    pub skipped: i64,
}

impl FileStatusCounts {
    /// Fold one `(status, count)` row into the totals.
    pub fn add(&mut self, status: &str, count: i64) {
        self.total += count;
        match AiTaggingStatus::parse(status) {
            Some(AiTaggingStatus::None) => self.none += count,
            Some(AiTaggingStatus::Pending) => self.pending += count,
            Some(AiTaggingStatus::Done) => self.done += count,
            Some(AiTaggingStatus::Failed) => self.failed += count,
            Some(AiTaggingStatus::Ignored) => self.ignored += count,
            Some(AiTaggingStatus::Skipped) => self.skipped += count,
            None => {}
        }
    }
}

/// Candidate selections used by the scanners and admin operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateFilter {
    /// `none|failed|skipped` with tries below the retry limit.
    Regular,
    /// `none|failed|skipped` that exhausted their retries.
    Exhausted,
    /// `(failed|none) AND tries >= limit`, or `skipped`.
    RetryableFailed,
    /// `none|failed` with tries below the retry limit.
    Missed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_counts_fold() {
        let mut counts = FileStatusCounts::default();
        counts.add("none", 3);
        counts.add("done", 2);
        counts.add("bogus", 1);
        assert_eq!(counts.total, 6);
        assert_eq!(counts.none, 3);
        assert_eq!(counts.done, 2);
    }

    #[test]
    fn test_fresh_heartbeat() {
        let mut file = FileDbModel::new("f1", "u1");
        assert!(!file.has_fresh_heartbeat(10_000, 1_000));
        file.ai_last_heartbeat_at = Some(9_500);
        assert!(file.has_fresh_heartbeat(10_000, 1_000));
        assert!(!file.has_fresh_heartbeat(11_000, 1_000));
    }

    #[test]
    fn test_status_string_forms_agree() {
        for status in [
            AiTaggingStatus::None,
            AiTaggingStatus::Pending,
            AiTaggingStatus::Ignored,
        ] {
            assert_eq!(status.to_string(), status.as_str());
        }
        assert_eq!(FileStatus::PendingDeletion.to_string(), "pending_deletion");
    }
}
