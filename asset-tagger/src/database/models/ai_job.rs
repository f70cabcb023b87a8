//! Queue job models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One `ai_job` row; at most one per file.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AiJobDbModel {
    pub id: String,
    pub file_id: String,
    /// Status: queued, processing, done, failed, ignored, skipped
    pub status: String,
    pub tries: i64,
    /// Higher values are fetched first.
    pub priority: i64,
    /// Epoch ms; for `processing` the lease expiry, for `queued` the ready-at time of a delayed retry.
    pub lease_until: Option<i64>,
    pub lease_by: Option<String>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl AiJobDbModel {
    pub fn job_status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }
}

/// Job status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker (possibly delayed until `lease_until`).
    Queued,
    /// Leased by a worker until `lease_until`.
    Processing,
    Done,
    /// Dead-lettered; never retried automatically.
    Failed,
    Ignored,
    Skipped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Ignored => "ignored",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "ignored" => Some(Self::Ignored),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Failed | Self::Ignored | Self::Skipped
        )
    }

    /// Terminal statuses that make a repeated enqueue a no-op.
    ///
    /// Enqueueing a dead-lettered (`failed`) job requeues it.
    pub fn blocks_enqueue(&self) -> bool {
        matches!(self, Self::Done | Self::Ignored | Self::Skipped)
    }
}

/// Queue depth counters, the `queue_stats_ext` block of the stats payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetrics {
    /// Ready to be fetched now.
    pub queued: i64,
    /// Leased (`processing`), including expired leases not yet reclaimed.
    pub in_flight: i64,
    /// Waiting out a retry delay.
    pub delayed: i64,
    /// Dead-lettered.
    pub dlq: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_jobs_can_be_requeued() {
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Failed.blocks_enqueue());
        assert!(JobStatus::Done.blocks_enqueue());
        assert!(!JobStatus::Processing.is_terminal());
    }
}
