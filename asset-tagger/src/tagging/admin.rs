//! Operator actions on the tagging lifecycle.
//!
//! Every action is safe to repeat: file transitions are conditional and
//! enqueueing goes through [`JobQueue::enqueue_unique`]. Each action leaves
//! an audit row in `file_tagging_log`.
//!
//! [`JobQueue::enqueue_unique`]: crate::queue::JobQueue::enqueue_unique

use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::metrics::QueueStats;
use super::service::TaggingService;
use crate::config::keys;
use crate::database::models::{CandidateFilter, LogAction, NewTaggingLog, TaggingLogDbModel};
use crate::{Error, Result};

/// Upper bound on ids accepted by the id-targeted actions.
pub const MAX_FILE_IDS: usize = 500;
/// Exhausted files rescued per trigger.
pub const RESCUE_LIMIT: i64 = 500;
pub const DEFAULT_RETRY_FAILED_LIMIT: i64 = 500;
pub const MAX_RETRY_FAILED_LIMIT: i64 = 1000;
pub const MIN_STUCK_THRESHOLD_MINUTES: i64 = 5;
pub const DEFAULT_LOG_LIMIT: i64 = 50;
pub const MAX_LOG_LIMIT: i64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Ok,
    Empty,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerScanResult {
    pub submitted_count: usize,
    pub status: ScanStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryFailedResult {
    pub selected: usize,
    pub enqueued: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryResult {
    pub requested: usize,
    pub enqueued: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IgnoreResult {
    pub count: usize,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnignoreResult {
    pub requested: usize,
    pub count: usize,
    pub ids: Vec<String>,
    pub enqueued: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetStuckResult {
    pub reset_count: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileResult {
    pub selected: usize,
    pub enqueued: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConcurrencyResult {
    pub configured: usize,
    pub stats: QueueStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaggingLogPage {
    pub items: Vec<TaggingLogDbModel>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Deduplicated, trimmed ids; rejects empty or oversized requests.
fn validate_ids(ids: &[String]) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let cleaned: Vec<String> = ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert(id.to_string()))
        .map(str::to_string)
        .collect();

    if cleaned.is_empty() {
        return Err(Error::validation("file_ids must not be empty"));
    }
    if cleaned.len() > MAX_FILE_IDS {
        return Err(Error::validation(format!(
            "at most {MAX_FILE_IDS} file_ids per request"
        )));
    }
    Ok(cleaned)
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

/// Admin facade over a running [`TaggingService`].
#[derive(Clone)]
pub struct TaggingAdmin {
    service: Arc<TaggingService>,
}

impl TaggingAdmin {
    pub fn new(service: Arc<TaggingService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<TaggingService> {
        &self.service
    }

    async fn requeue(&self, ids: &[String]) -> Result<(usize, usize)> {
        if ids.is_empty() {
            return Ok((0, 0));
        }
        self.service.queue().purge_terminal(ids).await?;
        self.service.enqueue_all(ids, 0).await
    }

    async fn existing(&self, ids: Vec<String>) -> Result<Vec<String>> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if self.service.files().find_file(&id).await?.is_some() {
                found.push(id);
            }
        }
        Ok(found)
    }

    /// Start a scan of up to `max_files` files.
    ///
    /// Clears `pending` leftovers when nothing is in flight, rescues files
    /// that exhausted their retries, then queues regular candidates.
    pub async fn trigger_scan(
        &self,
        max_files: i64,
        operator_id: Option<String>,
    ) -> Result<TriggerScanResult> {
        if max_files < 0 {
            return Err(Error::validation("max_files must be >= 0"));
        }
        let started = Instant::now();
        let files = self.service.files();

        if !self.service.ensure_running().await? {
            tracing::info!("AI tagging disabled; scan only queues files");
        }

        let mut reset_pending = 0;
        if self.service.pipeline_idle().await? {
            reset_pending = files.reset_pending_to_none().await?;
            if reset_pending > 0 {
                tracing::info!(count = reset_pending, "Reset idle pending files to none");
            }
        }

        let rescued = files
            .select_candidates(CandidateFilter::Exhausted, RESCUE_LIMIT.min(max_files))
            .await?;
        files.rescue_exhausted(&rescued).await?;
        let (rescued_enqueued, _) = self.requeue(&rescued).await?;

        let remaining = max_files - rescued.len() as i64;
        let regular = if remaining > 0 {
            files
                .select_candidates(CandidateFilter::Regular, remaining)
                .await?
        } else {
            Vec::new()
        };
        let (regular_enqueued, _) = self.requeue(&regular).await?;

        let submitted_count = rescued_enqueued + regular_enqueued;
        let status = if submitted_count > 0 {
            ScanStatus::Ok
        } else {
            ScanStatus::Empty
        };

        self.service
            .audit(
                NewTaggingLog::new("trigger", LogAction::Manual, "tagging.scheduled_scan")
                    .with_data(json!({
                        "max_files": max_files,
                        "reset_pending": reset_pending,
                        "rescued": rescued.len(),
                        "regular": regular.len(),
                        "submitted_count": submitted_count,
                    }))
                    .with_operator(operator_id)
                    .with_duration_ms(elapsed_ms(started)),
            )
            .await;

        tracing::info!(
            max_files,
            rescued = rescued.len(),
            submitted_count,
            "Tagging scan triggered"
        );
        Ok(TriggerScanResult {
            submitted_count,
            status,
        })
    }

    /// Re-queue files that failed for good (or were skipped).
    pub async fn retry_failed_all(
        &self,
        limit: Option<i64>,
        operator_id: Option<String>,
    ) -> Result<RetryFailedResult> {
        let limit = limit.unwrap_or(DEFAULT_RETRY_FAILED_LIMIT);
        if !(1..=MAX_RETRY_FAILED_LIMIT).contains(&limit) {
            return Err(Error::validation(format!(
                "limit must be between 1 and {MAX_RETRY_FAILED_LIMIT}"
            )));
        }
        let started = Instant::now();

        let selected = self
            .service
            .files()
            .select_candidates(CandidateFilter::RetryableFailed, limit)
            .await?;
        self.service.files().reset_to_none(&selected).await?;
        let (enqueued, skipped) = self.requeue(&selected).await?;

        self.service
            .audit(
                NewTaggingLog::new("retry", LogAction::Manual, "tagging.retry_failed_all")
                    .with_data(json!({
                        "limit": limit,
                        "selected": selected.len(),
                        "enqueued": enqueued,
                        "skipped": skipped,
                    }))
                    .with_operator(operator_id)
                    .with_duration_ms(elapsed_ms(started)),
            )
            .await;

        Ok(RetryFailedResult {
            selected: selected.len(),
            enqueued,
            skipped,
        })
    }

    /// Reset the given files to `none` and queue them.
    pub async fn retry(
        &self,
        file_ids: &[String],
        reason: Option<String>,
        operator_id: Option<String>,
    ) -> Result<RetryResult> {
        let ids = validate_ids(file_ids)?;
        let requested = ids.len();
        let ids = self.existing(ids).await?;

        self.service.files().reset_to_none(&ids).await?;
        let (enqueued, _) = self.requeue(&ids).await?;

        for id in &ids {
            self.service
                .audit(
                    NewTaggingLog::new("retry", LogAction::Manual, "tagging.retry")
                        .with_file(id)
                        .with_data(json!({ "reason": reason }))
                        .with_operator(operator_id.clone()),
                )
                .await;
        }

        // Unknown ids count as skipped.
        Ok(RetryResult {
            requested,
            enqueued,
            skipped: requested - enqueued,
        })
    }

    /// Exclude files from tagging.
    pub async fn ignore(
        &self,
        file_ids: &[String],
        reason: Option<String>,
        operator_id: Option<String>,
    ) -> Result<IgnoreResult> {
        let ids = validate_ids(file_ids)?;
        let changed = self.service.files().ignore_files(&ids).await?;

        for id in &changed {
            self.service
                .audit(
                    NewTaggingLog::new("ignore", LogAction::Manual, "tagging.ignore")
                        .with_file(id)
                        .with_data(json!({ "reason": reason }))
                        .with_operator(operator_id.clone()),
                )
                .await;
        }

        Ok(IgnoreResult {
            count: changed.len(),
            ids: changed,
        })
    }

    /// Bring ignored files back to `none` and queue them.
    pub async fn unignore(
        &self,
        file_ids: &[String],
        operator_id: Option<String>,
    ) -> Result<UnignoreResult> {
        let ids = validate_ids(file_ids)?;
        let requested = ids.len();
        let changed = self.service.files().unignore_files(&ids).await?;
        let (enqueued, skipped) = self.requeue(&changed).await?;

        for id in &changed {
            self.service
                .audit(
                    NewTaggingLog::new("unignore", LogAction::Manual, "tagging.unignore")
                        .with_file(id)
                        .with_operator(operator_id.clone()),
                )
                .await;
        }

        Ok(UnignoreResult {
            requested,
            count: changed.len(),
            ids: changed,
            enqueued,
            skipped,
        })
    }

    /// Fail `pending` files whose heartbeat is older than the threshold.
    /// Thresholds below five minutes are raised to five.
    pub async fn reset_stuck(
        &self,
        threshold_minutes: i64,
        operator_id: Option<String>,
    ) -> Result<ResetStuckResult> {
        let minutes = threshold_minutes.max(MIN_STUCK_THRESHOLD_MINUTES);
        let started = Instant::now();
        let reset_count = self
            .service
            .fail_stale_pending(Duration::from_secs(minutes as u64 * 60))
            .await?;

        self.service
            .audit(
                NewTaggingLog::new("reset", LogAction::Manual, "tagging.reset_stuck")
                    .with_data(json!({
                        "threshold_minutes": minutes,
                        "reset_count": reset_count,
                    }))
                    .with_operator(operator_id)
                    .with_duration_ms(elapsed_ms(started)),
            )
            .await;

        Ok(ResetStuckResult { reset_count })
    }

    /// Queue files that fell through the cracks: `none|failed` with retries left.
    pub async fn reconcile(&self) -> Result<ReconcileResult> {
        let started = Instant::now();
        let limit = self.service.config().reconcile_batch;
        let selected = self
            .service
            .files()
            .select_candidates(CandidateFilter::Missed, limit)
            .await?;
        if selected.is_empty() {
            return Ok(ReconcileResult::default());
        }

        let (enqueued, _) = self.requeue(&selected).await?;
        self.service
            .audit(
                NewTaggingLog::new("scheduled", LogAction::Auto, "tagging.reconcile")
                    .with_data(json!({
                        "selected": selected.len(),
                        "enqueued": enqueued,
                    }))
                    .with_duration_ms(elapsed_ms(started)),
            )
            .await;

        if enqueued > 0 {
            tracing::info!(selected = selected.len(), enqueued, "Reconcile queued missed files");
        }
        Ok(ReconcileResult {
            selected: selected.len(),
            enqueued,
        })
    }

    /// Persist a new AI concurrency and apply it right away.
    pub async fn set_concurrency(&self, concurrency: i64) -> Result<ConcurrencyResult> {
        if concurrency < 1 {
            return Err(Error::validation("concurrency must be >= 1"));
        }
        let configured = concurrency as usize;
        self.service.update_concurrency(configured).await?;
        self.service
            .settings()
            .set(keys::CONCURRENCY, json!(concurrency))
            .await?;
        Ok(ConcurrencyResult {
            configured,
            stats: self.service.queue_stats().await?,
        })
    }

    /// Persist the auto-processing flag and pause/resume accordingly.
    pub async fn set_auto_processing(&self, enabled: bool) -> Result<bool> {
        self.service.apply_auto_processing(enabled);
        self.service
            .settings()
            .set(keys::AUTO_PROCESSING_ENABLED, json!(enabled))
            .await?;
        Ok(enabled)
    }

    /// Audit rows, newest first, across all operators.
    pub async fn list_logs(
        &self,
        file_id: Option<&str>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<TaggingLogPage> {
        let limit = limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
        let offset = offset.unwrap_or(0).max(0);
        let file_id = file_id.filter(|f| !f.is_empty());

        let logs = self.service.logs();
        let items = logs.list(file_id, limit, offset).await?;
        let total = logs.count(file_id).await?;
        Ok(TaggingLogPage {
            items,
            total,
            limit,
            offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_ids_dedupes_and_trims() {
        let ids = vec![" a ".to_string(), "a".to_string(), "".to_string(), "b".to_string()];
        assert_eq!(validate_ids(&ids).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_validate_ids_bounds() {
        assert!(validate_ids(&[]).is_err());
        assert!(validate_ids(&["  ".to_string()]).is_err());

        let too_many: Vec<String> = (0..=MAX_FILE_IDS).map(|i| format!("f{i}")).collect();
        assert!(matches!(validate_ids(&too_many), Err(Error::Validation(_))));
        assert!(validate_ids(&too_many[..MAX_FILE_IDS]).is_ok());
    }

    #[test]
    fn test_scan_status_serializes_lowercase() {
        let result = TriggerScanResult {
            submitted_count: 0,
            status: ScanStatus::Empty,
        };
        assert_eq!(
            serde_json::to_value(result).unwrap(),
            json!({ "submitted_count": 0, "status": "empty" })
        );
    }
}
