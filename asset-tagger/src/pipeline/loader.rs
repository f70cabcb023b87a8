//! File loader pool: resolves the File row and reads its image bytes.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use super::{
    LoadedFile, MISSING_FILE_RETRY_DELAY, SharedReceiver, StageContext, TRANSIENT_RETRY_DELAY,
    recv_shared,
};
use crate::Result;
use crate::config::keys;
use crate::config::settings::parse_or_default;
use crate::config::MissingFilePolicy;
use crate::database::models::{AiTaggingStatus, FileDbModel, FileStatus};
use crate::queue::LeasedTask;
use crate::storage::detect_format;

pub(super) async fn run(
    ctx: Arc<StageContext>,
    worker: usize,
    tasks_rx: SharedReceiver<LeasedTask>,
    files_tx: mpsc::Sender<LoadedFile>,
) {
    while let Some(task) = recv_shared(&tasks_rx).await {
        if ctx.is_stopping() {
            settle(task.nack(TRANSIENT_RETRY_DELAY, false, "pipeline stopping").await);
            continue;
        }

        let Some(loaded) = load(&ctx, task).await else {
            continue;
        };

        if ctx.is_stopping() {
            settle(
                loaded
                    .task
                    .nack(TRANSIENT_RETRY_DELAY, false, "pipeline stopping")
                    .await,
            );
            continue;
        }
        if let Err(mpsc::error::SendError(loaded)) = files_tx.send(loaded).await {
            settle(
                loaded
                    .task
                    .nack(TRANSIENT_RETRY_DELAY, false, "pipeline stopping")
                    .await,
            );
        }
    }
    tracing::debug!(worker, "Loader worker stopped");
}

fn settle(result: Result<()>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "Failed to settle task");
    }
}

fn is_gone(file: &FileDbModel) -> bool {
    file.status == FileStatus::PendingDeletion.as_str() || file.status == FileStatus::Deleted.as_str()
}

/// Resolve one task to bytes, or settle it here.
async fn load(ctx: &StageContext, task: LeasedTask) -> Option<LoadedFile> {
    let started = Instant::now();
    if !ctx.keep_lease(&task).await {
        return None;
    }
    let file_id = task.file_id().to_string();

    let file = match ctx.deps.files.find_file(&file_id).await {
        Ok(Some(file)) => file,
        Ok(None) => {
            tracing::debug!(file_id = %file_id, "File row gone, dropping job");
            settle(task.ack().await);
            return None;
        }
        Err(e) => {
            tracing::warn!(file_id = %file_id, error = %e, "Failed to load file row");
            settle(task.nack(TRANSIENT_RETRY_DELAY, false, &e.to_string()).await);
            return None;
        }
    };

    if file.tagging_status() == Some(AiTaggingStatus::Ignored) || is_gone(&file) {
        tracing::debug!(file_id = %file_id, status = %file.status, "File no longer eligible, dropping job");
        settle(task.ack().await);
        return None;
    }

    ctx.touch_heartbeat(&file_id).await;

    match ctx.deps.gateway.read_file(&file).await {
        Ok(bytes) => {
            let format = detect_format(&bytes)
                .map(str::to_string)
                .or_else(|| file.format.clone())
                .unwrap_or_else(|| "jpeg".to_string());
            Some(LoadedFile {
                base64_image: BASE64.encode(&bytes),
                format,
                task,
                file,
                started,
            })
        }
        Err(e) if e.is_object_not_found() => {
            apply_missing_policy(ctx, task, &file_id).await;
            None
        }
        Err(e) => {
            tracing::warn!(file_id = %file_id, error = %e, "Failed to read file bytes");
            settle(task.nack(TRANSIENT_RETRY_DELAY, false, &e.to_string()).await);
            None
        }
    }
}

async fn apply_missing_policy(ctx: &StageContext, task: LeasedTask, file_id: &str) {
    let raw = ctx
        .deps
        .settings
        .get_string(keys::MISSING_FILE_POLICY, "drop")
        .await;
    let policy: MissingFilePolicy = parse_or_default(keys::MISSING_FILE_POLICY, &raw);
    tracing::info!(file_id, %policy, "File bytes missing");

    let applied = match policy {
        MissingFilePolicy::Drop => {
            ctx.deps
                .files
                .set_tagging_status(file_id, AiTaggingStatus::Ignored)
                .await
        }
        MissingFilePolicy::Ignore => ctx
            .deps
            .files
            .reset_to_none(&[file_id.to_string()])
            .await
            .map(|_| ()),
        MissingFilePolicy::Retry => {
            settle(
                task.nack(MISSING_FILE_RETRY_DELAY, false, "file bytes missing")
                    .await,
            );
            return;
        }
    };

    match applied {
        Ok(()) => settle(task.ack().await),
        Err(e) => {
            tracing::warn!(file_id, error = %e, "Failed to apply missing-file policy");
            settle(task.nack(TRANSIENT_RETRY_DELAY, false, &e.to_string()).await);
        }
    }
    ctx.deps.metrics.trigger();
}
