//! Result batching and the saver pool.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;

use super::{SharedReceiver, StageContext, TRANSIENT_RETRY_DELAY, TagResult, recv_shared};
use crate::Error;
use crate::database::repositories::MAX_TAGGING_TRIES;
use crate::database::time::duration_ms;

/// Group results into batches of up to `batch_size`, flushing a partial batch
/// every `flush_interval`. Remaining results are flushed when the AI stage closes.
pub(super) async fn batch(
    batch_size: usize,
    flush_interval: Duration,
    mut results_rx: mpsc::Receiver<TagResult>,
    batches_tx: mpsc::Sender<Vec<TagResult>>,
) {
    let batch_size = batch_size.max(1);
    let mut buffer: Vec<TagResult> = Vec::with_capacity(batch_size);
    let mut flush_timer = interval(flush_interval);
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            result = results_rx.recv() => {
                match result {
                    Some(result) => {
                        buffer.push(result);
                        if buffer.len() >= batch_size
                            && batches_tx.send(std::mem::take(&mut buffer)).await.is_err()
                        {
                            tracing::error!("Saver pool gone, dropping results");
                            break;
                        }
                    }
                    None => {
                        if !buffer.is_empty() && batches_tx.send(buffer).await.is_err() {
                            tracing::error!("Saver pool gone, dropping final results");
                        }
                        break;
                    }
                }
            }
            _ = flush_timer.tick() => {
                if !buffer.is_empty()
                    && batches_tx.send(std::mem::take(&mut buffer)).await.is_err()
                {
                    tracing::error!("Saver pool gone, dropping results");
                    break;
                }
            }
        }
    }
    tracing::debug!("Result batcher stopped");
}

pub(super) async fn run(
    ctx: Arc<StageContext>,
    worker: usize,
    batches_rx: SharedReceiver<Vec<TagResult>>,
) {
    while let Some(batch) = recv_shared(&batches_rx).await {
        for result in batch {
            save(&ctx, result).await;
        }
    }
    tracing::debug!(worker, "Saver worker stopped");
}

async fn save(ctx: &StageContext, result: TagResult) {
    let TagResult {
        task,
        file,
        outcome,
        http_duration_ms,
        started,
    } = result;

    if !ctx.keep_lease(&task).await {
        tracing::debug!(file_id = %file.id, "Dropping result of a reclaimed job");
        return;
    }

    let analysis = match outcome {
        Ok(analysis) => analysis,
        Err(error) => {
            record_failure(ctx, task, &file.id, file.ai_tagging_tries, &error).await;
            ctx.deps.metrics.trigger();
            return;
        }
    };

    let total_ms = duration_ms(started.elapsed());
    match ctx
        .deps
        .persister
        .persist(&file.id, &analysis, http_duration_ms, total_ms)
        .await
    {
        Ok(saved) => {
            tracing::info!(
                file_id = %file.id,
                tags = saved.tag_count,
                nsfw = saved.nsfw,
                total_ms,
                "File tagged"
            );
            if let Err(e) = task.ack().await {
                tracing::warn!(file_id = %file.id, error = %e, "Failed to ack job");
            }
            ctx.deps.metrics.trigger();
        }
        Err(e) => {
            tracing::warn!(file_id = %file.id, error = %e, "Failed to persist result");
            if let Err(e) = task.nack(TRANSIENT_RETRY_DELAY, false, &e.to_string()).await {
                tracing::warn!(file_id = %file.id, error = %e, "Failed to return task to the queue");
            }
        }
    }
}

/// Count one failed attempt. After [`MAX_TAGGING_TRIES`] the file is `failed`
/// and the job dead-lettered; before that the job retries after `tries` seconds.
async fn record_failure(
    ctx: &StageContext,
    task: crate::queue::LeasedTask,
    file_id: &str,
    snapshot_tries: i64,
    error: &Error,
) {
    let tries = match ctx.deps.files.find_file(file_id).await {
        Ok(Some(file)) => file.ai_tagging_tries,
        Ok(None) => {
            if let Err(e) = task.ack().await {
                tracing::warn!(file_id, error = %e, "Failed to ack job");
            }
            return;
        }
        Err(e) => {
            tracing::warn!(file_id, error = %e, "Failed to re-read tries, using loader snapshot");
            snapshot_tries
        }
    };

    let next = tries + 1;
    let exhausted = next >= MAX_TAGGING_TRIES;
    let recorded = next.min(MAX_TAGGING_TRIES);
    let reason = error.to_string();

    if let Err(e) = ctx
        .deps
        .files
        .record_failed_attempt(file_id, recorded, exhausted)
        .await
    {
        tracing::warn!(file_id, error = %e, "Failed to record attempt");
        if let Err(e) = task.nack(TRANSIENT_RETRY_DELAY, false, &reason).await {
            tracing::warn!(file_id, error = %e, "Failed to return task to the queue");
        }
        return;
    }

    let settled = if exhausted {
        tracing::warn!(file_id, tries = recorded, error = %reason, "Tagging failed permanently");
        task.nack(Duration::ZERO, true, &reason).await
    } else {
        let delay = Duration::from_secs(next as u64);
        tracing::info!(file_id, tries = recorded, retry_in = ?delay, "Tagging attempt failed");
        task.nack(delay, false, &reason).await
    };
    if let Err(e) = settled {
        tracing::warn!(file_id, error = %e, "Failed to settle failed job");
    }
}
