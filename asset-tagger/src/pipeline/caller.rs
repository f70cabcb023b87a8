//! AI caller pool: one model call per file, gated by the dynamic semaphore.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use super::{LoadedFile, SharedReceiver, StageContext, TRANSIENT_RETRY_DELAY, TagResult, recv_shared};
use crate::database::time::duration_ms;
use crate::vision::VisionRequest;

pub(super) async fn run(
    ctx: Arc<StageContext>,
    worker: usize,
    files_rx: SharedReceiver<LoadedFile>,
    results_tx: mpsc::Sender<TagResult>,
) {
    while let Some(loaded) = recv_shared(&files_rx).await {
        if ctx.is_stopping() {
            if let Err(e) = loaded
                .task
                .nack(TRANSIENT_RETRY_DELAY, false, "pipeline stopping")
                .await
            {
                tracing::warn!(error = %e, "Failed to return task to the queue");
            }
            continue;
        }

        let Some(result) = call_model(&ctx, loaded).await else {
            continue;
        };

        // Results of calls already made are persisted even while stopping.
        if let Err(mpsc::error::SendError(result)) = results_tx.send(result).await
            && let Err(e) = result
                .task
                .nack(TRANSIENT_RETRY_DELAY, false, "pipeline stopping")
                .await
        {
            tracing::warn!(error = %e, "Failed to return task to the queue");
        }
    }
    tracing::debug!(worker, "AI worker stopped");
}

/// `None` when the lease was lost before or during the call; the job then
/// belongs to another worker and the result is discarded.
async fn call_model(ctx: &StageContext, loaded: LoadedFile) -> Option<TagResult> {
    let LoadedFile {
        task,
        file,
        base64_image,
        format,
        started,
    } = loaded;

    let permit = ctx.semaphore.acquire().await;
    if !ctx.keep_lease(&task).await {
        return None;
    }
    ctx.touch_heartbeat(&file.id).await;

    let active = ctx.deps.runtime.enter_ai();
    let model = ctx.deps.model.current();
    let request = VisionRequest::new(base64_image, format);

    let call_started = Instant::now();
    let outcome = {
        let call = model.analyze(&request);
        tokio::pin!(call);
        let period = ctx.renew_interval();
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                outcome = &mut call => break Some(outcome),
                _ = renew.tick() => {
                    if !ctx.keep_lease(&task).await {
                        break None;
                    }
                }
            }
        }
    };
    let http_duration_ms = duration_ms(call_started.elapsed());
    drop(active);
    drop(permit);

    let Some(outcome) = outcome else {
        tracing::info!(file_id = %file.id, "Lease lost mid-call, abandoning model call");
        return None;
    };

    match &outcome {
        Ok(analysis) => tracing::debug!(
            file_id = %file.id,
            model = model.name(),
            tags = analysis.tags.len(),
            http_ms = http_duration_ms,
            "Model call succeeded"
        ),
        Err(e) => {
            ctx.deps.runtime.record_failure();
            tracing::warn!(file_id = %file.id, model = model.name(), error = %e, "Model call failed");
        }
    }

    Some(TagResult {
        task,
        file,
        outcome,
        http_duration_ms,
        started,
    })
}
