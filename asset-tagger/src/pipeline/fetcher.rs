//! Task fetcher: leases jobs from the queue and hands them to the loaders.
//!
//! A job is only leased once a slot in the loader channel is reserved, so
//! leases are never taken far ahead of loader capacity.

use std::sync::Arc;
use tokio::sync::mpsc;

use super::StageContext;
use crate::queue::LeasedTask;

pub(super) async fn run(ctx: Arc<StageContext>, tasks_tx: mpsc::Sender<LeasedTask>) {
    tracing::debug!("Task fetcher started");
    let idle = ctx.config.idle_interval;

    while !ctx.is_stopping() {
        if ctx.deps.runtime.is_paused() {
            ctx.idle(idle).await;
            continue;
        }

        let reserve = tokio::time::timeout(ctx.config.send_timeout, tasks_tx.reserve());
        let permit = tokio::select! {
            _ = ctx.stop.cancelled() => break,
            reserved = reserve => match reserved {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => break,
                Err(_) => {
                    tracing::debug!("Loader channel full, not leasing");
                    continue;
                }
            },
        };

        match ctx.deps.queue.fetch(ctx.config.lease).await {
            Ok(Some(task)) => permit.send(task),
            Ok(None) => {
                drop(permit);
                ctx.idle(idle).await;
            }
            Err(e) => {
                drop(permit);
                tracing::warn!(error = %e, "Queue fetch failed");
                ctx.idle(idle).await;
            }
        }
    }

    tracing::debug!("Task fetcher stopped");
}
