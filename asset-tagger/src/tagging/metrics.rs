//! Queue statistics and the debounced pusher that broadcasts them.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::collaborators::{ADMIN_TOPIC, BroadcastMessage, Broadcaster};
use crate::Result;
use crate::database::models::FileStatusCounts;
use crate::database::repositories::FileRepository;
use crate::pipeline::PipelineRuntime;
use crate::queue::JobQueue;

/// Minimum spacing between two pushes.
pub const DEFAULT_PUSH_GAP: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatsExt {
    pub queued: i64,
    pub processing: i64,
    pub delayed: i64,
    pub dlq: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStats {
    pub current_concurrency: usize,
    pub active_workers: usize,
    pub paused: bool,
    pub recent_failures: usize,
    pub queue_length: i64,
}

/// Payload of the stats endpoint and of `queue_stats` pushes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_stats: FileStatusCounts,
    pub queue_stats_ext: QueueStatsExt,
    pub config: RuntimeStats,
}

/// Gathers [`QueueStats`] from the queue, the files table and the runtime.
pub struct StatsCollector {
    queue: Arc<dyn JobQueue>,
    files: Arc<dyn FileRepository>,
    runtime: Arc<PipelineRuntime>,
    concurrency: Arc<AtomicUsize>,
}

impl StatsCollector {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        files: Arc<dyn FileRepository>,
        runtime: Arc<PipelineRuntime>,
        concurrency: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            queue,
            files,
            runtime,
            concurrency,
        }
    }

    pub async fn collect(&self) -> Result<QueueStats> {
        let metrics = self.queue.metrics().await?;
        let counts = self.files.count_by_status().await?;
        Ok(QueueStats {
            queue_stats: counts,
            queue_stats_ext: QueueStatsExt {
                queued: metrics.queued,
                processing: metrics.in_flight,
                delayed: metrics.delayed,
                dlq: metrics.dlq,
            },
            config: RuntimeStats {
                current_concurrency: self.concurrency.load(Ordering::SeqCst),
                active_workers: self.runtime.active_ai(),
                paused: self.runtime.is_paused(),
                recent_failures: self.runtime.recent_failures(),
                queue_length: metrics.queued,
            },
        })
    }
}

/// Cheap handle that asks for a stats push. Never blocks.
#[derive(Debug, Clone)]
pub struct MetricsTrigger {
    tx: Option<mpsc::Sender<()>>,
}

impl MetricsTrigger {
    /// A trigger that does nothing.
    pub fn noop() -> Self {
        Self { tx: None }
    }

    pub fn trigger(&self) {
        if let Some(tx) = &self.tx {
            // A full slot already guarantees a pending push.
            let _ = tx.try_send(());
        }
    }
}

/// Spawn the pusher task. Pushes happen at most once per `min_gap`; requests
/// arriving inside the gap collapse into one trailing push at its end.
pub fn spawn_metrics_pusher(
    collector: Arc<StatsCollector>,
    broadcaster: Arc<dyn Broadcaster>,
    min_gap: Duration,
    cancel: CancellationToken,
) -> MetricsTrigger {
    let (tx, mut rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        let mut last_push: Option<Instant> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                signal = rx.recv() => {
                    if signal.is_none() {
                        break;
                    }
                }
            }

            if let Some(last) = last_push {
                let next = last + min_gap;
                if Instant::now() < next {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep_until(next) => {}
                    }
                }
            }
            // Requests made while waiting are served by this push.
            while rx.try_recv().is_ok() {}

            match collector.collect().await {
                Ok(stats) => broadcaster.broadcast(ADMIN_TOPIC, BroadcastMessage::QueueStats(stats)),
                Err(e) => tracing::warn!(error = %e, "Failed to collect queue stats"),
            }
            last_push = Some(Instant::now());
        }
        tracing::debug!("Metrics pusher stopped");
    });

    MetricsTrigger { tx: Some(tx) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxFileRepository;
    use crate::database::test_pool;
    use crate::queue::MemoryJobQueue;
    use crate::tagging::ChannelBroadcaster;

    #[tokio::test]
    async fn test_bursts_collapse_to_leading_and_trailing_push() {
        let (_dir, pool) = test_pool().await;
        let files: Arc<dyn FileRepository> = Arc::new(SqlxFileRepository::new(pool));
        let queue = MemoryJobQueue::start(files.clone(), "test");
        let collector = Arc::new(StatsCollector::new(
            queue,
            files,
            Arc::new(PipelineRuntime::default()),
            Arc::new(AtomicUsize::new(3)),
        ));
        let broadcaster = Arc::new(ChannelBroadcaster::new(64));
        let mut rx = broadcaster.subscribe();
        let cancel = CancellationToken::new();

        let trigger = spawn_metrics_pusher(
            collector,
            broadcaster.clone(),
            Duration::from_millis(200),
            cancel.clone(),
        );
        for _ in 0..20 {
            trigger.trigger();
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        let mut pushes = 0;
        while let Ok(envelope) = rx.try_recv() {
            assert!(matches!(envelope.message, BroadcastMessage::QueueStats(_)));
            pushes += 1;
        }
        assert!((1..=2).contains(&pushes), "got {pushes} pushes");
        cancel.cancel();
    }

    #[test]
    fn test_noop_trigger() {
        MetricsTrigger::noop().trigger();
    }
}
