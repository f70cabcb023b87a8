//! Three-stage tagging pipeline.
//!
//! ```text
//! fetcher ──tasks──▶ loader pool ──files──▶ AI pool ──results──▶ batcher ──▶ saver pool
//! ```
//!
//! Stages are joined by bounded channels. Each stage's senders live only in
//! that stage's workers, so a stage's downstream channel closes once all of
//! its workers have exited; stopping the fetcher therefore drains the whole
//! pipeline front to back. The AI stage is additionally gated by a
//! [`DynamicSemaphore`] whose limit follows `ai.ai_concurrency`.

mod caller;
mod fetcher;
mod loader;
mod runtime;
mod saver;
mod semaphore;

pub use runtime::{FAILURE_WINDOW, PipelineRuntime};
pub use semaphore::{DynamicPermit, DynamicSemaphore};

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::config::SettingsService;
use crate::database::models::FileDbModel;
use crate::database::repositories::FileRepository;
use crate::queue::{DEFAULT_LEASE, JobQueue, LeasedTask};
use crate::storage::ObjectStoreGateway;
use crate::tagging::{MetricsTrigger, ResultPersister};
use crate::vision::{ModelHandle, VisionAnalysis};

/// Delay for jobs handed back because of a transient error or shutdown.
pub const TRANSIENT_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Delay for jobs whose bytes are missing under the `retry` policy.
pub const MISSING_FILE_RETRY_DELAY: Duration = Duration::from_secs(3);
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(50);

/// Pool sizes, buffers and timings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub loader_workers: usize,
    pub saver_workers: usize,
    pub channel_capacity: usize,
    pub save_batch_size: usize,
    pub save_flush_interval: Duration,
    pub lease: Duration,
    /// Fetcher sleep when paused or the queue is empty.
    pub idle_interval: Duration,
    /// Fetcher wait for a free loader slot before re-checking pause and stop.
    pub send_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            loader_workers: 10,
            saver_workers: 5,
            channel_capacity: 200,
            save_batch_size: 10,
            save_flush_interval: Duration::from_millis(100),
            lease: DEFAULT_LEASE,
            idle_interval: Duration::from_secs(1),
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// Collaborators the pipeline runs against.
#[derive(Clone)]
pub struct PipelineDeps {
    pub queue: Arc<dyn JobQueue>,
    pub files: Arc<dyn FileRepository>,
    pub gateway: Arc<ObjectStoreGateway>,
    pub settings: Arc<SettingsService>,
    pub model: ModelHandle,
    pub persister: Arc<ResultPersister>,
    pub runtime: Arc<PipelineRuntime>,
    pub metrics: MetricsTrigger,
    pub worker_id: String,
}

/// File bytes ready for the model.
pub(crate) struct LoadedFile {
    pub task: LeasedTask,
    pub file: FileDbModel,
    pub base64_image: String,
    pub format: String,
    pub started: Instant,
}

/// Model outcome on its way to the saver.
pub(crate) struct TagResult {
    pub task: LeasedTask,
    pub file: FileDbModel,
    pub outcome: Result<VisionAnalysis>,
    pub http_duration_ms: i64,
    pub started: Instant,
}

pub(crate) type SharedReceiver<T> = Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>;

/// Next item from a receiver shared by a worker pool.
pub(crate) async fn recv_shared<T>(rx: &SharedReceiver<T>) -> Option<T> {
    rx.lock().await.recv().await
}

/// State every stage reads.
pub(crate) struct StageContext {
    pub deps: PipelineDeps,
    pub config: PipelineConfig,
    pub semaphore: Arc<DynamicSemaphore>,
    pub stop: CancellationToken,
}

impl StageContext {
    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Sleep for `duration` unless the pipeline stops first.
    pub async fn idle(&self, duration: Duration) {
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// Extend the task's lease. False when another worker owns the job now,
    /// in which case nothing may be written for it.
    pub async fn keep_lease(&self, task: &LeasedTask) -> bool {
        match task.renew(self.config.lease).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::debug!(file_id = %task.file_id(), "Lease lost");
                false
            }
            Err(e) => {
                // The queue is unreachable; later settles stay token-guarded.
                tracing::warn!(file_id = %task.file_id(), error = %e, "Failed to renew lease");
                true
            }
        }
    }

    /// Interval between lease renewals while a task is held.
    pub fn renew_interval(&self) -> Duration {
        (self.config.lease / 3).max(MIN_RENEW_INTERVAL)
    }

    pub async fn touch_heartbeat(&self, file_id: &str) {
        if let Err(e) = self
            .deps
            .files
            .touch_heartbeat(file_id, &self.deps.worker_id)
            .await
        {
            tracing::warn!(file_id, error = %e, "Failed to refresh heartbeat");
        }
    }
}

/// Inputs needed to add AI workers after start.
struct AiSpawner {
    files_rx: SharedReceiver<LoadedFile>,
    results_tx: mpsc::Sender<TagResult>,
}

/// A running pipeline. Build with [`TaggingPipeline::start`], tear down with
/// [`TaggingPipeline::stop`].
pub struct TaggingPipeline {
    ctx: Arc<StageContext>,
    ai_spawned: AtomicUsize,
    ai_spawner: Mutex<Option<AiSpawner>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaggingPipeline {
    /// Spawn every stage with `ai_concurrency` AI workers.
    pub fn start(config: PipelineConfig, deps: PipelineDeps, ai_concurrency: usize) -> Arc<Self> {
        let ai_concurrency = ai_concurrency.max(1);
        let capacity = config.channel_capacity.max(1);
        let loaders = config.loader_workers.max(1);

        let ctx = Arc::new(StageContext {
            semaphore: DynamicSemaphore::new(ai_concurrency),
            stop: CancellationToken::new(),
            deps,
            config,
        });

        // Sized to the loader pool: a leased job waits for at most one load.
        let (tasks_tx, tasks_rx) = mpsc::channel::<LeasedTask>(loaders);
        let (files_tx, files_rx) = mpsc::channel::<LoadedFile>(capacity);
        let (results_tx, results_rx) = mpsc::channel::<TagResult>(capacity);
        let (batches_tx, batches_rx) = mpsc::channel::<Vec<TagResult>>(capacity);

        let tasks_rx: SharedReceiver<LeasedTask> = Arc::new(tokio::sync::Mutex::new(tasks_rx));
        let files_rx: SharedReceiver<LoadedFile> = Arc::new(tokio::sync::Mutex::new(files_rx));
        let batches_rx: SharedReceiver<Vec<TagResult>> =
            Arc::new(tokio::sync::Mutex::new(batches_rx));

        let mut handles = Vec::new();
        handles.push(tokio::spawn(fetcher::run(ctx.clone(), tasks_tx)));

        for worker in 0..loaders {
            handles.push(tokio::spawn(loader::run(
                ctx.clone(),
                worker,
                tasks_rx.clone(),
                files_tx.clone(),
            )));
        }
        drop(files_tx);

        for worker in 0..ai_concurrency {
            handles.push(tokio::spawn(caller::run(
                ctx.clone(),
                worker,
                files_rx.clone(),
                results_tx.clone(),
            )));
        }

        handles.push(tokio::spawn(saver::batch(
            ctx.config.save_batch_size,
            ctx.config.save_flush_interval,
            results_rx,
            batches_tx,
        )));
        for worker in 0..ctx.config.saver_workers.max(1) {
            handles.push(tokio::spawn(saver::run(
                ctx.clone(),
                worker,
                batches_rx.clone(),
            )));
        }

        tracing::info!(
            loaders = ctx.config.loader_workers,
            ai_workers = ai_concurrency,
            savers = ctx.config.saver_workers,
            "Tagging pipeline started"
        );

        Arc::new(Self {
            ctx,
            ai_spawned: AtomicUsize::new(ai_concurrency),
            ai_spawner: Mutex::new(Some(AiSpawner {
                files_rx,
                results_tx,
            })),
            handles: Mutex::new(handles),
        })
    }

    /// Change the AI concurrency limit. In-flight calls are never interrupted:
    /// a lower limit takes effect as they finish, a higher one spawns the
    /// missing workers.
    pub fn adjust_concurrency(&self, n: usize) {
        let n = n.max(1);
        self.ctx.semaphore.set_max(n);

        let spawned = self.ai_spawned.load(Ordering::SeqCst);
        if n > spawned && !self.ctx.is_stopping() {
            let spawner = self.ai_spawner.lock();
            if let Some(spawner) = spawner.as_ref() {
                let mut handles = self.handles.lock();
                for worker in spawned..n {
                    handles.push(tokio::spawn(caller::run(
                        self.ctx.clone(),
                        worker,
                        spawner.files_rx.clone(),
                        spawner.results_tx.clone(),
                    )));
                }
                self.ai_spawned.store(n, Ordering::SeqCst);
            }
        }
        tracing::info!(concurrency = n, "AI concurrency adjusted");
    }

    /// Current AI concurrency limit.
    pub fn concurrency(&self) -> usize {
        self.ctx.semaphore.max()
    }

    pub fn is_stopping(&self) -> bool {
        self.ctx.is_stopping()
    }

    /// Stop fetching and wait for every stage to drain.
    pub async fn stop(&self) {
        if self.ctx.stop.is_cancelled() && self.handles.lock().is_empty() {
            return;
        }
        tracing::info!("Stopping tagging pipeline");
        self.ctx.stop.cancel();
        self.ai_spawner.lock().take();

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Pipeline worker ended abnormally");
            }
        }
        tracing::info!("Tagging pipeline stopped");
    }
}
