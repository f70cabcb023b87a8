//! Lifecycle owner of the queue consumer, pipeline and sweepers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::admin::TaggingAdmin;
use super::collaborators::{ADMIN_TOPIC, BroadcastMessage, Broadcaster, FileDeleter, NotificationSink};
use super::metrics::{DEFAULT_PUSH_GAP, MetricsTrigger, QueueStats, StatsCollector, spawn_metrics_pusher};
use super::persister::ResultPersister;
use super::sweepers::spawn_periodic;
use crate::config::events::{ALL_KEYS, DEFAULT_COALESCE_WINDOW};
use crate::config::{SettingsService, TaggingSettings, keys};
use crate::database::DbPool;
use crate::database::models::NewTaggingLog;
use crate::database::repositories::{FileRepository, TaggingLogRepository};
use crate::database::time::ms_before;
use crate::pipeline::{PipelineConfig, PipelineDeps, PipelineRuntime, TaggingPipeline};
use crate::queue::{EnqueueOutcome, JobQueue};
use crate::storage::ObjectStoreGateway;
use crate::vision::{ModelHandle, OpenAiVisionClient, VisionModel};
use crate::{Error, Result};

/// Builds the vision model from the current settings.
pub trait ModelFactory: Send + Sync {
    fn build(&self, settings: &TaggingSettings) -> Result<Arc<dyn VisionModel>>;
}

/// Production factory: an OpenAI-compatible HTTP client.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAiModelFactory;

impl ModelFactory for OpenAiModelFactory {
    fn build(&self, settings: &TaggingSettings) -> Result<Arc<dyn VisionModel>> {
        Ok(Arc::new(OpenAiVisionClient::from_settings(settings)?))
    }
}

/// Intervals of the background loops.
#[derive(Debug, Clone)]
pub struct TaggingServiceConfig {
    pub pipeline: PipelineConfig,
    pub heartbeat_interval: Duration,
    pub retention_interval: Duration,
    pub reconcile_interval: Duration,
    pub reconcile_batch: i64,
    pub metrics_gap: Duration,
    pub settings_debounce: Duration,
}

impl Default for TaggingServiceConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            heartbeat_interval: Duration::from_secs(60),
            retention_interval: Duration::from_secs(24 * 60 * 60),
            reconcile_interval: Duration::from_secs(15 * 60),
            reconcile_batch: 200,
            metrics_gap: DEFAULT_PUSH_GAP,
            settings_debounce: DEFAULT_COALESCE_WINDOW,
        }
    }
}

/// Everything the service is built from.
#[derive(Clone)]
pub struct TaggingServiceDeps {
    pub pool: DbPool,
    pub queue: Arc<dyn JobQueue>,
    pub files: Arc<dyn FileRepository>,
    pub logs: Arc<dyn TaggingLogRepository>,
    pub settings: Arc<SettingsService>,
    pub gateway: Arc<ObjectStoreGateway>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub notifier: Arc<dyn NotificationSink>,
    pub deleter: Arc<dyn FileDeleter>,
    pub models: Arc<dyn ModelFactory>,
    pub worker_id: String,
}

struct Running {
    pipeline: Arc<TaggingPipeline>,
    model: ModelHandle,
    sweepers: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct TaggingService {
    queue: Arc<dyn JobQueue>,
    files: Arc<dyn FileRepository>,
    logs: Arc<dyn TaggingLogRepository>,
    settings: Arc<SettingsService>,
    gateway: Arc<ObjectStoreGateway>,
    broadcaster: Arc<dyn Broadcaster>,
    models: Arc<dyn ModelFactory>,
    persister: Arc<ResultPersister>,
    runtime: Arc<PipelineRuntime>,
    concurrency: Arc<AtomicUsize>,
    stats: Arc<StatsCollector>,
    metrics: MetricsTrigger,
    worker_id: String,
    config: TaggingServiceConfig,
    running: tokio::sync::Mutex<Option<Running>>,
    listener_started: AtomicBool,
    shutdown: CancellationToken,
}

impl TaggingService {
    /// Construct the service and its metrics pusher. Nothing is fetched
    /// until [`TaggingService::start`].
    pub fn new(deps: TaggingServiceDeps, config: TaggingServiceConfig) -> Arc<Self> {
        let runtime = Arc::new(PipelineRuntime::default());
        let concurrency = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let stats = Arc::new(StatsCollector::new(
            deps.queue.clone(),
            deps.files.clone(),
            runtime.clone(),
            concurrency.clone(),
        ));
        let metrics = spawn_metrics_pusher(
            stats.clone(),
            deps.broadcaster.clone(),
            config.metrics_gap,
            shutdown.clone(),
        );
        let persister = Arc::new(ResultPersister::new(
            deps.pool,
            deps.settings.clone(),
            deps.notifier,
            deps.deleter,
        ));

        Arc::new(Self {
            queue: deps.queue,
            files: deps.files,
            logs: deps.logs,
            settings: deps.settings,
            gateway: deps.gateway,
            broadcaster: deps.broadcaster,
            models: deps.models,
            persister,
            runtime,
            concurrency,
            stats,
            metrics,
            worker_id: deps.worker_id,
            config,
            running: tokio::sync::Mutex::new(None),
            listener_started: AtomicBool::new(false),
            shutdown,
        })
    }

    /// Read settings fresh, start the pipeline when AI is enabled and begin
    /// following settings changes.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.spawn_settings_listener();
        let settings = self.settings.tagging_settings(true).await;
        if settings.ai_enabled {
            self.start_pipeline(&settings).await?;
        } else {
            tracing::info!("AI tagging disabled; waiting for settings change");
        }
        Ok(())
    }

    async fn start_pipeline(self: &Arc<Self>, settings: &TaggingSettings) -> Result<bool> {
        let mut running = self.running.lock().await;
        if running.is_some() || self.shutdown.is_cancelled() {
            return Ok(false);
        }

        let model = ModelHandle::new(self.models.build(settings)?);
        let concurrency = settings.concurrency.max(1);
        self.concurrency.store(concurrency, Ordering::SeqCst);
        if settings.auto_processing_enabled {
            self.runtime.resume();
        } else {
            self.runtime.pause();
        }

        let pipeline = TaggingPipeline::start(
            self.config.pipeline.clone(),
            PipelineDeps {
                queue: self.queue.clone(),
                files: self.files.clone(),
                gateway: self.gateway.clone(),
                settings: self.settings.clone(),
                model: model.clone(),
                persister: self.persister.clone(),
                runtime: self.runtime.clone(),
                metrics: self.metrics.clone(),
                worker_id: self.worker_id.clone(),
            },
            concurrency,
        );

        let sweepers = self.shutdown.child_token();
        let handles = self.spawn_sweepers(sweepers.clone());
        *running = Some(Running {
            pipeline,
            model,
            sweepers,
            handles,
        });

        tracing::info!(
            concurrency,
            paused = self.runtime.is_paused(),
            worker_id = %self.worker_id,
            "AI tagging service started"
        );
        self.metrics.trigger();
        Ok(true)
    }

    async fn stop_pipeline(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.sweepers.cancel();
        running.pipeline.stop().await;
        for handle in running.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Sweeper task ended abnormally");
            }
        }
        tracing::info!("AI tagging service stopped");
        self.metrics.trigger();
    }

    fn spawn_sweepers(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let heartbeat = {
            let this = Arc::downgrade(self);
            spawn_periodic(
                "heartbeat",
                self.config.heartbeat_interval,
                cancel.clone(),
                move || {
                    let this = this.clone();
                    async move {
                        if let Some(this) = this.upgrade() {
                            this.sweep_stale_pending().await?;
                        }
                        Ok(())
                    }
                },
            )
        };

        let retention = {
            let this = Arc::downgrade(self);
            spawn_periodic(
                "retention",
                self.config.retention_interval,
                cancel.clone(),
                move || {
                    let this = this.clone();
                    async move {
                        if let Some(this) = this.upgrade() {
                            this.cleanup_finished_jobs().await?;
                        }
                        Ok(())
                    }
                },
            )
        };

        let reconcile = {
            let this = Arc::downgrade(self);
            spawn_periodic(
                "reconcile",
                self.config.reconcile_interval,
                cancel,
                move || {
                    let this = this.clone();
                    async move {
                        if let Some(this) = this.upgrade() {
                            TaggingAdmin::new(this).reconcile().await?;
                        }
                        Ok(())
                    }
                },
            )
        };

        vec![heartbeat, retention, reconcile]
    }

    fn spawn_settings_listener(self: &Arc<Self>) {
        if self.listener_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut changes = self
            .settings
            .subscribe_coalesced(self.config.settings_debounce);
        let this: Weak<Self> = Arc::downgrade(self);
        let cancel = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let keys = tokio::select! {
                    _ = cancel.cancelled() => break,
                    batch = changes.recv() => match batch {
                        Some(keys) => keys,
                        None => break,
                    },
                };
                let Some(service) = this.upgrade() else {
                    break;
                };
                if let Err(e) = service.on_settings_changed(&keys).await {
                    tracing::warn!(error = %e, ?keys, "Failed to apply settings change");
                }
            }
            tracing::debug!("Settings listener stopped");
        });
    }

    async fn on_settings_changed(self: &Arc<Self>, changed: &[String]) -> Result<()> {
        let touches = |key: &str| changed.iter().any(|c| c == key || c == ALL_KEYS);
        let settings = self.settings.tagging_settings(true).await;
        tracing::debug!(?changed, "Applying settings change");

        if touches(keys::AI_ENABLED) {
            if settings.ai_enabled {
                if self.start_pipeline(&settings).await? {
                    // Pick up files that arrived while disabled.
                    TaggingAdmin::new(self.clone()).reconcile().await?;
                }
            } else {
                self.stop_pipeline().await;
                return Ok(());
            }
        }

        let running = self.running.lock().await;
        let Some(current) = running.as_ref() else {
            return Ok(());
        };

        if keys::CLIENT_KEYS.iter().any(|k| touches(k)) {
            current.model.replace(self.models.build(&settings)?);
        }
        drop(running);

        if touches(keys::AUTO_PROCESSING_ENABLED) {
            self.apply_auto_processing(settings.auto_processing_enabled);
        }
        if touches(keys::CONCURRENCY) {
            self.update_concurrency(settings.concurrency).await?;
        }
        Ok(())
    }

    /// Start the pipeline if settings allow and it is not running.
    pub async fn ensure_running(self: &Arc<Self>) -> Result<bool> {
        if self.running.lock().await.is_some() {
            return Ok(true);
        }
        let settings = self.settings.tagging_settings(true).await;
        if !settings.ai_enabled {
            return Ok(false);
        }
        self.start_pipeline(&settings).await?;
        Ok(true)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Queue one file. While paused the job just waits.
    pub async fn process_single_file(&self, file_id: &str) -> Result<EnqueueOutcome> {
        let outcome = self.queue.enqueue_unique(file_id, 0).await?;
        self.metrics.trigger();
        Ok(outcome)
    }

    /// Queue several files; returns `(enqueued, skipped)`.
    pub async fn batch_process_files(&self, file_ids: &[String]) -> Result<(usize, usize)> {
        self.enqueue_all(file_ids, 0).await
    }

    pub(crate) async fn enqueue_all(&self, file_ids: &[String], priority: i64) -> Result<(usize, usize)> {
        let mut enqueued = 0;
        for id in file_ids {
            if self.queue.enqueue_unique(id, priority).await?.is_enqueued() {
                enqueued += 1;
            }
        }
        if !file_ids.is_empty() {
            self.metrics.trigger();
        }
        Ok((enqueued, file_ids.len() - enqueued))
    }

    /// Change the AI concurrency target.
    pub async fn update_concurrency(&self, n: usize) -> Result<()> {
        if n == 0 {
            return Err(Error::validation("concurrency must be at least 1"));
        }
        self.concurrency.store(n, Ordering::SeqCst);
        if let Some(running) = self.running.lock().await.as_ref() {
            running.pipeline.adjust_concurrency(n);
        }
        self.metrics.trigger();
        Ok(())
    }

    pub fn pause(&self) {
        self.runtime.pause();
        tracing::info!("AI tagging paused");
        self.metrics.trigger();
    }

    /// Resume fetching, forget recent failures and announce it to admins.
    pub fn resume(&self) {
        self.runtime.resume();
        self.runtime.clear_failures();
        self.broadcaster.broadcast(
            ADMIN_TOPIC,
            BroadcastMessage::Announcement {
                message: "AI tagging resumed".to_string(),
            },
        );
        tracing::info!("AI tagging resumed");
        self.metrics.trigger();
    }

    /// Pause or resume only when the state actually changes.
    pub fn apply_auto_processing(&self, enabled: bool) {
        match (enabled, self.is_paused()) {
            (true, true) => self.resume(),
            (false, false) => self.pause(),
            _ => {}
        }
    }

    pub fn is_paused(&self) -> bool {
        self.runtime.is_paused()
    }

    /// Model failures within the trailing minute.
    pub fn recent_failures(&self) -> usize {
        self.runtime.recent_failures()
    }

    pub fn current_concurrency(&self) -> usize {
        self.concurrency.load(Ordering::SeqCst)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.stats.collect().await
    }

    /// True when nothing is inside the AI stage or leased from the queue.
    pub async fn pipeline_idle(&self) -> Result<bool> {
        if self.runtime.active_ai() > 0 {
            return Ok(false);
        }
        Ok(self.queue.metrics().await?.in_flight == 0)
    }

    /// Fail `pending` files whose heartbeat is older than the configured threshold.
    pub async fn sweep_stale_pending(&self) -> Result<u64> {
        let settings = self.settings.tagging_settings(false).await;
        self.fail_stale_pending(settings.stuck_threshold()).await
    }

    pub(crate) async fn fail_stale_pending(&self, threshold: Duration) -> Result<u64> {
        let count = self.files.fail_stale_pending(ms_before(threshold)).await?;
        if count > 0 {
            tracing::info!(count, ?threshold, "Reset stale pending files to failed");
            self.metrics.trigger();
        }
        Ok(count)
    }

    /// Drop finished jobs past the retention horizon.
    pub async fn cleanup_finished_jobs(&self) -> Result<u64> {
        let settings = self.settings.tagging_settings(false).await;
        let removed = self.queue.cleanup_terminal(settings.job_retention()).await?;
        if removed > 0 {
            tracing::info!(removed, "Removed finished jobs past retention");
        }
        Ok(removed)
    }

    pub(crate) async fn audit(&self, entry: NewTaggingLog) {
        if let Err(e) = self.logs.append(&entry).await {
            tracing::warn!(event = %entry.event_type, error = %e, "Failed to write tagging log");
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn files(&self) -> &Arc<dyn FileRepository> {
        &self.files
    }

    pub fn logs(&self) -> &Arc<dyn TaggingLogRepository> {
        &self.logs
    }

    pub fn settings(&self) -> &Arc<SettingsService> {
        &self.settings
    }

    pub fn config(&self) -> &TaggingServiceConfig {
        &self.config
    }

    /// Stop background loops, drain the pipeline and close the queue.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down AI tagging service");
        self.shutdown.cancel();
        self.stop_pipeline().await;
        self.queue.close().await;
    }
}
