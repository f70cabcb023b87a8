//! Service container: builds every component of the tagger and owns their
//! lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::AppState;
use crate::config::{ProcessConfig, SettingsService};
use crate::database::DbPool;
use crate::database::repositories::{
    FileRepository, SqlxFileRepository, SqlxSettingsRepository, SqlxTaggingLogRepository,
};
use crate::logging::LoggingConfig;
use crate::queue::build_queue;
use crate::storage::{LocalObjectStore, ObjectStoreGateway};
use crate::tagging::{
    ChannelBroadcaster, LocalFileDeleter, LogNotificationSink, OpenAiModelFactory, TaggingAdmin,
    TaggingService, TaggingServiceConfig, TaggingServiceDeps,
};
use crate::Result;

/// Capacity of the admin broadcast channel.
const DEFAULT_EVENT_CAPACITY: usize = 256;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Service container holding all application services.
pub struct ServiceContainer {
    pub pool: DbPool,
    pub settings: Arc<SettingsService>,
    pub broadcaster: Arc<ChannelBroadcaster>,
    pub tagging: Arc<TaggingService>,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Wire the tagger on top of an already migrated pool.
    pub async fn new(pool: DbPool, config: &ProcessConfig) -> Result<Self> {
        Self::with_config(pool, config, TaggingServiceConfig::default()).await
    }

    pub async fn with_config(
        pool: DbPool,
        config: &ProcessConfig,
        tagging_config: TaggingServiceConfig,
    ) -> Result<Self> {
        let settings = Arc::new(SettingsService::new(Arc::new(SqlxSettingsRepository::new(
            pool.clone(),
        ))));
        let files: Arc<dyn FileRepository> = Arc::new(SqlxFileRepository::new(pool.clone()));
        let queue = build_queue(
            config.queue_backend,
            pool.clone(),
            files.clone(),
            &config.worker_id,
            config.redis_url.as_deref(),
        )
        .await?;

        let local_store = Arc::new(LocalObjectStore::new(&config.storage_root));
        let gateway = Arc::new(ObjectStoreGateway::new(local_store.clone()));
        let broadcaster = Arc::new(ChannelBroadcaster::new(DEFAULT_EVENT_CAPACITY));

        let tagging = TaggingService::new(
            TaggingServiceDeps {
                pool: pool.clone(),
                queue,
                files: files.clone(),
                logs: Arc::new(SqlxTaggingLogRepository::new(pool.clone())),
                settings: settings.clone(),
                gateway,
                broadcaster: broadcaster.clone(),
                notifier: Arc::new(LogNotificationSink),
                deleter: Arc::new(LocalFileDeleter::new(local_store, files)),
                models: Arc::new(OpenAiModelFactory),
                worker_id: config.worker_id.clone(),
            },
            tagging_config,
        );

        info!(
            backend = %config.queue_backend,
            worker_id = %config.worker_id,
            storage_root = %config.storage_root.display(),
            "Services constructed"
        );

        Ok(Self {
            pool,
            settings,
            broadcaster,
            tagging,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Start background services.
    pub async fn initialize(&self) -> Result<()> {
        self.tagging.start().await
    }

    /// HTTP state for these services.
    pub fn app_state(&self, logging: Option<Arc<LoggingConfig>>) -> AppState {
        let state = AppState::new()
            .with_admin(TaggingAdmin::new(self.tagging.clone()))
            .with_broadcaster(self.broadcaster.clone());
        match logging {
            Some(config) => state.with_logging_config(config),
            None => state,
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Stop the tagger; the pool is closed even if draining times out.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);
        self.cancellation_token.cancel();

        if tokio::time::timeout(timeout, self.tagging.shutdown())
            .await
            .is_err()
        {
            warn!("Shutdown timeout reached, forcing shutdown");
        }

        info!("Closing database pool...");
        self.pool.close().await;
        info!("Services shut down");
        Ok(())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
