//! Shared fixtures for the integration tests: a migrated SQLite database in
//! a temp dir, a local object store, scripted vision models and helpers to
//! seed files and wait for asynchronous outcomes.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use asset_tagger::config::{SettingsService, TaggingSettings, keys};
use asset_tagger::database::models::{AiJobDbModel, FileDbModel};
use asset_tagger::database::repositories::{
    FileRepository, SqlxFileRepository, SqlxJobRepository, SqlxSettingsRepository,
    SqlxTaggingLogRepository,
};
use asset_tagger::database::{DbPool, init_pool, run_migrations};
use asset_tagger::pipeline::PipelineConfig;
use asset_tagger::queue::{DbJobQueue, JobQueue, MemoryJobQueue};
use asset_tagger::storage::{LocalObjectStore, ObjectReader, ObjectStoreGateway};
use asset_tagger::tagging::{
    ChannelBroadcaster, LocalFileDeleter, LogNotificationSink, ModelFactory, TaggingAdmin,
    TaggingService, TaggingServiceConfig, TaggingServiceDeps,
};
use asset_tagger::vision::{ContentSafety, VisionAnalysis, VisionModel, VisionRequest};
use asset_tagger::{Error, Result};

/// 1x1 PNG.
pub const PNG_BYTES: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

// ========== Scripted models ==========

#[derive(Debug, Clone)]
pub enum Script {
    Succeed(VisionAnalysis),
    Fail(String),
    /// First call waits `delay` and fails; later calls return `then` at once.
    SlowFirstFailure {
        delay: Duration,
        then: VisionAnalysis,
    },
}

/// A model that answers from a script and records how it was called.
pub struct ScriptedModel {
    script: Script,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    call_times: Mutex<Vec<Instant>>,
}

impl ScriptedModel {
    pub fn new(script: Script) -> Arc<Self> {
        Self::with_delay(script, Duration::ZERO)
    }

    pub fn with_delay(script: Script, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script,
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            call_times: Mutex::new(Vec::new()),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::new(Script::Succeed(safe_analysis()))
    }

    pub fn failing() -> Arc<Self> {
        Self::new(Script::Fail("model unavailable".into()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().clone()
    }
}

#[async_trait]
impl VisionModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn analyze(&self, request: &VisionRequest) -> Result<VisionAnalysis> {
        assert!(!request.base64_image.is_empty());
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().push(Instant::now());

        let delay = match &self.script {
            Script::SlowFirstFailure { delay, .. } if call == 0 => *delay,
            _ => self.delay,
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match &self.script {
            Script::Succeed(analysis) => Ok(analysis.clone()),
            Script::Fail(msg) => Err(Error::ai(msg.clone())),
            Script::SlowFirstFailure { .. } if call == 0 => Err(Error::ai("model timed out")),
            Script::SlowFirstFailure { then, .. } => Ok(then.clone()),
        }
    }
}

/// Hands out the same scripted model on every rebuild.
pub struct StaticModelFactory(pub Arc<ScriptedModel>);

impl ModelFactory for StaticModelFactory {
    fn build(&self, _settings: &TaggingSettings) -> Result<Arc<dyn VisionModel>> {
        Ok(self.0.clone())
    }
}

pub fn safe_analysis() -> VisionAnalysis {
    VisionAnalysis {
        tags: vec!["Cat".into(), "sofa".into(), "indoor".into()],
        category: Some("Animals".into()),
        description: "A cat sleeping on a sofa.".into(),
        search_content: "cat sofa sleeping".into(),
        semantic_keywords: vec!["pet".into()],
        ..Default::default()
    }
}

pub fn nsfw_analysis(score: f64) -> VisionAnalysis {
    VisionAnalysis {
        content_safety: ContentSafety {
            is_nsfw: true,
            nsfw_score: score,
            nsfw_reason: "explicit".into(),
            ..Default::default()
        },
        ..safe_analysis()
    }
}

// ========== In-memory provider ==========

/// Object reader backed by a map; keys follow the local layout.
#[derive(Default)]
pub struct MemoryObjectReader {
    objects: Mutex<HashMap<String, Bytes>>,
}

impl MemoryObjectReader {
    pub fn put(&self, key: &str, data: &[u8]) {
        self.objects
            .lock()
            .insert(key.to_string(), Bytes::copy_from_slice(data));
    }
}

#[async_trait]
impl ObjectReader for MemoryObjectReader {
    async fn read(&self, key: &str) -> Result<Bytes> {
        self.objects
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::object_not_found("memory", key))
    }

    fn uses_local_layout(&self) -> bool {
        true
    }
}

// ========== Fixture ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Db,
    Memory,
}

#[derive(Debug, Clone)]
pub struct FixtureOptions {
    pub backend: Backend,
    pub concurrency: usize,
    pub missing_file_policy: &'static str,
    pub nsfw_policy: &'static str,
    pub nsfw_threshold: f64,
    pub auto_processing: bool,
    /// Queue lease; `None` keeps the production default.
    pub lease: Option<Duration>,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            backend: Backend::Db,
            concurrency: 3,
            missing_file_policy: "drop",
            nsfw_policy: "review",
            nsfw_threshold: 0.6,
            auto_processing: true,
            lease: None,
        }
    }
}

pub fn test_service_config(options: &FixtureOptions) -> TaggingServiceConfig {
    let defaults = PipelineConfig::default();
    TaggingServiceConfig {
        pipeline: PipelineConfig {
            lease: options.lease.unwrap_or(defaults.lease),
            loader_workers: 4,
            saver_workers: 2,
            channel_capacity: 32,
            save_batch_size: 4,
            save_flush_interval: Duration::from_millis(20),
            idle_interval: Duration::from_millis(50),
            ..defaults
        },
        heartbeat_interval: Duration::from_secs(3600),
        retention_interval: Duration::from_secs(3600),
        reconcile_interval: Duration::from_secs(3600),
        metrics_gap: Duration::from_millis(50),
        settings_debounce: Duration::from_millis(20),
        ..TaggingServiceConfig::default()
    }
}

pub struct Fixture {
    _dir: TempDir,
    pub pool: DbPool,
    pub storage_root: PathBuf,
    pub files: Arc<dyn FileRepository>,
    pub queue: Arc<dyn JobQueue>,
    pub settings: Arc<SettingsService>,
    pub broadcaster: Arc<ChannelBroadcaster>,
    pub memory_reader: Arc<MemoryObjectReader>,
    pub model: Arc<ScriptedModel>,
    pub service: Arc<TaggingService>,
    pub admin: TaggingAdmin,
}

pub async fn setup_pool() -> (TempDir, DbPool) {
    let dir = tempfile::tempdir().expect("temp dir");
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("tagger.db").display());
    let pool = init_pool(&url).await.expect("Failed to create test pool");
    run_migrations(&pool).await.expect("Failed to run migrations");
    (dir, pool)
}

impl Fixture {
    /// Build the service without starting it.
    pub async fn build(model: Arc<ScriptedModel>, options: FixtureOptions) -> Self {
        let (dir, pool) = setup_pool().await;
        let storage_root = dir.path().join("data");
        std::fs::create_dir_all(&storage_root).expect("storage root");

        let settings = Arc::new(SettingsService::new(Arc::new(SqlxSettingsRepository::new(
            pool.clone(),
        ))));
        for (key, value) in [
            (keys::AI_ENABLED, json!(true)),
            (keys::AUTO_PROCESSING_ENABLED, json!(options.auto_processing)),
            (keys::CONCURRENCY, json!(options.concurrency)),
            (keys::MISSING_FILE_POLICY, json!(options.missing_file_policy)),
            (keys::NSFW_POLICY, json!(options.nsfw_policy)),
            (keys::NSFW_THRESHOLD, json!(options.nsfw_threshold)),
        ] {
            settings.set(key, value).await.expect("seed setting");
        }

        let files: Arc<dyn FileRepository> = Arc::new(SqlxFileRepository::new(pool.clone()));
        let queue: Arc<dyn JobQueue> = match options.backend {
            Backend::Db => Arc::new(DbJobQueue::new(
                Arc::new(SqlxJobRepository::new(pool.clone())),
                files.clone(),
                "test-worker",
            )),
            Backend::Memory => MemoryJobQueue::start(files.clone(), "test-worker"),
        };

        let local_store = Arc::new(LocalObjectStore::new(&storage_root));
        let memory_reader = Arc::new(MemoryObjectReader::default());
        let gateway = Arc::new(
            ObjectStoreGateway::new(local_store.clone()).with_reader("memory", memory_reader.clone()),
        );
        let broadcaster = Arc::new(ChannelBroadcaster::new(64));

        let service = TaggingService::new(
            TaggingServiceDeps {
                pool: pool.clone(),
                queue: queue.clone(),
                files: files.clone(),
                logs: Arc::new(SqlxTaggingLogRepository::new(pool.clone())),
                settings: settings.clone(),
                gateway,
                broadcaster: broadcaster.clone(),
                notifier: Arc::new(LogNotificationSink),
                deleter: Arc::new(LocalFileDeleter::new(local_store, files.clone())),
                models: Arc::new(StaticModelFactory(model.clone())),
                worker_id: "test-worker".into(),
            },
            test_service_config(&options),
        );
        let admin = TaggingAdmin::new(service.clone());

        Self {
            _dir: dir,
            pool,
            storage_root,
            files,
            queue,
            settings,
            broadcaster,
            memory_reader,
            model,
            service,
            admin,
        }
    }

    /// Build and start the service.
    pub async fn start(model: Arc<ScriptedModel>, options: FixtureOptions) -> Self {
        let fixture = Self::build(model, options).await;
        fixture.service.start().await.expect("service start");
        fixture
    }

    /// Insert a file whose thumbnail is stored under the local provider.
    pub async fn seed_file(&self, id: &str) -> FileDbModel {
        let key = format!("thumbnails/{id}.png");
        let path = self.storage_root.join(&key);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, PNG_BYTES).expect("write object");

        let mut file = FileDbModel::new(id, "user-1");
        file.local_thumb_path = Some(format!("{id}.png"));
        self.files.insert_file(&file).await.expect("insert file");
        file
    }

    /// Insert a file whose keys point at nothing.
    pub async fn seed_missing_file(&self, id: &str) -> FileDbModel {
        let mut file = FileDbModel::new(id, "user-1");
        file.local_thumb_path = Some(format!("{id}.png"));
        file.local_file_path = Some(format!("uploads/files/{id}.png"));
        self.files.insert_file(&file).await.expect("insert file");
        file
    }

    pub async fn insert(&self, file: &FileDbModel) {
        self.files.insert_file(file).await.expect("insert file");
    }

    pub fn object_path(&self, key: &str) -> PathBuf {
        self.storage_root.join(key)
    }

    pub async fn file(&self, id: &str) -> FileDbModel {
        self.files.get_file(id).await.expect("file row")
    }

    pub async fn job(&self, file_id: &str) -> Option<AiJobDbModel> {
        sqlx::query_as::<_, AiJobDbModel>("SELECT * FROM ai_job WHERE file_id = ?")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await
            .expect("job query")
    }

    pub async fn job_status(&self, file_id: &str) -> Option<String> {
        self.job(file_id).await.map(|j| j.status)
    }

    pub async fn count_logs(&self, event_type: &str) -> i64 {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM file_tagging_log WHERE type = ?")
                .bind(event_type)
                .fetch_one(&self.pool)
                .await
                .expect("log count");
        count
    }

    pub async fn shutdown(self) {
        self.service.shutdown().await;
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
