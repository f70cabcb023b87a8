//! AI tagging service: lifecycle, result persistence and admin operations.

pub mod admin;
pub mod collaborators;
pub mod metrics;
pub mod persister;
pub mod service;
pub mod sweepers;

pub use admin::TaggingAdmin;
pub use collaborators::{
    ADMIN_TOPIC, BroadcastEnvelope, BroadcastMessage, Broadcaster, ChannelBroadcaster,
    FileDeleter, LocalFileDeleter, LogNotificationSink, NotificationSink,
};
pub use metrics::{MetricsTrigger, QueueStats, QueueStatsExt, RuntimeStats, StatsCollector};
pub use persister::{PersistOutcome, ResultPersister};
pub use service::{
    ModelFactory, OpenAiModelFactory, TaggingService, TaggingServiceConfig, TaggingServiceDeps,
};
