//! Outbound seams of the tagging core and their default adapters.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::metrics::QueueStats;
use crate::Result;
use crate::database::models::{FileDbModel, FileStatus};
use crate::database::repositories::FileRepository;
use crate::storage::{KeyKind, LocalObjectStore, normalize_local_key};

/// Topic the admin websocket listens on.
pub const ADMIN_TOPIC: &str = "admin";

/// Notification template sent when a file is held for NSFW review.
pub const NSFW_REVIEW_TEMPLATE: &str = "file_pending_review";

/// Messages pushed to admin subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BroadcastMessage {
    QueueStats(QueueStats),
    Announcement { message: String },
}

/// A message together with the topic it was published on.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastEnvelope {
    pub topic: String,
    #[serde(flatten)]
    pub message: BroadcastMessage,
}

/// Fire-and-forget topic broadcast.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, topic: &str, message: BroadcastMessage);
}

/// In-process broadcaster; the websocket route subscribes to it.
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    sender: broadcast::Sender<BroadcastEnvelope>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEnvelope> {
        self.sender.subscribe()
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn broadcast(&self, topic: &str, message: BroadcastMessage) {
        // No subscribers is fine.
        let _ = self.sender.send(BroadcastEnvelope {
            topic: topic.to_string(),
            message,
        });
    }
}

/// Templated user messaging.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, user_id: &str, template: &str, params: serde_json::Value) -> Result<()>;
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(&self, user_id: &str, template: &str, params: serde_json::Value) -> Result<()> {
        tracing::info!(user_id, template, %params, "User notification");
        Ok(())
    }
}

/// Physical removal of a file flagged for deletion.
#[async_trait]
pub trait FileDeleter: Send + Sync {
    async fn delete_file(&self, file: &FileDbModel) -> Result<()>;
}

/// Removes stored objects under the local provider root, drops the file's
/// side tables and marks the row `deleted`.
pub struct LocalFileDeleter {
    store: Arc<LocalObjectStore>,
    files: Arc<dyn FileRepository>,
}

impl LocalFileDeleter {
    pub fn new(store: Arc<LocalObjectStore>, files: Arc<dyn FileRepository>) -> Self {
        Self { store, files }
    }
}

#[async_trait]
impl FileDeleter for LocalFileDeleter {
    async fn delete_file(&self, file: &FileDbModel) -> Result<()> {
        let keys = [
            (file.local_thumb_path.as_deref(), KeyKind::Thumbnail),
            (file.local_file_path.as_deref(), KeyKind::Original),
        ];
        for (key, kind) in keys {
            let Some(key) = key.filter(|k| !k.trim().is_empty()) else {
                continue;
            };
            let normalized = normalize_local_key(key, kind);
            let removed = self.store.remove(&normalized).await?;
            tracing::debug!(file_id = %file.id, key = %normalized, removed, "Removed stored object");
        }

        self.files.purge_side_tables(&file.id).await?;
        self.files
            .set_lifecycle_status(&file.id, FileStatus::Deleted)
            .await?;
        tracing::info!(file_id = %file.id, "File deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_broadcaster_envelope() {
        let broadcaster = ChannelBroadcaster::new(4);
        let mut rx = broadcaster.subscribe();
        broadcaster.broadcast(
            ADMIN_TOPIC,
            BroadcastMessage::Announcement {
                message: "resumed".into(),
            },
        );

        let envelope = rx.recv().await.unwrap();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["topic"], "admin");
        assert_eq!(json["type"], "announcement");
        assert_eq!(json["data"]["message"], "resumed");
    }
}
