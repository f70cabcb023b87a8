//! Settings change events.
//!
//! Every successful write publishes a [`SettingsChangeEvent`]. Listeners that
//! react to bursts of edits (an admin saving a whole form) subscribe through a
//! coalescer that batches keys over a short window.

use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

/// Default coalescing window.
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_millis(300);

/// Default channel capacity for settings events.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Marker key sent when a subscriber lagged and missed events.
pub const ALL_KEYS: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsChangeEvent {
    SettingChanged { key: String },
}

impl SettingsChangeEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::SettingChanged { key } => key,
        }
    }
}

/// Broadcaster for settings change events.
#[derive(Clone)]
pub struct SettingsEventBroadcaster {
    sender: broadcast::Sender<SettingsChangeEvent>,
}

impl SettingsEventBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettingsChangeEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; returns the number of receivers (0 when nobody listens).
    pub fn publish(&self, event: SettingsChangeEvent) -> usize {
        tracing::debug!(key = %event.key(), "Publishing settings change");
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for SettingsEventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a task that turns `receiver` into batches of distinct changed keys.
///
/// A batch opens with the first event and closes `window` later. A lagged
/// receiver contributes [`ALL_KEYS`]. The task ends when the broadcaster is
/// dropped or the returned receiver is closed.
pub fn spawn_coalescer(
    mut receiver: broadcast::Receiver<SettingsChangeEvent>,
    window: Duration,
) -> mpsc::Receiver<Vec<String>> {
    let (tx, rx) = mpsc::channel(16);

    tokio::spawn(async move {
        loop {
            let mut keys = BTreeSet::new();
            match receiver.recv().await {
                Ok(event) => {
                    keys.insert(event.key().to_string());
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    keys.insert(ALL_KEYS.to_string());
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }

            let deadline = Instant::now() + window;
            let mut closed = false;
            loop {
                match tokio::time::timeout_at(deadline, receiver.recv()).await {
                    Ok(Ok(event)) => {
                        keys.insert(event.key().to_string());
                    }
                    Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                        keys.insert(ALL_KEYS.to_string());
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) => {
                        closed = true;
                        break;
                    }
                    Err(_) => break,
                }
            }

            if tx.send(keys.into_iter().collect()).await.is_err() || closed {
                break;
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_is_coalesced_into_one_batch() {
        let broadcaster = SettingsEventBroadcaster::new();
        let mut batches = spawn_coalescer(broadcaster.subscribe(), Duration::from_millis(50));

        for key in ["ai.ai_concurrency", "ai.ai_model", "ai.ai_concurrency"] {
            broadcaster.publish(SettingsChangeEvent::SettingChanged {
                key: key.to_string(),
            });
        }

        let batch = batches.recv().await.unwrap();
        assert_eq!(batch, vec!["ai.ai_concurrency", "ai.ai_model"]);
    }

    #[tokio::test]
    async fn test_coalescer_stops_when_broadcaster_dropped() {
        let broadcaster = SettingsEventBroadcaster::new();
        let mut batches = spawn_coalescer(broadcaster.subscribe(), Duration::from_millis(10));
        drop(broadcaster);
        assert!(batches.recv().await.is_none());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let broadcaster = SettingsEventBroadcaster::new();
        let delivered = broadcaster.publish(SettingsChangeEvent::SettingChanged {
            key: "ai.ai_enabled".into(),
        });
        assert_eq!(delivered, 0);
    }
}
