//! Settings service.
//!
//! Typed access to runtime settings with a TTL cache in front of the
//! `settings` table, a cache-bypassing `*_fresh` path for change handlers,
//! and change events on every write.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::Result;
use crate::database::repositories::SettingsRepository;

use super::cache::SettingsCache;
use super::events::{SettingsChangeEvent, SettingsEventBroadcaster, spawn_coalescer};
use super::settings::{
    DEFAULT_BASE_URL, DEFAULT_CONCURRENCY, DEFAULT_JOB_RETENTION_DAYS, DEFAULT_MODEL,
    DEFAULT_NSFW_THRESHOLD, DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_STUCK_THRESHOLD_MINUTES,
    MissingFilePolicy, NsfwPolicy, TaggingSettings, keys, parse_or_default,
};

/// Settings service providing cached, typed access to runtime settings.
pub struct SettingsService {
    repo: Arc<dyn SettingsRepository>,
    cache: SettingsCache,
    broadcaster: SettingsEventBroadcaster,
}

impl SettingsService {
    pub fn new(repo: Arc<dyn SettingsRepository>) -> Self {
        Self::with_cache(repo, SettingsCache::new())
    }

    pub fn with_cache(repo: Arc<dyn SettingsRepository>, cache: SettingsCache) -> Self {
        Self {
            repo,
            cache,
            broadcaster: SettingsEventBroadcaster::new(),
        }
    }

    // ========== Event Broadcasting ==========

    pub fn subscribe(&self) -> broadcast::Receiver<SettingsChangeEvent> {
        self.broadcaster.subscribe()
    }

    /// Batches of changed keys, coalesced over `window`.
    pub fn subscribe_coalesced(&self, window: Duration) -> mpsc::Receiver<Vec<String>> {
        spawn_coalescer(self.broadcaster.subscribe(), window)
    }

    // ========== Writes ==========

    /// Persist `value` for `key`, drop the cached copy and announce the change.
    pub async fn set(&self, key: &str, value: Value) -> Result<()> {
        let stored = normalize_for_storage(key, &value)?;
        self.repo.upsert_setting(key, &stored).await?;
        self.cache.invalidate(key);
        self.broadcaster.publish(SettingsChangeEvent::SettingChanged {
            key: key.to_string(),
        });
        Ok(())
    }

    // ========== Reads ==========

    async fn stored(&self, key: &str, fresh: bool) -> Option<String> {
        if !fresh && let Some(cached) = self.cache.get(key) {
            return cached;
        }

        match self.repo.get_setting(key).await {
            Ok(row) => {
                let value = row.map(|r| r.value);
                self.cache.insert(key, value.clone());
                value
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to read setting, using default");
                None
            }
        }
    }

    async fn value(&self, key: &str, fresh: bool) -> Option<Value> {
        self.stored(key, fresh)
            .await
            .map(|raw| decode_stored(key, &raw))
    }

    pub async fn get_string(&self, key: &str, default: &str) -> String {
        self.string_value(key, default, false).await
    }

    pub async fn get_string_fresh(&self, key: &str, default: &str) -> String {
        self.string_value(key, default, true).await
    }

    pub async fn get_int(&self, key: &str, default: i64) -> i64 {
        self.int_value(key, default, false).await
    }

    pub async fn get_int_fresh(&self, key: &str, default: i64) -> i64 {
        self.int_value(key, default, true).await
    }

    pub async fn get_float(&self, key: &str, default: f64) -> f64 {
        self.float_value(key, default, false).await
    }

    pub async fn get_float_fresh(&self, key: &str, default: f64) -> f64 {
        self.float_value(key, default, true).await
    }

    pub async fn get_bool(&self, key: &str, default: bool) -> bool {
        self.bool_value(key, default, false).await
    }

    pub async fn get_bool_fresh(&self, key: &str, default: bool) -> bool {
        self.bool_value(key, default, true).await
    }

    async fn string_value(&self, key: &str, default: &str, fresh: bool) -> String {
        match self.value(key, fresh).await {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => default.to_string(),
            Some(other) => other.to_string(),
        }
    }

    async fn int_value(&self, key: &str, default: i64, fresh: bool) -> i64 {
        self.value(key, fresh)
            .await
            .and_then(|v| value_as_i64(&v))
            .unwrap_or(default)
    }

    async fn float_value(&self, key: &str, default: f64, fresh: bool) -> f64 {
        self.value(key, fresh)
            .await
            .and_then(|v| value_as_f64(&v))
            .unwrap_or(default)
    }

    async fn bool_value(&self, key: &str, default: bool, fresh: bool) -> bool {
        self.value(key, fresh)
            .await
            .and_then(|v| value_as_bool(&v))
            .unwrap_or(default)
    }

    /// Snapshot of the tagging settings; `fresh` bypasses the cache.
    pub async fn tagging_settings(&self, fresh: bool) -> TaggingSettings {
        let concurrency = self
            .int_value(keys::CONCURRENCY, DEFAULT_CONCURRENCY as i64, fresh)
            .await;
        let threshold = self
            .float_value(keys::NSFW_THRESHOLD, DEFAULT_NSFW_THRESHOLD, fresh)
            .await;
        let missing = self
            .string_value(keys::MISSING_FILE_POLICY, "drop", fresh)
            .await;
        let nsfw_policy = self.string_value(keys::NSFW_POLICY, "review", fresh).await;
        let timeout = self
            .int_value(
                keys::REQUEST_TIMEOUT_SECS,
                DEFAULT_REQUEST_TIMEOUT_SECS as i64,
                fresh,
            )
            .await;

        TaggingSettings {
            ai_enabled: self.bool_value(keys::AI_ENABLED, false, fresh).await,
            auto_processing_enabled: self
                .bool_value(keys::AUTO_PROCESSING_ENABLED, true, fresh)
                .await,
            concurrency: if concurrency > 0 {
                concurrency as usize
            } else {
                DEFAULT_CONCURRENCY
            },
            pending_stuck_threshold_minutes: self
                .int_value(
                    keys::PENDING_STUCK_THRESHOLD_MINUTES,
                    DEFAULT_STUCK_THRESHOLD_MINUTES,
                    fresh,
                )
                .await,
            job_retention_days: self
                .int_value(keys::JOB_RETENTION_DAYS, DEFAULT_JOB_RETENTION_DAYS, fresh)
                .await,
            missing_file_policy: parse_or_default::<MissingFilePolicy>(
                keys::MISSING_FILE_POLICY,
                &missing,
            ),
            nsfw_threshold: if (0.0..=1.0).contains(&threshold) {
                threshold
            } else {
                DEFAULT_NSFW_THRESHOLD
            },
            nsfw_policy: parse_or_default::<NsfwPolicy>(keys::NSFW_POLICY, &nsfw_policy),
            api_key: self.string_value(keys::API_KEY, "", fresh).await,
            base_url: self
                .string_value(keys::BASE_URL, DEFAULT_BASE_URL, fresh)
                .await,
            model: self.string_value(keys::MODEL, DEFAULT_MODEL, fresh).await,
            request_timeout_secs: if timeout > 0 {
                timeout as u64
            } else {
                DEFAULT_REQUEST_TIMEOUT_SECS
            },
        }
    }
}

fn is_html_key(key: &str) -> bool {
    keys::HTML_KEYS.contains(&key)
}

/// Text stored for `value`: JSON, except strings under HTML keys which are kept raw.
pub fn normalize_for_storage(key: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) if is_html_key(key) => Ok(s.clone()),
        other => Ok(serde_json::to_string(other)?),
    }
}

/// Decode stored text; anything that is not valid JSON is treated as a plain string.
pub fn decode_stored(key: &str, raw: &str) -> Value {
    if is_html_key(key) {
        return Value::String(raw.to_string());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxSettingsRepository;
    use crate::database::test_pool;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("ai.ai_model", json!("gpt-4o"), r#""gpt-4o""#)]
    #[case("ai.ai_concurrency", json!(4), "4")]
    #[case("ai.ai_enabled", json!(true), "true")]
    #[case("site.footer_html", json!("<b>hi</b>"), "<b>hi</b>")]
    fn test_normalize_for_storage(#[case] key: &str, #[case] value: Value, #[case] stored: &str) {
        assert_eq!(normalize_for_storage(key, &value).unwrap(), stored);
    }

    #[test]
    fn test_decode_tolerates_legacy_plain_text() {
        assert_eq!(decode_stored("ai.ai_model", "gpt-4o"), json!("gpt-4o"));
        assert_eq!(decode_stored("ai.ai_concurrency", "5"), json!(5));
        assert_eq!(
            decode_stored("site.announcement_html", r#""quoted""#),
            json!(r#""quoted""#)
        );
    }

    #[tokio::test]
    async fn test_cached_and_fresh_reads() {
        let (_dir, pool) = test_pool().await;
        let repo = Arc::new(SqlxSettingsRepository::new(pool));
        let service = SettingsService::new(repo.clone());

        assert_eq!(service.get_int(keys::CONCURRENCY, 3).await, 3);

        // Written behind the service's back: cached read is stale, fresh read is not.
        repo.upsert_setting(keys::CONCURRENCY, "7").await.unwrap();
        assert_eq!(service.get_int(keys::CONCURRENCY, 3).await, 3);
        assert_eq!(service.get_int_fresh(keys::CONCURRENCY, 3).await, 7);
    }

    #[tokio::test]
    async fn test_set_invalidates_and_publishes() {
        let (_dir, pool) = test_pool().await;
        let service = SettingsService::new(Arc::new(SqlxSettingsRepository::new(pool)));
        let mut events = service.subscribe();

        assert!(!service.get_bool(keys::AI_ENABLED, false).await);
        service.set(keys::AI_ENABLED, json!(true)).await.unwrap();
        assert!(service.get_bool(keys::AI_ENABLED, false).await);

        let event = events.recv().await.unwrap();
        assert_eq!(event.key(), keys::AI_ENABLED);
    }

    #[tokio::test]
    async fn test_tagging_settings_snapshot() {
        let (_dir, pool) = test_pool().await;
        let service = SettingsService::new(Arc::new(SqlxSettingsRepository::new(pool)));
        service
            .set(keys::MISSING_FILE_POLICY, json!("Retry"))
            .await
            .unwrap();
        service.set(keys::NSFW_THRESHOLD, json!(0.8)).await.unwrap();
        service.set(keys::CONCURRENCY, json!("5")).await.unwrap();
        service.set(keys::NSFW_POLICY, json!("nonsense")).await.unwrap();

        let settings = service.tagging_settings(true).await;
        assert_eq!(settings.missing_file_policy, MissingFilePolicy::Retry);
        assert_eq!(settings.nsfw_threshold, 0.8);
        assert_eq!(settings.concurrency, 5);
        assert_eq!(settings.nsfw_policy, NsfwPolicy::Review);
        assert_eq!(settings.model, DEFAULT_MODEL);
    }
}
