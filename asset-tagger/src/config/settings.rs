//! Typed view over the runtime settings the tagging core reads.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Setting keys.
pub mod keys {
    pub const AI_ENABLED: &str = "ai.ai_enabled";
    pub const AUTO_PROCESSING_ENABLED: &str = "ai.ai_auto_processing_enabled";
    pub const CONCURRENCY: &str = "ai.ai_concurrency";
    pub const PENDING_STUCK_THRESHOLD_MINUTES: &str = "ai.pending_stuck_threshold_minutes";
    pub const JOB_RETENTION_DAYS: &str = "ai.ai_job_retention_days";
    pub const MISSING_FILE_POLICY: &str = "ai.missing_file_policy";
    pub const NSFW_THRESHOLD: &str = "ai.nsfw_threshold";
    pub const NSFW_POLICY: &str = "ai.nsfw_policy";
    pub const API_KEY: &str = "ai.ai_api_key";
    pub const BASE_URL: &str = "ai.ai_base_url";
    pub const MODEL: &str = "ai.ai_model";
    pub const REQUEST_TIMEOUT_SECS: &str = "ai.ai_request_timeout_secs";

    /// Keys stored as raw text instead of JSON.
    pub const HTML_KEYS: &[&str] = &["site.footer_html", "site.announcement_html"];

    /// Keys whose change requires rebuilding the vision client.
    pub const CLIENT_KEYS: &[&str] = &[API_KEY, BASE_URL, MODEL, REQUEST_TIMEOUT_SECS];
}

pub const DEFAULT_CONCURRENCY: usize = 3;
pub const DEFAULT_STUCK_THRESHOLD_MINUTES: i64 = 5;
pub const DEFAULT_JOB_RETENTION_DAYS: i64 = 14;
pub const DEFAULT_NSFW_THRESHOLD: f64 = 0.6;
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// What the loader does when a file's bytes cannot be found.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum MissingFilePolicy {
    /// Mark the file `ignored` and acknowledge the job.
    #[default]
    Drop,
    /// Reset the file to `none` with tries 0 and acknowledge the job.
    Ignore,
    /// Put the job back with a short delay.
    Retry,
}

/// What happens to a file the model classifies as NSFW.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum NsfwPolicy {
    DeleteOnNsfw,
    MarkOnly,
    #[default]
    Review,
}

/// Parse an enum-valued setting, falling back to its default on unknown input.
pub fn parse_or_default<T>(key: &str, raw: &str) -> T
where
    T: std::str::FromStr + Default + std::fmt::Display,
{
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            let fallback = T::default();
            tracing::warn!(key, value = raw, fallback = %fallback, "Unknown setting value, using default");
            fallback
        }
    }
}

/// Snapshot of every setting the tagging core consults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggingSettings {
    pub ai_enabled: bool,
    pub auto_processing_enabled: bool,
    pub concurrency: usize,
    pub pending_stuck_threshold_minutes: i64,
    pub job_retention_days: i64,
    pub missing_file_policy: MissingFilePolicy,
    pub nsfw_threshold: f64,
    pub nsfw_policy: NsfwPolicy,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub request_timeout_secs: u64,
}

impl Default for TaggingSettings {
    fn default() -> Self {
        Self {
            ai_enabled: false,
            auto_processing_enabled: true,
            concurrency: DEFAULT_CONCURRENCY,
            pending_stuck_threshold_minutes: DEFAULT_STUCK_THRESHOLD_MINUTES,
            job_retention_days: DEFAULT_JOB_RETENTION_DAYS,
            missing_file_policy: MissingFilePolicy::default(),
            nsfw_threshold: DEFAULT_NSFW_THRESHOLD,
            nsfw_policy: NsfwPolicy::default(),
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl TaggingSettings {
    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.pending_stuck_threshold_minutes.max(1) as u64 * 60)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_days.max(1) as u64 * 24 * 60 * 60)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("drop", MissingFilePolicy::Drop)]
    #[case("IGNORE", MissingFilePolicy::Ignore)]
    #[case(" Retry ", MissingFilePolicy::Retry)]
    #[case("explode", MissingFilePolicy::Drop)]
    fn test_missing_file_policy_parsing(#[case] raw: &str, #[case] expected: MissingFilePolicy) {
        assert_eq!(
            parse_or_default::<MissingFilePolicy>(keys::MISSING_FILE_POLICY, raw),
            expected
        );
    }

    #[rstest]
    #[case("delete_on_nsfw", NsfwPolicy::DeleteOnNsfw)]
    #[case("Mark_Only", NsfwPolicy::MarkOnly)]
    #[case("", NsfwPolicy::Review)]
    fn test_nsfw_policy_parsing(#[case] raw: &str, #[case] expected: NsfwPolicy) {
        assert_eq!(parse_or_default::<NsfwPolicy>(keys::NSFW_POLICY, raw), expected);
    }

    #[test]
    fn test_defaults() {
        let settings = TaggingSettings::default();
        assert!(!settings.ai_enabled);
        assert!(settings.auto_processing_enabled);
        assert_eq!(settings.concurrency, 3);
        assert_eq!(settings.missing_file_policy, MissingFilePolicy::Drop);
        assert_eq!(settings.stuck_threshold(), Duration::from_secs(300));
    }
}
