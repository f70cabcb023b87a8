//! Tagging audit log models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// `file_tagging_log` row (append-only).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TaggingLogDbModel {
    pub id: i64,
    pub file_id: Option<String>,
    /// Short tag: reset, retry, ignore, unignore, trigger, scheduled
    pub status: String,
    /// auto or manual
    pub action: String,
    /// Dotted event name, e.g. `tagging.retry`
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub event_type: String,
    /// JSON blob
    pub data: String,
    pub operator_id: Option<String>,
    pub duration: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Whether an audit event came from a background task or an operator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    Auto,
    Manual,
}

impl LogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

/// A log row about to be appended.
#[derive(Debug, Clone)]
pub struct NewTaggingLog {
    pub file_id: Option<String>,
    pub status: String,
    pub action: LogAction,
    pub event_type: String,
    pub data: serde_json::Value,
    pub operator_id: Option<String>,
    pub duration_ms: i64,
}

impl NewTaggingLog {
    pub fn new(status: impl Into<String>, action: LogAction, event_type: impl Into<String>) -> Self {
        Self {
            file_id: None,
            status: status.into(),
            action,
            event_type: event_type.into(),
            data: serde_json::Value::Object(Default::default()),
            operator_id: None,
            duration_ms: 0,
        }
    }

    pub fn with_file(mut self, file_id: impl Into<String>) -> Self {
        self.file_id = Some(file_id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_operator(mut self, operator_id: Option<String>) -> Self {
        self.operator_id = operator_id;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}
