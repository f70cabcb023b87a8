//! API request and response models (DTOs).
//!
//! Response bodies of the admin operations are the result types in
//! [`crate::tagging::admin`]; this module holds the request side plus the
//! range checks applied before any operation runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::database::models::TaggingLogDbModel;
use crate::database::time::ms_to_datetime;
use crate::tagging::admin::{
    MAX_FILE_IDS, MAX_LOG_LIMIT, MAX_RETRY_FAILED_LIMIT, MIN_STUCK_THRESHOLD_MINUTES, TaggingLogPage,
};

/// `POST /trigger`
///
/// ```json
/// { "max_files": 100 }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerRequest {
    pub max_files: i64,
}

impl TriggerRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.max_files < 0 {
            return Err(ApiError::validation("max_files must be >= 0"));
        }
        Ok(())
    }
}

/// `POST /retry-failed`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryFailedRequest {
    #[serde(default)]
    pub limit: Option<i64>,
}

impl RetryFailedRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        match self.limit {
            Some(limit) if !(1..=MAX_RETRY_FAILED_LIMIT).contains(&limit) => Err(
                ApiError::validation(format!("limit must be between 1 and {MAX_RETRY_FAILED_LIMIT}")),
            ),
            _ => Ok(()),
        }
    }
}

/// Body of `/retry`, `/ignore` and `/unignore`.
#[derive(Debug, Clone, Deserialize)]
pub struct FileIdsRequest {
    pub file_ids: Vec<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl FileIdsRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.file_ids.is_empty() {
            return Err(ApiError::validation("file_ids must not be empty"));
        }
        if self.file_ids.len() > MAX_FILE_IDS {
            return Err(ApiError::validation(format!(
                "at most {MAX_FILE_IDS} file_ids per request"
            )));
        }
        Ok(())
    }
}

/// `POST /reset-stuck`
#[derive(Debug, Clone, Deserialize)]
pub struct ResetStuckRequest {
    pub time_threshold_minutes: i64,
}

impl ResetStuckRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.time_threshold_minutes < MIN_STUCK_THRESHOLD_MINUTES {
            return Err(ApiError::validation(format!(
                "time_threshold_minutes must be >= {MIN_STUCK_THRESHOLD_MINUTES}"
            )));
        }
        Ok(())
    }
}

/// `POST /concurrency`
#[derive(Debug, Clone, Deserialize)]
pub struct ConcurrencyRequest {
    pub concurrency: i64,
}

impl ConcurrencyRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.concurrency < 1 {
            return Err(ApiError::validation("concurrency must be >= 1"));
        }
        Ok(())
    }
}

/// Body and response of `POST /auto-processing`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoProcessingBody {
    pub enabled: bool,
}

/// Response of `/pause` and `/resume`.
#[derive(Debug, Clone, Serialize)]
pub struct PauseStateResponse {
    pub paused: bool,
}

/// `GET /logs` query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogsQuery {
    pub file_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl LogsQuery {
    pub fn validate(&self) -> Result<(), ApiError> {
        if let Some(limit) = self.limit
            && !(1..=MAX_LOG_LIMIT).contains(&limit)
        {
            return Err(ApiError::validation(format!(
                "limit must be between 1 and {MAX_LOG_LIMIT}"
            )));
        }
        if self.offset.is_some_and(|o| o < 0) {
            return Err(ApiError::validation("offset must be >= 0"));
        }
        Ok(())
    }
}

/// One audit row as returned by `GET /logs`.
#[derive(Debug, Clone, Serialize)]
pub struct TaggingLogResponse {
    pub id: i64,
    pub file_id: Option<String>,
    pub status: String,
    pub action: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    pub operator_id: Option<String>,
    pub duration: i64,
    pub created_at: DateTime<Utc>,
}

impl From<TaggingLogDbModel> for TaggingLogResponse {
    fn from(row: TaggingLogDbModel) -> Self {
        // Rows written by older code may carry plain text instead of JSON.
        let data = serde_json::from_str(&row.data)
            .unwrap_or_else(|_| serde_json::Value::String(row.data.clone()));
        Self {
            id: row.id,
            file_id: row.file_id,
            status: row.status,
            action: row.action,
            event_type: row.event_type,
            data,
            operator_id: row.operator_id,
            duration: row.duration,
            created_at: ms_to_datetime(row.created_at),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaggingLogPageResponse {
    pub items: Vec<TaggingLogResponse>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

impl From<TaggingLogPage> for TaggingLogPageResponse {
    fn from(page: TaggingLogPage) -> Self {
        Self {
            items: page.items.into_iter().map(Into::into).collect(),
            total: page.total,
            limit: page.limit,
            offset: page.offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ranges() {
        assert!(TriggerRequest { max_files: 0 }.validate().is_ok());
        assert!(TriggerRequest { max_files: -1 }.validate().is_err());

        assert!(RetryFailedRequest { limit: None }.validate().is_ok());
        assert!(RetryFailedRequest { limit: Some(1000) }.validate().is_ok());
        assert!(RetryFailedRequest { limit: Some(1001) }.validate().is_err());
        assert!(RetryFailedRequest { limit: Some(0) }.validate().is_err());

        assert!(ResetStuckRequest { time_threshold_minutes: 4 }.validate().is_err());
        assert!(ConcurrencyRequest { concurrency: 0 }.validate().is_err());
    }

    #[test]
    fn test_file_ids_request_deserialize() {
        let req: FileIdsRequest = serde_json::from_str(r#"{"file_ids": ["a", "b"]}"#).unwrap();
        assert_eq!(req.file_ids.len(), 2);
        assert!(req.reason.is_none());
        assert!(req.validate().is_ok());

        let empty: FileIdsRequest = serde_json::from_str(r#"{"file_ids": []}"#).unwrap();
        let err = empty.validate().unwrap_err();
        assert_eq!(err.code, "VALIDATION_ERROR");
    }

    #[test]
    fn test_log_response_parses_data_and_time() {
        let row = TaggingLogDbModel {
            id: 7,
            file_id: Some("f1".into()),
            status: "retry".into(),
            action: "manual".into(),
            event_type: "tagging.retry".into(),
            data: r#"{"reason":"blurry"}"#.into(),
            operator_id: Some("op".into()),
            duration: 12,
            created_at: 1_700_000_000_000,
            updated_at: 1_700_000_000_000,
        };
        let response = TaggingLogResponse::from(row);
        assert_eq!(response.data["reason"], "blurry");
        assert_eq!(response.created_at.timestamp_millis(), 1_700_000_000_000);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["type"], "tagging.retry");
    }
}
