//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[cfg(feature = "redis-backend")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Object not found: {key} (provider {provider_id})")]
    ObjectNotFound { provider_id: String, key: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("AI model error: {0}")]
    AiResponse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Pipeline is stopping")]
    PipelineStopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn object_not_found(provider_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self::ObjectNotFound {
            provider_id: provider_id.into(),
            key: key.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn ai(msg: impl Into<String>) -> Self {
        Self::AiResponse(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// True when the object store reported that the requested bytes do not exist.
    pub fn is_object_not_found(&self) -> bool {
        matches!(self, Self::ObjectNotFound { .. })
    }

    /// True for a missing database entity (as opposed to a missing object).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_discrimination() {
        let missing_object = Error::object_not_found("local", "files/a.png");
        assert!(missing_object.is_object_not_found());
        assert!(!missing_object.is_not_found());

        let missing_row = Error::not_found("File", "abc");
        assert!(missing_row.is_not_found());
        assert!(!missing_row.is_object_not_found());
        assert_eq!(
            missing_row.to_string(),
            "Entity not found: File with id abc"
        );
    }
}
