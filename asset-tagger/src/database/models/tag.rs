//! Tag and category models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TagDbModel {
    pub id: i64,
    pub name: String,
    pub usage_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CategoryDbModel {
    pub id: String,
    pub user_id: String,
    pub name: String,
    /// `user` or `ai_suggestion`
    pub source: String,
    pub file_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Origin marker stored on a `file_tags` relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagSource {
    Ai,
    User,
    /// Supplied by both a person and the model.
    UserAndAi,
}

impl TagSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::User => "user",
            Self::UserAndAi => "user,ai",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ai" => Some(Self::Ai),
            "user" => Some(Self::User),
            "user,ai" | "ai,user" => Some(Self::UserAndAi),
            _ => None,
        }
    }

    /// True when a person attached the tag, alone or together with the model.
    pub fn has_user(&self) -> bool {
        matches!(self, Self::User | Self::UserAndAi)
    }

    /// Marker after the model (re)suggests this tag.
    pub fn with_ai(&self) -> Self {
        match self {
            Self::Ai => Self::Ai,
            Self::User | Self::UserAndAi => Self::UserAndAi,
        }
    }
}

/// Category source value for categories the model suggested.
pub const CATEGORY_SOURCE_AI: &str = "ai_suggestion";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_source_merge() {
        assert_eq!(TagSource::User.with_ai(), TagSource::UserAndAi);
        assert_eq!(TagSource::Ai.with_ai(), TagSource::Ai);
        assert_eq!(TagSource::parse("ai,user"), Some(TagSource::UserAndAi));
        assert!(!TagSource::Ai.has_user());
    }
}
