//! AI result models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// `file_ai_info` row. List and map columns hold JSON text.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FileAiInfoDbModel {
    pub file_id: String,
    pub description: String,
    pub search_content: String,
    /// JSON array of strings
    pub semantic_keywords: String,
    /// JSON array of strings
    pub tags: String,
    pub dominant_color: String,
    /// JSON array of strings
    pub color_palette: String,
    pub objects_count: i64,
    pub composition: String,
    pub dimensions: String,
    pub resolution: String,
    pub is_nsfw: bool,
    pub nsfw_score: f64,
    /// JSON object of per-category scores
    pub nsfw_categories: String,
    pub nsfw_evaluation: String,
    pub nsfw_reason: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl FileAiInfoDbModel {
    /// Decoded `tags` column; malformed JSON yields an empty list.
    pub fn tag_list(&self) -> Vec<String> {
        serde_json::from_str(&self.tags).unwrap_or_default()
    }

    pub fn semantic_keyword_list(&self) -> Vec<String> {
        serde_json::from_str(&self.semantic_keywords).unwrap_or_default()
    }
}
