//! Remote vision model: request/response types and the model seam.
//!
//! The pipeline talks to a [`VisionModel`]; production uses
//! [`OpenAiVisionClient`], tests plug in scripted models.

mod client;
mod parser;

pub use client::OpenAiVisionClient;
pub use parser::{extract_json_object, parse_analysis, strip_code_fences};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::Result;

/// Instruction sent alongside every image.
pub const DEFAULT_PROMPT: &str = r#"Analyze this image and answer with a single JSON object, no prose:
{
  "tags": ["5-12 short lowercase tags"],
  "category": "one broad category name",
  "description": "one or two sentences",
  "search_content": "keywords a user might search for",
  "semantic_keywords": ["related concepts"],
  "basic_info": {"width": 0, "height": 0, "aspect_ratio": "", "resolution": "", "image_type": "", "estimated_size": ""},
  "visual_elements": {"dominant_color": "", "color_palette": [], "objects_count": 0, "composition": ""},
  "content_safety": {"is_nsfw": false, "nsfw_score": 0.0, "nsfw_reason": "", "evaluation_result": "",
    "categories": {"nudity": 0.0, "violence": 0.0, "hate_speech": 0.0, "gambling": 0.0, "alcohol_tobacco": 0.0}}
}"#;

/// One image to analyze.
#[derive(Debug, Clone)]
pub struct VisionRequest {
    pub base64_image: String,
    /// Image format such as `png` or `jpeg`.
    pub format: String,
    pub prompt: String,
}

impl VisionRequest {
    pub fn new(base64_image: String, format: impl Into<String>) -> Self {
        Self {
            base64_image,
            format: format.into(),
            prompt: DEFAULT_PROMPT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicInfo {
    pub width: i64,
    pub height: i64,
    pub aspect_ratio: String,
    pub resolution: String,
    pub image_type: String,
    pub estimated_size: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualElements {
    pub dominant_color: String,
    pub color_palette: Vec<String>,
    pub objects_count: i64,
    pub composition: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentSafety {
    pub is_nsfw: bool,
    pub nsfw_score: f64,
    pub nsfw_reason: String,
    pub evaluation_result: String,
    /// Per-kind scores: nudity, violence, hate_speech, gambling, alcohol_tobacco.
    pub categories: BTreeMap<String, f64>,
}

impl ContentSafety {
    /// Final verdict: `nsfw_score >= threshold`. A score outside `0..=1`
    /// is not trusted and the model's own boolean is used instead.
    pub fn is_nsfw_at(&self, threshold: f64) -> bool {
        if self.nsfw_score.is_finite() && (0.0..=1.0).contains(&self.nsfw_score) {
            self.nsfw_score >= threshold
        } else {
            self.is_nsfw
        }
    }
}

/// Structured result of analyzing one image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionAnalysis {
    pub tags: Vec<String>,
    pub category: Option<String>,
    pub description: String,
    pub search_content: String,
    pub semantic_keywords: Vec<String>,
    pub basic_info: BasicInfo,
    pub visual_elements: VisualElements,
    pub content_safety: ContentSafety,
}

impl VisionAnalysis {
    /// Trimmed, lowercased, de-duplicated tags in first-seen order.
    pub fn normalized_tags(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.tags
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty() && seen.insert(t.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.iter().all(|t| t.trim().is_empty()) && self.description.trim().is_empty()
    }
}

/// Classification and tagging backend.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &str;

    async fn analyze(&self, request: &VisionRequest) -> Result<VisionAnalysis>;
}

/// Swappable model shared by the AI workers. Settings changes replace the
/// model without restarting the pipeline.
#[derive(Clone)]
pub struct ModelHandle {
    inner: Arc<RwLock<Arc<dyn VisionModel>>>,
}

impl ModelHandle {
    pub fn new(model: Arc<dyn VisionModel>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(model)),
        }
    }

    pub fn current(&self) -> Arc<dyn VisionModel> {
        self.inner.read().clone()
    }

    pub fn replace(&self, model: Arc<dyn VisionModel>) {
        let name = model.name().to_string();
        *self.inner.write() = model;
        tracing::info!(model = %name, "Vision model replaced");
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model", &self.current().name())
            .finish()
    }
}
