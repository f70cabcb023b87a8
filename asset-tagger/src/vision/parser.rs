//! Tolerant decoding of model replies.
//!
//! Models answer with bare JSON, fenced JSON, or JSON buried in prose.
//! [`parse_analysis`] finds the first balanced object and decodes it; when
//! strict decoding fails it salvages the root `description`, `tags` and
//! `search_content` fields, plus `content_safety` when that block decodes.

use serde_json::Value;

use super::VisionAnalysis;
use crate::{Error, Result};

/// Remove a surrounding markdown code fence (```json ... ```), if any.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip the info string (`json`, `JSON`, ...) up to the first newline.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// The first balanced `{...}` in `text`, ignoring braces inside strings.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => s
            .split([',', '，'])
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn salvage(root: &Value) -> VisionAnalysis {
    let text = |key: &str| {
        root.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    VisionAnalysis {
        tags: string_list(root.get("tags")),
        description: text("description"),
        search_content: text("search_content"),
        category: root
            .get("category")
            .and_then(Value::as_str)
            .map(str::to_string),
        // Kept when well formed so NSFW gating survives a bad sibling field.
        content_safety: root
            .get("content_safety")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default(),
        ..Default::default()
    }
}

/// Decode a model reply into a [`VisionAnalysis`].
pub fn parse_analysis(reply: &str) -> Result<VisionAnalysis> {
    let unfenced = strip_code_fences(reply);
    let json = extract_json_object(unfenced)
        .ok_or_else(|| Error::ai("model reply contains no JSON object"))?;

    let analysis = match serde_json::from_str::<VisionAnalysis>(json) {
        Ok(analysis) => analysis,
        Err(strict_err) => {
            let root: Value = serde_json::from_str(json)
                .map_err(|e| Error::ai(format!("model reply is not valid JSON: {e}")))?;
            tracing::debug!(error = %strict_err, "Strict decode failed, salvaging root fields");
            salvage(&root)
        }
    };

    if analysis.is_empty() {
        return Err(Error::ai("model reply has neither tags nor description"));
    }
    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_reply() {
        let reply = "```json\n{\"tags\": [\"cat\"], \"description\": \"A cat\"}\n```";
        let analysis = parse_analysis(reply).unwrap();
        assert_eq!(analysis.tags, vec!["cat"]);
        assert_eq!(analysis.description, "A cat");
    }

    #[test]
    fn test_json_inside_prose_with_braces_in_strings() {
        let reply = r#"Sure! Here it is: {"description": "a {curly} sign", "tags": ["sign"]} hope that helps {"#;
        let analysis = parse_analysis(reply).unwrap();
        assert_eq!(analysis.description, "a {curly} sign");
    }

    #[test]
    fn test_full_structure() {
        let reply = r#"{
            "tags": ["beach", "sunset"],
            "category": "Travel",
            "description": "Sunset over a beach",
            "search_content": "beach sunset ocean",
            "semantic_keywords": ["vacation"],
            "basic_info": {"width": 800, "height": 600},
            "visual_elements": {"dominant_color": "orange", "color_palette": ["orange", "blue"], "objects_count": 2},
            "content_safety": {"is_nsfw": false, "nsfw_score": 0.01, "categories": {"nudity": 0.0}}
        }"#;
        let analysis = parse_analysis(reply).unwrap();
        assert_eq!(analysis.category.as_deref(), Some("Travel"));
        assert_eq!(analysis.basic_info.width, 800);
        assert_eq!(analysis.visual_elements.color_palette.len(), 2);
        assert_eq!(analysis.content_safety.categories["nudity"], 0.0);
    }

    #[test]
    fn test_salvages_root_fields_when_nested_types_are_wrong() {
        let reply = r#"{"tags": "dog, park", "description": "Dog in a park",
            "visual_elements": {"objects_count": "many"}}"#;
        let analysis = parse_analysis(reply).unwrap();
        assert_eq!(analysis.tags, vec!["dog", "park"]);
        assert_eq!(analysis.description, "Dog in a park");
        assert_eq!(analysis.visual_elements.objects_count, 0);
    }

    #[test]
    fn test_salvage_keeps_content_safety() {
        let reply = r#"{"tags": "a, b", "description": "Poster",
            "content_safety": {"is_nsfw": true, "nsfw_score": 0.92, "nsfw_reason": "nudity"}}"#;
        let analysis = parse_analysis(reply).unwrap();
        assert_eq!(analysis.tags, vec!["a", "b"]);
        assert!(analysis.content_safety.is_nsfw);
        assert_eq!(analysis.content_safety.nsfw_score, 0.92);

        let reply = r#"{"tags": "a", "description": "Poster",
            "content_safety": {"is_nsfw": "yes"}}"#;
        let analysis = parse_analysis(reply).unwrap();
        assert!(!analysis.content_safety.is_nsfw);
    }

    #[test]
    fn test_rejects_replies_without_content() {
        assert!(parse_analysis("I cannot help with that.").is_err());
        assert!(parse_analysis("{\"tags\": []}").is_err());
        assert!(parse_analysis("{\"tags\": [\"a\"").is_err());
    }
}
