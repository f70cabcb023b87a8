//! OpenAI-compatible chat-completions client.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{VisionAnalysis, VisionModel, VisionRequest, parse_analysis};
use crate::config::TaggingSettings;
use crate::utils::http_client::build_client;
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Vision model reached through `POST {base_url}/chat/completions`.
pub struct OpenAiVisionClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiVisionClient {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let base = base_url.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(Error::config("AI base URL is empty"));
        }
        Ok(Self {
            http: build_client(timeout)?,
            endpoint: format!("{base}/chat/completions"),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    pub fn from_settings(settings: &TaggingSettings) -> Result<Self> {
        Self::new(
            &settings.base_url,
            settings.api_key.clone(),
            settings.model.clone(),
            settings.request_timeout(),
        )
    }

    fn body(&self, request: &VisionRequest) -> serde_json::Value {
        let data_url = format!(
            "data:image/{};base64,{}",
            request.format, request.base64_image
        );
        json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": request.prompt},
                    {"type": "image_url", "image_url": {"url": data_url}}
                ]
            }]
        })
    }
}

#[async_trait]
impl VisionModel for OpenAiVisionClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn analyze(&self, request: &VisionRequest) -> Result<VisionAnalysis> {
        let mut builder = self.http.post(&self.endpoint).json(&self.body(request));
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let detail: String = detail.chars().take(300).collect();
            return Err(Error::ai(format!("model endpoint returned {status}: {detail}")));
        }

        let chat: ChatResponse = response.json().await?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::ai("model reply has no content"))?;

        parse_analysis(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_and_body() {
        let client = OpenAiVisionClient::new(
            "https://example.test/v1/",
            "k",
            "vision-small",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(client.endpoint, "https://example.test/v1/chat/completions");

        let body = client.body(&VisionRequest::new("QUJD".into(), "png"));
        assert_eq!(body["model"], "vision-small");
        assert_eq!(
            body["messages"][0]["content"][1]["image_url"]["url"],
            "data:image/png;base64,QUJD"
        );
    }

    #[test]
    fn test_rejects_empty_base_url() {
        assert!(OpenAiVisionClient::new(" ", "", "m", Duration::from_secs(1)).is_err());
    }
}
