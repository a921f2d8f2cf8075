use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

const API_VERSION: &str = "2023-06-01";

/// Wire transport for one Messages API round trip.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, request: &MessagesRequest) -> Result<MessagesResponse>;
}

/// Anthropic Messages API over HTTPS.
pub struct ClaudeTransport {
    client: Client,
    api_url: String,
    api_key: String,
}

impl ClaudeTransport {
    pub fn new(api_url: &str, api_key: &str) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl MessageTransport for ClaudeTransport {
    async fn send(&self, request: &MessagesRequest) -> Result<MessagesResponse> {
        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let body = response.json::<MessagesResponse>().await?;
        Ok(body)
    }
}

fn network_error(e: reqwest::Error) -> AppError {
    if e.is_timeout() || e.is_connect() {
        AppError::LlmTransient(e.to_string())
    } else {
        AppError::Http(e)
    }
}

/// 408, 429 and every 5xx (including 529 overloaded) are worth retrying.
pub(crate) fn status_error(status: StatusCode, body: &str) -> AppError {
    let message = format!("API returned {status}: {body}");
    match status.as_u16() {
        408 | 429 | 500..=599 => AppError::LlmTransient(message),
        _ => AppError::LlmRejected(message),
    }
}

// --- Request types ---

#[derive(Debug, Clone, Serialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

// --- Response types ---

#[derive(Debug, Clone, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
    pub usage: Usage,
}

impl MessagesResponse {
    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        for code in [408, 429, 500, 502, 503, 529] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(status_error(status, "").is_transient(), "{code}");
        }
        for code in [400, 401, 403, 404, 422] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(
                matches!(status_error(status, ""), AppError::LlmRejected(_)),
                "{code}"
            );
        }
    }

    #[test]
    fn test_response_text_skips_other_blocks() {
        let raw = r#"{
            "id": "msg_1",
            "content": [
                {"type": "text", "text": "hello "},
                {"type": "thinking", "thinking": "..."},
                {"type": "text", "text": "world"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 3, "output_tokens": 2}
        }"#;
        let response: MessagesResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.text(), "hello world");
    }
}
