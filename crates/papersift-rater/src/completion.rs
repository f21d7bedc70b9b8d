//! OpenAI-compatible chat-completion wire types and HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Volcengine Ark bots endpoint (OpenAI-compatible).
pub const DEFAULT_BASE_URL: &str = "https://ark.cn-beijing.volces.com/api/v3/bots";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub top_p: f32,
    pub seed: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

impl CompletionResponse {
    /// Build a single-choice response; handy for tests and replay.
    pub fn with_content(content: impl Into<String>) -> Self {
        Self {
            choices: vec![Choice {
                message: ChoiceMessage {
                    content: Some(content.into()),
                },
            }],
        }
    }

    /// Text of the first choice, if it has any non-blank content.
    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .filter(|text| !text.trim().is_empty())
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("completion request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("completion endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// One chat-completion round trip. Implementations must not retry.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ChatEndpointConfig {
    pub base_url: String,
    pub api_key: String,
    /// Upper bound on one rating call, connect through last body byte.
    pub timeout: Duration,
}

impl ChatEndpointConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(180),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl OpenAiCompatClient {
    pub fn new(config: ChatEndpointConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key,
        })
    }
}

#[async_trait]
impl ChatCompletion for OpenAiCompatClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, TransportError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, body });
        }

        Ok(response.json().await?)
    }
}
