//! Paper rating client: prompt, one deterministic completion call, and normalization of
//! the model's answer into a [`RatingResult`].

use std::fmt;
use std::sync::{Arc, OnceLock};

use papersift_core::{ChineseAuthor, RatingResult};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub mod completion;
pub mod prompt;

pub use completion::{
    ChatCompletion, ChatEndpointConfig, ChatMessage, CompletionRequest, CompletionResponse,
    OpenAiCompatClient, TransportError,
};
pub use prompt::{rating_messages, Rubric};

pub const CRATE_NAME: &str = "papersift-rater";

/// Fixed sampling settings so repeated runs score the same paper alike.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub seed: u64,
}

impl Default for DecodingParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: 0.1,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    EmptyResponse,
    EmptyAfterStrip,
    MalformedJson,
    Transport,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::EmptyResponse => "EmptyResponse",
            FailureKind::EmptyAfterStrip => "EmptyAfterStrip",
            FailureKind::MalformedJson => "MalformedJSON",
            FailureKind::Transport => "TransportError",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum RatingError {
    #[error("completion returned no usable content")]
    EmptyResponse,
    #[error("completion content was empty after stripping wrappers")]
    EmptyAfterStrip,
    #[error("malformed rating JSON ({detail}); raw: {raw}")]
    MalformedJson { detail: String, raw: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RatingError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RatingError::EmptyResponse => FailureKind::EmptyResponse,
            RatingError::EmptyAfterStrip => FailureKind::EmptyAfterStrip,
            RatingError::MalformedJson { .. } => FailureKind::MalformedJson,
            RatingError::Transport(_) => FailureKind::Transport,
        }
    }
}

/// Shape the model is asked to return. Legacy key names are still accepted.
#[derive(Debug, Deserialize)]
struct RatingPayload {
    #[serde(default)]
    score: Option<i64>,
    summary: String,
    #[serde(default)]
    tag_primary: Option<String>,
    #[serde(default, alias = "contact_tag_primary")]
    contact_primary: Option<String>,
    #[serde(default)]
    tag_secondary: Option<String>,
    #[serde(default, alias = "contact_tag_secondary")]
    contact_secondary: Option<String>,
    #[serde(alias = "是否有华人")]
    has_chinese_author: ChineseAuthor,
}

fn control_token() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^<\|[^|>]*\|>").expect("static control token pattern"))
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &text[prefix.len()..])
}

/// Remove leading `<|...|>` control tokens and a surrounding Markdown code fence.
pub fn strip_wrappers(raw: &str) -> &str {
    let mut text = raw.trim();
    while let Some(token) = control_token().find(text) {
        text = text[token.end()..].trim_start();
    }

    if let Some(rest) = strip_prefix_ignore_case(text, "```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    text = text.trim();

    if let Some(rest) = text.strip_suffix("```") {
        text = rest.trim_end();
    }
    text
}

/// Decode stripped model output and attach the item identity.
pub fn decode_rating(text: &str, link: &str, period_label: &str) -> Result<RatingResult, RatingError> {
    let payload: RatingPayload =
        serde_json::from_str(text).map_err(|e| RatingError::MalformedJson {
            detail: e.to_string(),
            raw: text.to_string(),
        })?;

    Ok(RatingResult {
        score: payload.score,
        summary: payload.summary,
        tag_primary: payload.tag_primary,
        contact_primary: payload.contact_primary,
        tag_secondary: payload.tag_secondary,
        contact_secondary: payload.contact_secondary,
        has_chinese_author: payload.has_chinese_author,
        link: link.to_string(),
        period_label: period_label.to_string(),
    })
}

/// Normalize a raw completion into a rating or a classified failure.
pub fn interpret_response(
    response: &CompletionResponse,
    link: &str,
    period_label: &str,
) -> Result<RatingResult, RatingError> {
    let raw = response.first_content().ok_or(RatingError::EmptyResponse)?;
    let stripped = strip_wrappers(raw);
    if stripped.is_empty() {
        return Err(RatingError::EmptyAfterStrip);
    }
    decode_rating(stripped, link, period_label)
}

/// Built once per run and shared by every worker.
#[derive(Clone)]
pub struct RatingClient {
    completion: Arc<dyn ChatCompletion>,
    model: String,
    params: DecodingParams,
}

impl RatingClient {
    pub fn new(completion: Arc<dyn ChatCompletion>, model: impl Into<String>, params: DecodingParams) -> Self {
        Self {
            completion,
            model: model.into(),
            params,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One completion call, no retries.
    pub async fn rate(
        &self,
        rubric: &Rubric,
        link: &str,
        period_label: &str,
    ) -> Result<RatingResult, RatingError> {
        let request = CompletionRequest {
            model: self.model.clone(),
            messages: rating_messages(rubric, link),
            temperature: self.params.temperature,
            top_p: self.params.top_p,
            seed: self.params.seed,
        };
        let response = self.completion.complete(&request).await?;
        debug!(%link, content = ?response.first_content(), "rating response");
        interpret_response(&response, link, period_label)
    }
}

impl fmt::Debug for RatingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RatingClient")
            .field("model", &self.model)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}
