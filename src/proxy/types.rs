//! OpenAI-compatible request and response types, plus the upstream request shape.

use serde::{Deserialize, Serialize};

/// Fixed identifier stamped on every chunk and aggregate response.
pub const COMPLETION_ID: &str = "chatcmpl-123";

/// Fixed creation timestamp stamped on every chunk and aggregate response.
pub const COMPLETION_CREATED: u64 = 1677652288;

fn default_model() -> String {
    "gpt-4o".to_string()
}

/// Chat completion request (OpenAI-compatible).
///
/// Only the fields the relay acts on are modeled; anything else in the
/// client body is accepted and ignored.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Chat completion response (OpenAI-compatible), used for non-streaming replies.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

/// A completion choice.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: Option<String>,
}

/// Token usage statistics. The upstream reports none, so these stay zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Streaming chunk response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

/// A streaming choice delta.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

/// Delta content in streaming response.
///
/// The finish chunk repeats its reason inside the delta; existing consumers
/// of this relay read it from there.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// One entry of `GET /v1/models`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub name: String,
}

/// Body of `GET /v1/models`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelEntry>,
}

impl ModelList {
    pub fn from_ids(ids: &[String]) -> Self {
        Self {
            object: "list".to_string(),
            data: ids
                .iter()
                .map(|id| ModelEntry {
                    id: id.clone(),
                    name: id.clone(),
                })
                .collect(),
        }
    }
}

/// Request body sent to the upstream ask endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UpstreamRequest {
    /// Flattened transcript plus steering instruction.
    pub text: String,
    /// Endpoint family tag.
    pub endpoint: String,
    pub model: String,
}

impl ChatCompletionRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}
