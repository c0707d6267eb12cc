pub mod providers;
pub mod registry;

pub use registry::{ProviderRegistry, RegistryError, ResolvedProvider};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported provider vendors. `as_str` values are the stored wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
    Mistral,
    Groq,
    Local,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Mistral => "mistral",
            ProviderKind::Groq => "groq",
            ProviderKind::Local => "local",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "openai" => Some(ProviderKind::OpenAi),
            "anthropic" => Some(ProviderKind::Anthropic),
            "gemini" => Some(ProviderKind::Gemini),
            "mistral" => Some(ProviderKind::Mistral),
            "groq" => Some(ProviderKind::Groq),
            "local" => Some(ProviderKind::Local),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
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

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 2048;
pub const DEFAULT_TOP_P: f64 = 1.0;

/// Per-call generation settings. Unset numeric fields fall back to the
/// provider defaults above.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
}

impl LlmConfig {
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            max_tokens: None,
            top_p: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
}

/// Normalized provider failure. Raw transport and vendor wire errors never
/// cross this boundary.
#[derive(Debug, Clone, Error)]
#[error("{provider} request failed: {message}")]
pub struct ProviderError {
    pub provider: String,
    pub message: String,
}

impl ProviderError {
    pub fn new(provider: impl Into<String>, message: impl ToString) -> Self {
        Self {
            provider: provider.into(),
            message: message.to_string(),
        }
    }
}

/// Uniform chat interface over one vendor endpoint.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Single request/response completion.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        config: &LlmConfig,
    ) -> Result<ChatResponse, ProviderError>;

    /// Streaming completion. Each incremental text delta is handed to
    /// `on_chunk` before the next frame is read; the returned content is the
    /// concatenation of all deltas in receipt order.
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        config: &LlmConfig,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<ChatResponse, ProviderError>;

    /// Short-timeout liveness probe. Never errors; any failure is `false`.
    async fn is_available(&self) -> bool;
}
