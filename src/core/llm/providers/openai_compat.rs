//! Chat client for OpenAI-format endpoints. One instance covers OpenAI
//! itself plus the compatible vendors (Mistral, Groq, LM Studio style local
//! servers) by swapping base URL and display name.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tokio_util::io::StreamReader;

use crate::core::llm::{
    ChatMessage, ChatResponse, LlmConfig, LlmProvider, ProviderError, TokenUsage,
    DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE, DEFAULT_TOP_P,
};

use super::sse_data;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
    top_p: f64,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct Completion {
    model: Option<String>,
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: String,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Deserialize)]
struct StreamFrame {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let name = name.into();
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::new(&name, e))?;
        Ok(Self {
            name,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    fn request_body<'a>(
        &self,
        messages: &'a [ChatMessage],
        config: &'a LlmConfig,
        stream: bool,
    ) -> ChatRequest<'a> {
        ChatRequest {
            model: &config.model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: &m.role,
                    content: &m.content,
                })
                .collect(),
            temperature: config.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            top_p: config.top_p.unwrap_or(DEFAULT_TOP_P),
            stream,
        }
    }

    fn err(&self, message: impl ToString) -> ProviderError {
        ProviderError::new(&self.name, message)
    }

    async fn post_completions(
        &self,
        messages: &[ChatMessage],
        config: &LlmConfig,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let res = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.request_body(messages, config, stream))
            .send()
            .await
            .map_err(|e| self.err(e))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(self.err(format!("HTTP {}: {}", status, body)));
        }
        Ok(res)
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        config: &LlmConfig,
    ) -> Result<ChatResponse, ProviderError> {
        let res = self.post_completions(messages, config, false).await?;
        let parsed: Completion = res.json().await.map_err(|e| self.err(e))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| self.err("response contained no choices"))?;
        Ok(ChatResponse {
            content,
            model: parsed.model.unwrap_or_else(|| config.model.clone()),
            usage: parsed.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        })
    }

    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        config: &LlmConfig,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<ChatResponse, ProviderError> {
        let res = self.post_completions(messages, config, true).await?;

        // Read the SSE body line by line: "data: {...}" frames terminated by
        // a literal "data: [DONE]". Malformed frames are skipped, not fatal.
        let stream = res.bytes_stream().map(|r| r.map_err(std::io::Error::other));
        let mut reader = BufReader::new(StreamReader::new(stream));
        let mut line = String::new();
        let mut content = String::new();
        let mut model = String::new();

        loop {
            line.clear();
            let n = reader.read_line(&mut line).await.map_err(|e| self.err(e))?;
            if n == 0 {
                break; // EOF
            }
            let Some(data) = sse_data(line.trim()) else {
                continue;
            };
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                break;
            }
            let Ok(frame) = serde_json::from_str::<StreamFrame>(data) else {
                tracing::debug!("skipping malformed stream frame from {}", self.name);
                continue;
            };
            if let Some(m) = frame.model {
                model = m;
            }
            if let Some(delta) = frame
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta.content)
            {
                if !delta.is_empty() {
                    content.push_str(&delta);
                    on_chunk(&delta);
                }
            }
        }

        Ok(ChatResponse {
            content,
            model: if model.is_empty() {
                config.model.clone()
            } else {
                model
            },
            usage: None,
        })
    }

    async fn is_available(&self) -> bool {
        self.client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map(|res| res.status().is_success())
            .unwrap_or(false)
    }
}
