//! Chat client for the Gemini `generateContent` API.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::llm::{
    ChatMessage, ChatResponse, LlmConfig, LlmProvider, ProviderError, DEFAULT_MAX_TOKENS,
    DEFAULT_TEMPERATURE, DEFAULT_TOP_P,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct GeminiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f64,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    #[serde(rename = "topP")]
    top_p: f64,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiResContent,
}

#[derive(Deserialize)]
struct GeminiResContent {
    parts: Vec<GeminiResPart>,
}

#[derive(Deserialize)]
struct GeminiResPart {
    text: String,
}

pub struct GeminiProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: Client,
}

impl GeminiProvider {
    pub fn new(
        api_key: impl Into<String>,
        base_url: Option<String>,
    ) -> Result<Self, ProviderError> {
        let name = "gemini".to_string();
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::new(&name, e))?;
        Ok(Self {
            name,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    fn err(&self, message: impl ToString) -> ProviderError {
        ProviderError::new(&self.name, message)
    }

    /// Map an ordered chat transcript onto Gemini's shape: leading system
    /// messages become `system_instruction`, later system messages are
    /// folded into user turns, and consecutive same-role turns are merged
    /// because Gemini requires strict alternation.
    fn build_contents(messages: &[ChatMessage]) -> (Option<GeminiContent>, Vec<GeminiContent>) {
        let mut contents: Vec<GeminiContent> = Vec::new();
        let mut system_instruction: Option<GeminiContent> = None;
        let mut past_first_non_system = false;

        for m in messages {
            if m.role == "system" && !past_first_non_system {
                if let Some(si) = system_instruction.as_mut() {
                    if let Some(part) = si.parts.first_mut() {
                        part.text.push('\n');
                        part.text.push_str(&m.content);
                    }
                } else {
                    system_instruction = Some(GeminiContent {
                        role: "user".to_string(),
                        parts: vec![GeminiPart {
                            text: m.content.clone(),
                        }],
                    });
                }
                continue;
            }

            let (role, text) = if m.role == "system" {
                ("user", format!("[SYSTEM] {}", m.content))
            } else if m.role == "assistant" {
                past_first_non_system = true;
                ("model", m.content.clone())
            } else {
                past_first_non_system = true;
                ("user", m.content.clone())
            };

            match contents.last_mut() {
                Some(last) if last.role == role => {
                    if let Some(part) = last.parts.first_mut() {
                        part.text.push('\n');
                        part.text.push_str(&text);
                    }
                }
                _ => contents.push(GeminiContent {
                    role: role.to_string(),
                    parts: vec![GeminiPart { text }],
                }),
            }
        }

        (system_instruction, contents)
    }
}

#[async_trait::async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        config: &LlmConfig,
    ) -> Result<ChatResponse, ProviderError> {
        let (system_instruction, contents) = Self::build_contents(messages);
        let req = GeminiRequest {
            system_instruction,
            contents,
            generation_config: GenerationConfig {
                temperature: config.temperature.unwrap_or(DEFAULT_TEMPERATURE),
                max_output_tokens: config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
                top_p: config.top_p.unwrap_or(DEFAULT_TOP_P),
            },
        };

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, config.model, self.api_key
        );
        let res = self
            .client
            .post(&url)
            .json(&req)
            .send()
            .await
            .map_err(|e| self.err(e))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(self.err(format!("HTTP {}: {}", status, body)));
        }
        let parsed: GeminiResponse = res.json().await.map_err(|e| self.err(e))?;
        let content = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| self.err("response contained no candidates"))?;
        Ok(ChatResponse {
            content,
            model: config.model.clone(),
            usage: None,
        })
    }

    /// Gemini is driven through the non-streaming endpoint; the full content
    /// arrives as a single chunk.
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        config: &LlmConfig,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<ChatResponse, ProviderError> {
        let response = self.chat(messages, config).await?;
        on_chunk(&response.content);
        Ok(response)
    }

    async fn is_available(&self) -> bool {
        self.client
            .get(format!("{}/models?key={}", self.base_url, self.api_key))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map(|res| res.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_system_messages_become_system_instruction() {
        let messages = vec![
            ChatMessage::system("first"),
            ChatMessage::system("second"),
            ChatMessage::user("hello"),
        ];
        let (si, contents) = GeminiProvider::build_contents(&messages);
        assert_eq!(si.unwrap().parts[0].text, "first\nsecond");
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].role, "user");
    }

    #[test]
    fn consecutive_same_role_turns_are_merged() {
        let messages = vec![
            ChatMessage::user("a"),
            ChatMessage::user("b"),
            ChatMessage::assistant("c"),
            ChatMessage::system("mid"),
        ];
        let (si, contents) = GeminiProvider::build_contents(&messages);
        assert!(si.is_none());
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0].parts[0].text, "a\nb");
        assert_eq!(contents[1].role, "model");
        assert_eq!(contents[2].parts[0].text, "[SYSTEM] mid");
    }
}
