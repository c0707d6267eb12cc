//! Planning stage: turns a free-form user prompt into a structured project
//! plan. Plan extraction never fails the stage; when the model response
//! carries no parseable JSON, a fixed fallback plan is returned instead.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::core::llm::{ChatMessage, ResolvedProvider};

use super::{call_llm, Agent, AgentResult, PipelineContext};

const TEMPERATURE: f64 = 0.3;
const MAX_TOKENS: u32 = 1024;

const SYSTEM_PROMPT: &str = "You are a technical planning agent. Given a user's project request, break it down into:
1. Project type and primary technology stack
2. Key features (3-5 main features)
3. File structure (list of files to create)
4. Step-by-step implementation plan

Be concise. Output as JSON with keys: projectType, stack, features, files, steps.
Optimize for small context windows. Keep response under 800 tokens.";

pub struct PlannerAgent;

#[async_trait]
impl Agent for PlannerAgent {
    fn name(&self) -> &'static str {
        "Planner"
    }

    async fn execute(&self, ctx: &PipelineContext, provider: &ResolvedProvider) -> AgentResult {
        info!("[{}] Starting planning phase...", self.name());

        let messages = [
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "User request: {}\n\nProvide a technical plan.",
                ctx.prompt
            )),
        ];

        match call_llm(
            provider,
            &messages,
            ctx.model.as_deref(),
            TEMPERATURE,
            MAX_TOKENS,
        )
        .await
        {
            Ok(response) => AgentResult {
                agent_type: self.name().to_string(),
                success: true,
                output: parse_plan(&response.content),
                file_operations: None,
                logs: vec!["Planning completed successfully".to_string()],
                model: Some(response.model),
            },
            Err(e) => AgentResult::failure(self.name(), format!("Planning failed: {}", e)),
        }
    }
}

/// Best-effort plan extraction: the first balanced `{...}` region of the
/// response, falling back to a fixed default plan when none parses.
fn parse_plan(response: &str) -> Value {
    if let Some(candidate) = first_json_object(response) {
        if let Ok(plan) = serde_json::from_str::<Value>(candidate) {
            return plan;
        }
    }
    fallback_plan()
}

/// Slice out the first balanced top-level `{...}` region, tracking string
/// literals and escapes so braces inside strings do not count.
fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn fallback_plan() -> Value {
    json!({
        "projectType": "web-app",
        "stack": ["Node.js", "React"],
        "features": ["User interface", "Backend API", "Data storage"],
        "files": ["index.html", "app.js", "server.js"],
        "steps": ["Setup project", "Build frontend", "Build backend", "Test"],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_balanced_object() {
        let text = "Here is the plan:\n{\"a\": {\"b\": 1}} trailing {\"c\": 2}";
        assert_eq!(first_json_object(text), Some("{\"a\": {\"b\": 1}}"));
    }

    #[test]
    fn braces_inside_strings_do_not_unbalance() {
        let text = r#"{"note": "a } inside", "n": 1} rest"#;
        assert_eq!(
            first_json_object(text),
            Some(r#"{"note": "a } inside", "n": 1}"#)
        );
    }

    #[test]
    fn unterminated_object_yields_none() {
        assert_eq!(first_json_object("{\"a\": 1"), None);
        assert_eq!(first_json_object("no json here"), None);
    }

    #[test]
    fn parse_plan_reads_model_json() {
        let plan = parse_plan("Sure!\n{\"projectType\": \"cli\", \"files\": [\"main.rs\"]}");
        assert_eq!(plan["projectType"], "cli");
        assert_eq!(plan["files"][0], "main.rs");
    }

    #[test]
    fn parse_plan_falls_back_on_garbage() {
        let plan = parse_plan("I cannot answer in JSON, sorry.");
        assert_eq!(plan["projectType"], "web-app");
        assert_eq!(plan["files"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn parse_plan_falls_back_on_invalid_json() {
        let plan = parse_plan("{not: valid,, json}");
        assert_eq!(plan["projectType"], "web-app");
    }
}
