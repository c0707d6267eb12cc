//! Code generation stage: one provider call per planned file, producing a
//! `create` operation for each. Any single-file failure aborts the whole
//! stage with no partial operation set.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::core::llm::{ChatMessage, ResolvedProvider};

use super::{call_llm, Agent, AgentResult, FileOpKind, FileOperation, PipelineContext};

const TEMPERATURE: f64 = 0.5;
const MAX_TOKENS: u32 = 4096;

pub struct CodeGeneratorAgent;

#[async_trait]
impl Agent for CodeGeneratorAgent {
    fn name(&self) -> &'static str {
        "CodeGenerator"
    }

    async fn execute(&self, ctx: &PipelineContext, provider: &ResolvedProvider) -> AgentResult {
        info!("[{}] Starting code generation...", self.name());

        let Some(plan) = find_plan(&ctx.history) else {
            return AgentResult::failure(self.name(), "No plan found in context");
        };

        let paths: Vec<&str> = plan["files"]
            .as_array()
            .map(|files| files.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut file_operations = Vec::new();
        let mut logs = Vec::new();

        for path in paths {
            info!("[{}] Generating {}...", self.name(), path);
            match self.generate_file(path, plan, ctx, provider).await {
                Ok(content) => {
                    file_operations.push(FileOperation {
                        kind: FileOpKind::Create,
                        path: path.to_string(),
                        content: Some(content),
                        diff: None,
                    });
                    logs.push(format!("Generated {}", path));
                }
                Err(e) => {
                    return AgentResult::failure(
                        self.name(),
                        format!("Code generation failed: {}", e),
                    );
                }
            }
        }

        AgentResult {
            agent_type: self.name().to_string(),
            success: true,
            output: json!({ "filesGenerated": file_operations.len() }),
            file_operations: Some(file_operations),
            logs,
            model: None,
        }
    }
}

impl CodeGeneratorAgent {
    async fn generate_file(
        &self,
        path: &str,
        plan: &Value,
        ctx: &PipelineContext,
        provider: &ResolvedProvider,
    ) -> Result<String, crate::core::llm::ProviderError> {
        let system_prompt = format!(
            "You are a code generator. Generate ONLY the file content for {path}.\n\
             No explanations, no markdown code blocks, just the raw file content.\n\n\
             Project context:\n\
             - Type: {}\n\
             - Stack: {}\n\
             - Features: {}",
            plan["projectType"].as_str().unwrap_or("web-app"),
            join_strings(&plan["stack"]),
            join_strings(&plan["features"]),
        );
        let messages = [
            ChatMessage::system(system_prompt),
            ChatMessage::user(format!("Generate the complete content for file: {}", path)),
        ];
        let response = call_llm(
            provider,
            &messages,
            ctx.model.as_deref(),
            TEMPERATURE,
            MAX_TOKENS,
        )
        .await?;
        Ok(clean_code_response(&response.content).to_string())
    }
}

/// Most recent successful planner output in the run history.
fn find_plan(history: &[AgentResult]) -> Option<&Value> {
    history
        .iter()
        .find(|r| r.agent_type == "Planner" && r.success)
        .map(|r| &r.output)
}

fn join_strings(value: &Value) -> String {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default()
}

/// Strip one enclosing fenced code block, if the model added one despite
/// instructions.
fn clean_code_response(response: &str) -> &str {
    let cleaned = response.trim();
    let Some(rest) = cleaned.strip_prefix("```") else {
        return cleaned;
    };
    // Drop the info string ("```js") up to and including the newline.
    let body = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => return cleaned,
    };
    body.strip_suffix("```")
        .map(|b| b.trim_end_matches('\n'))
        .unwrap_or(cleaned)
        .trim_end()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_block_with_language_is_stripped() {
        let raw = "```js\nconsole.log('hi');\n```";
        assert_eq!(clean_code_response(raw), "console.log('hi');");
    }

    #[test]
    fn fenced_block_without_language_is_stripped() {
        let raw = "```\nbody {}\n```";
        assert_eq!(clean_code_response(raw), "body {}");
    }

    #[test]
    fn unfenced_content_is_untouched() {
        let raw = "fn main() {}\n";
        assert_eq!(clean_code_response(raw), "fn main() {}");
    }

    #[test]
    fn unterminated_fence_is_left_alone() {
        let raw = "```js\nconsole.log('hi');";
        assert_eq!(clean_code_response(raw), raw.trim());
    }

    #[test]
    fn plan_lookup_requires_successful_planner_result() {
        let failed = AgentResult::failure("Planner", "boom");
        assert!(find_plan(&[failed]).is_none());

        let ok = AgentResult {
            agent_type: "Planner".to_string(),
            success: true,
            output: json!({"files": ["a.js"]}),
            file_operations: None,
            logs: vec![],
            model: None,
        };
        let plan = find_plan(std::slice::from_ref(&ok)).unwrap();
        assert_eq!(plan["files"][0], "a.js");
    }
}
