//! Pipeline agents: single-purpose units that consume the run context and
//! produce a structured result. Agents capture their own failures; a result
//! with `success == false` is the only failure channel out of an agent.

pub mod codegen;
pub mod planner;

pub use codegen::CodeGeneratorAgent;
pub use planner::PlannerAgent;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::core::llm::{ChatMessage, ChatResponse, ProviderError, ResolvedProvider};
use crate::core::vfs::VirtualFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOpKind {
    Create,
    Update,
    Delete,
}

/// One requested change to the virtual file system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOperation {
    #[serde(rename = "type")]
    pub kind: FileOpKind,
    pub path: String,
    pub content: Option<String>,
    pub diff: Option<String>,
}

/// Immutable output of one agent invocation.
#[derive(Debug, Clone, Serialize)]
pub struct AgentResult {
    pub agent_type: String,
    pub success: bool,
    pub output: Value,
    pub file_operations: Option<Vec<FileOperation>>,
    pub logs: Vec<String>,
    pub model: Option<String>,
}

impl AgentResult {
    pub fn failure(agent_type: &str, reason: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            success: false,
            output: Value::Null,
            file_operations: None,
            logs: vec![reason.into()],
            model: None,
        }
    }
}

/// Ephemeral per-run state. Built once per pipeline invocation, extended by
/// appending each agent's result to `history`, discarded after the run.
pub struct PipelineContext {
    pub project_id: String,
    pub user_id: String,
    pub prompt: String,
    pub files: HashMap<String, VirtualFile>,
    pub history: Vec<AgentResult>,
    pub model: Option<String>,
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one stage against the provider the orchestrator resolved for
    /// this context's user.
    async fn execute(&self, ctx: &PipelineContext, provider: &ResolvedProvider) -> AgentResult;
}

/// Shared agent-to-provider call: config defaults come from the resolved
/// provider's stored parameters, the agent pins its own temperature and
/// token budget, and a run-level model override wins over the config model.
pub(crate) async fn call_llm(
    provider: &ResolvedProvider,
    messages: &[ChatMessage],
    model_override: Option<&str>,
    temperature: f64,
    max_tokens: u32,
) -> Result<ChatResponse, ProviderError> {
    let mut config = provider.llm_config(model_override);
    config.temperature = Some(temperature);
    config.max_tokens = Some(max_tokens);
    provider.client.chat(messages, &config).await
}
