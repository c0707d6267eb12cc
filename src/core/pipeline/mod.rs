//! Pipeline orchestration: a strict two-stage sequence (Planner, then
//! CodeGenerator) followed by applying the produced file operations. Each
//! stage is wrapped in a persisted execution record; any stage failure
//! aborts the remainder of the run.

use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::core::agents::{
    Agent, AgentResult, CodeGeneratorAgent, FileOpKind, FileOperation, PipelineContext,
    PlannerAgent,
};
use crate::core::llm::ProviderRegistry;
use crate::core::vfs::VirtualFileSystem;
use crate::core::ExecutionLog;
use crate::storage::{ExecutionStatus, Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Pending,
    Planning,
    Coding,
    Applying,
    Complete,
    Failed,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Pending => "pending",
            PipelineState::Planning => "planning",
            PipelineState::Coding => "coding",
            PipelineState::Applying => "applying",
            PipelineState::Complete => "complete",
            PipelineState::Failed => "failed",
        }
    }
}

/// Legal state transitions. The pipeline is linear with no retries: every
/// active state may fail, terminal states go nowhere.
pub fn can_transition(from: PipelineState, to: PipelineState) -> bool {
    if from == to {
        return true;
    }
    match from {
        PipelineState::Pending => matches!(to, PipelineState::Planning | PipelineState::Failed),
        PipelineState::Planning => matches!(to, PipelineState::Coding | PipelineState::Failed),
        PipelineState::Coding => matches!(to, PipelineState::Applying | PipelineState::Failed),
        PipelineState::Applying => matches!(to, PipelineState::Complete | PipelineState::Failed),
        PipelineState::Complete | PipelineState::Failed => false,
    }
}

/// A failed run. Carries the results of the stages that did complete, so
/// callers can still inspect partial progress; matching execution records
/// exist in `failed` state.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct PipelineError {
    pub message: String,
    pub results: Vec<AgentResult>,
}

/// One-way progress sink. Sends are fire-and-forget: a closed or absent
/// receiver never fails the pipeline.
pub type ProgressSender = mpsc::UnboundedSender<String>;

pub struct PipelineOrchestrator {
    storage: Arc<Storage>,
    vfs: Arc<VirtualFileSystem>,
    registry: Arc<ProviderRegistry>,
    planner: PlannerAgent,
    code_generator: CodeGeneratorAgent,
}

impl PipelineOrchestrator {
    pub fn new(
        storage: Arc<Storage>,
        vfs: Arc<VirtualFileSystem>,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            storage,
            vfs,
            registry,
            planner: PlannerAgent,
            code_generator: CodeGeneratorAgent,
        }
    }

    /// Run the full pipeline for one prompt. Stages execute strictly in
    /// sequence; the first failure aborts the run with the completed stage
    /// results attached to the error.
    pub async fn execute_pipeline(
        &self,
        project_id: &str,
        user_id: &str,
        prompt: &str,
        model: Option<String>,
        progress: Option<ProgressSender>,
    ) -> Result<Vec<AgentResult>, PipelineError> {
        let emit = |message: &str| {
            if let Some(tx) = &progress {
                let _ = tx.send(message.to_string());
            }
        };

        let mut state = PipelineState::Pending;
        let mut results: Vec<AgentResult> = Vec::new();

        let files = match self.vfs.load_project(project_id).await {
            Ok(files) => files,
            Err(e) => {
                let message = format!("Pipeline failed: {}", e);
                emit(&format!("❌ {}", message));
                return Err(PipelineError { message, results });
            }
        };

        let mut ctx = PipelineContext {
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
            prompt: prompt.to_string(),
            files,
            history: Vec::new(),
            model,
        };

        advance(&mut state, PipelineState::Planning);
        emit("🎯 Planning project...");
        let plan_result = match self.execute_stage(&self.planner, &ctx).await {
            Ok(result) => result,
            Err(message) => {
                return self.abort(&mut state, results, message, emit);
            }
        };
        results.push(plan_result.clone());
        ctx.history.push(plan_result);
        if !ctx.history[0].success {
            return self.abort(&mut state, results, "Planning failed".to_string(), emit);
        }

        advance(&mut state, PipelineState::Coding);
        emit("⚡ Generating code...");
        let code_result = match self.execute_stage(&self.code_generator, &ctx).await {
            Ok(result) => result,
            Err(message) => {
                return self.abort(&mut state, results, message, emit);
            }
        };
        results.push(code_result.clone());
        let success = code_result.success;
        let operations = code_result.file_operations.clone();
        ctx.history.push(code_result);
        if !success {
            return self.abort(&mut state, results, "Code generation failed".to_string(), emit);
        }

        advance(&mut state, PipelineState::Applying);
        if let Some(operations) = operations {
            emit("💾 Saving files...");
            if let Err(e) = self.apply_file_operations(project_id, &operations).await {
                return self
                    .abort(&mut state, results, format!("Saving files failed: {}", e), emit);
            }
        }

        advance(&mut state, PipelineState::Complete);
        emit("✅ Pipeline completed!");
        info!("pipeline for project {} completed", project_id);
        Ok(results)
    }

    /// Run one agent with its execution record bracket: the record is
    /// created `running` before the agent is invoked and always finalized,
    /// including when provider resolution or record upkeep fails.
    async fn execute_stage(
        &self,
        agent: &dyn Agent,
        ctx: &PipelineContext,
    ) -> Result<AgentResult, String> {
        let input = json!({ "prompt": ctx.prompt });
        let execution_id = self
            .storage
            .create_execution(&ctx.project_id, &ctx.user_id, agent.name(), &input)
            .await
            .map_err(|e| format!("recording execution start: {}", e))?;

        // Provider selection is user-scoped: the run's user decides which
        // configured provider answers, never a process-wide default.
        let provider = match self.registry.get_provider(&ctx.user_id, None).await {
            Ok(provider) => provider,
            Err(e) => {
                let reason = e.to_string();
                self.finalize_execution(
                    &execution_id,
                    ExecutionStatus::Failed,
                    &Value::Null,
                    &[ExecutionLog::error(reason.clone())],
                )
                .await;
                return Err(reason);
            }
        };

        let result = agent.execute(ctx, &provider).await;

        let status = if result.success {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        let logs: Vec<ExecutionLog> = result
            .logs
            .iter()
            .map(|message| ExecutionLog::info(message.clone()))
            .collect();
        self.finalize_execution(&execution_id, status, &result.output, &logs)
            .await;

        Ok(result)
    }

    async fn finalize_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        output: &Value,
        logs: &[ExecutionLog],
    ) {
        if let Err(e) = self
            .storage
            .finish_execution(execution_id, status, output, logs)
            .await
        {
            error!("failed to finalize execution {}: {}", execution_id, e);
        }
    }

    /// Apply generated operations to the virtual file store, in list order.
    async fn apply_file_operations(
        &self,
        project_id: &str,
        operations: &[FileOperation],
    ) -> Result<(), crate::storage::StorageError> {
        for op in operations {
            match op.kind {
                FileOpKind::Create | FileOpKind::Update => {
                    if let Some(content) = &op.content {
                        self.vfs
                            .update_file(project_id, &op.path, content, op.diff.as_deref())
                            .await?;
                    }
                }
                FileOpKind::Delete => {
                    self.vfs.delete_file(project_id, &op.path).await?;
                }
            }
        }
        Ok(())
    }

    fn abort(
        &self,
        state: &mut PipelineState,
        results: Vec<AgentResult>,
        message: String,
        emit: impl Fn(&str),
    ) -> Result<Vec<AgentResult>, PipelineError> {
        advance(state, PipelineState::Failed);
        emit(&format!("❌ Pipeline failed: {}", message));
        error!("pipeline aborted: {}", message);
        Err(PipelineError { message, results })
    }
}

fn advance(state: &mut PipelineState, to: PipelineState) {
    debug_assert!(can_transition(*state, to), "{:?} -> {:?}", state, to);
    *state = to;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_allowed() {
        let path = [
            (PipelineState::Pending, PipelineState::Planning),
            (PipelineState::Planning, PipelineState::Coding),
            (PipelineState::Coding, PipelineState::Applying),
            (PipelineState::Applying, PipelineState::Complete),
        ];
        for (from, to) in path {
            assert!(
                can_transition(from, to),
                "expected transition {:?} -> {:?} to be allowed",
                from,
                to
            );
        }
    }

    #[test]
    fn stages_cannot_be_skipped() {
        assert!(!can_transition(PipelineState::Pending, PipelineState::Coding));
        assert!(!can_transition(
            PipelineState::Planning,
            PipelineState::Applying
        ));
        assert!(!can_transition(
            PipelineState::Coding,
            PipelineState::Complete
        ));
    }

    #[test]
    fn every_active_state_may_fail() {
        for from in [
            PipelineState::Pending,
            PipelineState::Planning,
            PipelineState::Coding,
            PipelineState::Applying,
        ] {
            assert!(can_transition(from, PipelineState::Failed));
        }
    }

    #[test]
    fn terminal_states_go_nowhere() {
        for to in [
            PipelineState::Pending,
            PipelineState::Planning,
            PipelineState::Coding,
            PipelineState::Applying,
        ] {
            assert!(!can_transition(PipelineState::Complete, to));
            assert!(!can_transition(PipelineState::Failed, to));
        }
    }
}
