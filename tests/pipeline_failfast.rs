use std::sync::Arc;

use appforge::core::llm::{ProviderKind, ProviderRegistry};
use appforge::core::pipeline::PipelineOrchestrator;
use appforge::core::vfs::VirtualFileSystem;
use appforge::storage::{ExecutionStatus, ProviderConfigRecord, Storage};
use tokio::sync::mpsc;

/// A provider config whose endpoint refuses connections, so the first chat
/// call fails deterministically without any network dependency.
fn unreachable_provider(user: &str) -> ProviderConfigRecord {
    let mut record = ProviderConfigRecord::new(
        user,
        ProviderKind::Local,
        "unreachable",
        "test-key",
        "test-model",
    );
    record.base_url = Some("http://127.0.0.1:9/v1".to_string());
    record
}

#[tokio::test]
async fn planner_failure_stops_the_run_before_code_generation() {
    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let vfs = Arc::new(VirtualFileSystem::new(storage.clone(), None));
    let registry = Arc::new(ProviderRegistry::new(storage.clone()));
    storage
        .upsert_provider_config(&unreachable_provider("u1"))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let orchestrator = PipelineOrchestrator::new(storage.clone(), vfs.clone(), registry);
    let err = orchestrator
        .execute_pipeline("p1", "u1", "build a todo app", None, Some(tx))
        .await
        .unwrap_err();

    // Exactly the failed planning stage; code generation never ran.
    assert_eq!(err.results.len(), 1);
    assert_eq!(err.results[0].agent_type, "Planner");
    assert!(!err.results[0].success);

    // No file operations were applied.
    assert!(vfs.load_project("p1").await.unwrap().is_empty());

    // One execution record, finalized as failed.
    let executions = storage.project_executions("p1").await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].agent_type, "Planner");
    assert_eq!(executions[0].status, ExecutionStatus::Failed);
    assert!(executions[0].completed_at.is_some());

    // Progress went out up to the abort, ending in a failure message.
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    assert!(messages.iter().any(|m| m.contains("Planning project")));
    assert!(messages.last().unwrap().contains("Pipeline failed"));
}

#[tokio::test]
async fn missing_provider_configuration_fails_the_planning_stage() {
    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let vfs = Arc::new(VirtualFileSystem::new(storage.clone(), None));
    let registry = Arc::new(ProviderRegistry::new(storage.clone()));

    let orchestrator = PipelineOrchestrator::new(storage.clone(), vfs, registry);
    let err = orchestrator
        .execute_pipeline("p1", "nobody", "build a todo app", None, None)
        .await
        .unwrap_err();

    assert!(err.message.contains("no provider configured"));
    assert!(err.results.is_empty());

    // The stage's execution record still exists and is marked failed.
    let executions = storage.project_executions("p1").await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Failed);
}
