//! Hard development failure: retries are exhausted, the task fails, and
//! its dependents are left blocked (never auto-failed).

use std::sync::Arc;

use tempfile::TempDir;

use kugutsu_core::task::{FailurePhase, Task, TaskType};
use kugutsu_core::{PipelineConfig, PipelineManager};
use kugutsu_test_utils::{
    MockExecutor, TempRepo, extract_task_title, is_review_request, outcome_failure, outcome_text,
    write_task_file,
};

#[tokio::test]
async fn development_failure_blocks_dependents_and_exits_nonzero() {
    let repo = TempRepo::new();
    let worktree_root = TempDir::new().unwrap();

    let doomed = Task::new(TaskType::Feature, "doomed", "The agent always errors.");
    let dependent = Task::new(TaskType::Feature, "dependent", "Needs the doomed task.")
        .with_dependencies(vec![doomed.id]);
    let independent = Task::new(TaskType::Feature, "independent", "Unrelated work.");
    let (doomed_id, dependent_id) = (doomed.id, dependent.id);

    let executor = Arc::new(MockExecutor::new(|request| {
        if is_review_request(request) {
            return outcome_text("レビュー結果: APPROVED");
        }
        if extract_task_title(&request.prompt).as_deref() == Some("doomed") {
            return outcome_failure("agent crashed");
        }
        write_task_file(request);
        outcome_text("implemented")
    }));

    let mut cfg = PipelineConfig::new(repo.path());
    cfg.worktree_root = worktree_root.path().to_path_buf();
    cfg.max_concurrent_engineers = 2;

    let manager = PipelineManager::new(
        cfg,
        vec![doomed, dependent, independent],
        Arc::clone(&executor) as Arc<dyn kugutsu_core::executor::AgentExecutor>,
    )
    .unwrap();
    let report = manager.run().await;

    assert_eq!(report.exit_code(), 1);

    // The doomed task failed in the development phase after the initial
    // attempt plus three retries.
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].task_id, doomed_id);
    assert_eq!(report.failed[0].phase, FailurePhase::Development);
    let doomed_attempts = executor
        .engineer_invocations()
        .iter()
        .filter(|i| extract_task_title(&i.prompt).as_deref() == Some("doomed"))
        .count();
    assert_eq!(doomed_attempts, 4);

    // The dependent stayed waiting and is reported blocked, naming the
    // failed dependency. It never entered development.
    assert_eq!(report.blocked.len(), 1);
    assert_eq!(report.blocked[0].task_id, dependent_id);
    assert_eq!(report.blocked[0].failed_dependencies, vec![doomed_id]);
    assert!(
        !executor
            .engineer_invocations()
            .iter()
            .any(|i| extract_task_title(&i.prompt).as_deref() == Some("dependent"))
    );

    // Unrelated work still merged.
    assert_eq!(report.merged.len(), 1);
    assert_eq!(report.merged[0].title, "independent");
    assert_eq!(repo.merge_commit_count(), 1);
}
