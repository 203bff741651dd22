//! Development stage: runs engineers against task worktrees.
//!
//! Workers pull from a priority queue (bounded by the configured engineer
//! concurrency), prepare the task's worktree, invoke the engineer through
//! the agent executor, collect the changed files, and commit the work so
//! the merge coordinator has something to merge. Failures retry at the same
//! priority up to the configured limit, then fail the task.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agents::{EngineerCache, RoleConfig, prompts};
use crate::events::{EventBus, PipelineEvent};
use crate::executor::{AgentExecutor, ExecutionRequest};
use crate::git::Git;
use crate::logging::{self, LogLevel, SharedSink};
use crate::pipeline::queue::StageQueue;
use crate::task::{EngineerResult, FailurePhase, Task};
use crate::worktree::{WorktreeError, WorktreeManager};

/// One unit of development work.
#[derive(Debug, Clone)]
pub struct DevItem {
    pub task: Task,
    /// Zero-based attempt counter; retries re-enqueue with `attempt + 1`.
    pub attempt: u32,
}

/// The development stage.
pub struct DevelopmentStage {
    executor: Arc<dyn AgentExecutor>,
    worktrees: Arc<WorktreeManager>,
    engineers: Arc<EngineerCache>,
    bus: Arc<EventBus>,
    queue: Arc<StageQueue<DevItem>>,
    role: RoleConfig,
    retry_limit: u32,
    sink: SharedSink,
    cancel: CancellationToken,
}

impl DevelopmentStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executor: Arc<dyn AgentExecutor>,
        worktrees: Arc<WorktreeManager>,
        engineers: Arc<EngineerCache>,
        bus: Arc<EventBus>,
        queue: Arc<StageQueue<DevItem>>,
        role: RoleConfig,
        retry_limit: u32,
        sink: SharedSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            executor,
            worktrees,
            engineers,
            bus,
            queue,
            role,
            retry_limit,
            sink,
            cancel,
        }
    }

    /// Spawn the stage's worker tasks.
    pub fn spawn_workers(self: &Arc<Self>, count: usize) -> Vec<tokio::task::JoinHandle<()>> {
        (0..count)
            .map(|index| {
                let stage = Arc::clone(self);
                tokio::spawn(async move { stage.worker(index).await })
            })
            .collect()
    }

    async fn worker(&self, index: usize) {
        tracing::debug!(worker = index, "development worker started");
        while let Some(item) = self.queue.pop().await {
            self.process(item).await;
            self.queue.task_done();
        }
        tracing::debug!(worker = index, "development worker stopped");
    }

    async fn process(&self, item: DevItem) {
        let mut task = item.task;
        let attempt = item.attempt;

        tracing::info!(
            task_id = %task.id,
            title = %task.title,
            attempt,
            "development started"
        );

        // Conflict-resolution tasks arrive with the original's worktree
        // already attached; everything else acquires on first entry.
        if task.branch_name.is_none() || task.worktree_path.is_none() {
            match self.acquire_worktree(&task).await {
                Ok((path, branch)) => {
                    task.branch_name = Some(branch);
                    task.worktree_path = Some(path);
                }
                Err(e) => {
                    self.handle_failure(task, attempt, format!("worktree acquisition failed: {e}"))
                        .await;
                    return;
                }
            }
        }

        let worktree_path = task.worktree_path.clone().expect("worktree path set above");
        let engineer = self.engineers.obtain(&task);
        self.sink.log(logging::record(
            "engineer",
            &engineer.engineer_id,
            LogLevel::Info,
            format!("development started: {} (attempt {attempt})", task.title),
        ));

        // Conflict resolutions always start a fresh session: the stale
        // context of the original engineer must not leak into the merge.
        let resume = if task.is_conflict_resolution() {
            None
        } else {
            engineer.resume.clone()
        };

        let prompt = if task.is_conflict_resolution() {
            prompts::conflict_resolution(&task)
        } else {
            prompts::development(&task)
        };

        let request = ExecutionRequest {
            prompt,
            working_dir: worktree_path.clone(),
            max_turns: self.role.max_turns,
            allowed_tools: self.role.allowed_tools.clone(),
            resume,
            cancel: self.cancel.child_token(),
        };

        let outcome = match self.executor.execute(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.handle_failure(task, attempt, format!("executor failed: {e:#}"))
                    .await;
                return;
            }
        };

        if let Some(handle) = outcome.session_handle() {
            self.engineers.store_session(task.id, handle);
        }

        if !outcome.success {
            let error = outcome
                .error
                .unwrap_or_else(|| "agent reported failure".to_string());
            self.handle_failure(task, attempt, error).await;
            return;
        }

        // Collect the change set, then commit the agent's work so the merge
        // coordinator has a committed branch tip.
        let git = Git::new(&worktree_path);
        let title = task.title.clone();
        let commit_result = tokio::task::spawn_blocking(move || {
            let changed = git.changed_files()?;
            if !changed.is_empty() {
                git.add_all()?;
                git.commit(&format!("kugutsu: {title} (attempt {attempt})"))?;
            }
            Ok::<_, crate::git::GitError>(changed)
        })
        .await
        .expect("commit task panicked");

        let changed_files = match commit_result {
            Ok(changed) => changed,
            Err(e) => {
                self.handle_failure(task, attempt, format!("failed to commit work: {e}"))
                    .await;
                return;
            }
        };

        let result = EngineerResult {
            task_id: task.id,
            engineer_id: engineer.engineer_id.clone(),
            success: true,
            transcript: outcome.rendered(),
            error: None,
            duration_ms: outcome.duration.as_millis() as u64,
            changed_files,
            needs_re_review: task.is_conflict_resolution(),
        };

        self.sink.log(logging::record(
            "engineer",
            &engineer.engineer_id,
            LogLevel::Info,
            format!(
                "development completed: {} ({} files changed)",
                task.title,
                result.changed_files.len()
            ),
        ));

        self.bus.emit(PipelineEvent::DevelopmentCompleted {
            task,
            result,
            engineer_id: engineer.engineer_id,
        });
    }

    /// Acquire the task's worktree, retrying once on a transient git error.
    async fn acquire_worktree(
        &self,
        task: &Task,
    ) -> Result<(std::path::PathBuf, String), WorktreeError> {
        match self.worktrees.acquire(task.id).await {
            Ok(pair) => Ok(pair),
            Err(WorktreeError::Git(g)) if g.is_transient() => {
                tracing::warn!(task_id = %task.id, error = %g, "transient worktree failure, retrying once");
                self.worktrees.acquire(task.id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_failure(&self, task: Task, attempt: u32, error: String) {
        // Shutdown cancellations are terminal regardless of retry budget.
        if !self.cancel.is_cancelled() && attempt < self.retry_limit {
            tracing::warn!(
                task_id = %task.id,
                attempt,
                error = %error,
                "development failed, requeueing"
            );
            let priority = task.priority.weight();
            self.queue.push(priority, DevItem {
                task,
                attempt: attempt + 1,
            });
            return;
        }

        self.sink.log(logging::record(
            "development-stage",
            &task.id.to_string(),
            LogLevel::Error,
            format!("development failed terminally (attempt {attempt}): {error}"),
        ));
        self.bus.emit(PipelineEvent::TaskFailed {
            task,
            error,
            phase: FailurePhase::Development,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::executor::{ExecutionOutcome, Message};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::process::Command;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use crate::task::TaskType;

    /// Executor that writes a file into the worktree, then succeeds after a
    /// configurable number of failures.
    struct ScriptedExecutor {
        fail_first: u32,
        calls: AtomicU32,
        resumes: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedExecutor {
        fn new(fail_first: u32) -> Self {
            Self {
                fail_first,
                calls: AtomicU32::new(0),
                resumes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AgentExecutor for ScriptedExecutor {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.resumes
                .lock()
                .unwrap()
                .push(request.resume.map(|h| h.0));

            if call < self.fail_first {
                return Ok(ExecutionOutcome {
                    success: false,
                    transcript: vec![],
                    session_id: None,
                    error: Some("simulated failure".into()),
                    duration: Duration::from_millis(1),
                });
            }

            std::fs::write(request.working_dir.join("work.txt"), "done\n").unwrap();
            Ok(ExecutionOutcome {
                success: true,
                transcript: vec![Message::AssistantText {
                    text: "implemented".into(),
                }],
                session_id: Some("sess-1".into()),
                error: None,
                duration: Duration::from_millis(1),
            })
        }
    }

    fn create_temp_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().to_path_buf();
        let run = |args: &[&str]| {
            let out = Command::new("git").args(args).current_dir(&repo).output().unwrap();
            assert!(out.status.success(), "git {:?}: {}", args, String::from_utf8_lossy(&out.stderr));
        };
        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "test@kugutsu.dev"]);
        run(&["config", "user.name", "Kugutsu Test"]);
        std::fs::write(repo.join("README.md"), "# Test\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "Initial commit"]);
        (dir, repo)
    }

    struct Fixture {
        _repo_dir: TempDir,
        _root_dir: TempDir,
        stage: Arc<DevelopmentStage>,
        bus: Arc<EventBus>,
        queue: Arc<StageQueue<DevItem>>,
        executor: Arc<ScriptedExecutor>,
        engineers: Arc<EngineerCache>,
    }

    fn fixture(fail_first: u32, retry_limit: u32) -> Fixture {
        let (repo_dir, repo) = create_temp_repo();
        let root_dir = TempDir::new().unwrap();
        let worktrees = Arc::new(
            WorktreeManager::new(&repo, root_dir.path(), "main").unwrap(),
        );
        let executor = Arc::new(ScriptedExecutor::new(fail_first));
        let engineers = Arc::new(EngineerCache::new());
        let bus = Arc::new(EventBus::new(16));
        let queue = Arc::new(StageQueue::new("development"));

        let stage = Arc::new(DevelopmentStage::new(
            Arc::clone(&executor) as Arc<dyn AgentExecutor>,
            worktrees,
            Arc::clone(&engineers),
            Arc::clone(&bus),
            Arc::clone(&queue),
            RoleConfig::engineer(30),
            retry_limit,
            Arc::new(logging::NoopSink),
            CancellationToken::new(),
        ));

        Fixture {
            _repo_dir: repo_dir,
            _root_dir: root_dir,
            stage,
            bus,
            queue,
            executor,
            engineers,
        }
    }

    fn collect_events(bus: &EventBus, kind: EventKind) -> Arc<Mutex<Vec<PipelineEvent>>> {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let sink_clone = Arc::clone(&sink);
        bus.subscribe(kind, move |envelope| {
            sink_clone.lock().unwrap().push(envelope.event.clone());
            Ok(())
        });
        sink
    }

    #[tokio::test]
    async fn success_emits_development_completed_with_changes() {
        let fx = fixture(0, 3);
        let completed = collect_events(&fx.bus, EventKind::DevelopmentCompleted);

        let task = Task::new(TaskType::Feature, "add work", "write work.txt");
        fx.stage
            .process(DevItem {
                task: task.clone(),
                attempt: 0,
            })
            .await;

        let events = completed.lock().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            PipelineEvent::DevelopmentCompleted { result, .. } => {
                assert!(result.success);
                assert_eq!(result.changed_files, vec!["work.txt"]);
                assert!(!result.needs_re_review);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        // The session handle was cached for the revision rounds.
        assert_eq!(
            fx.engineers.obtain(&task).resume.map(|h| h.0),
            Some("sess-1".to_string())
        );
    }

    #[tokio::test]
    async fn failures_requeue_until_retry_limit() {
        let fx = fixture(2, 3);
        let failed = collect_events(&fx.bus, EventKind::TaskFailed);
        let completed = collect_events(&fx.bus, EventKind::DevelopmentCompleted);

        let task = Task::new(TaskType::Feature, "flaky", "flaky work");
        fx.stage
            .process(DevItem {
                task,
                attempt: 0,
            })
            .await;

        // Drain the requeued attempts in-line.
        while let Some(item) = fx.queue.try_pop() {
            fx.stage.process(item).await;
            fx.queue.task_done();
        }

        assert!(failed.lock().unwrap().is_empty());
        assert_eq!(completed.lock().unwrap().len(), 1);
        assert_eq!(fx.executor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_exhausted_emits_task_failed() {
        // Fails more times than the limit allows.
        let fx = fixture(10, 3);
        let failed = collect_events(&fx.bus, EventKind::TaskFailed);

        let task = Task::new(TaskType::Feature, "doomed", "never works");
        fx.stage
            .process(DevItem {
                task,
                attempt: 0,
            })
            .await;
        while let Some(item) = fx.queue.try_pop() {
            fx.stage.process(item).await;
            fx.queue.task_done();
        }

        let events = failed.lock().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            PipelineEvent::TaskFailed { phase, .. } => {
                assert_eq!(*phase, FailurePhase::Development);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        // Initial attempt + 3 retries.
        assert_eq!(fx.executor.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn conflict_resolution_suppresses_resume() {
        let fx = fixture(0, 3);

        // Seed a cached session for a normal task, then run a conflict task
        // reusing the same worktree.
        let original = Task::new(TaskType::Feature, "original", "desc");
        fx.stage
            .process(DevItem {
                task: original.clone(),
                attempt: 0,
            })
            .await;

        let mut conflict = Task::new(TaskType::ConflictResolution, "resolve", "resolve conflicts");
        conflict.branch_name = Some(WorktreeManager::branch_for(original.id));
        conflict.worktree_path = fx
            .stage
            .worktrees
            .acquire(original.id)
            .await
            .ok()
            .map(|(p, _)| p);
        fx.stage
            .process(DevItem {
                task: conflict,
                attempt: 0,
            })
            .await;

        let resumes = fx.executor.resumes.lock().unwrap();
        assert_eq!(resumes.len(), 2);
        assert_eq!(resumes[0], None, "first run starts fresh");
        assert_eq!(resumes[1], None, "conflict resolution must not resume");
    }
}
