//! Merge coordinator: the single-writer lane into the base branch.
//!
//! At most one merge runs against the base branch at any moment, enforced
//! by a fair async mutex (tokio's mutex queues waiters FIFO, so the lane is
//! starvation-free). One attempt:
//!
//! 1. Acquire the merge mutex.
//! 2. Refresh the base branch (pull only when remote use is configured and
//!    an `origin` remote exists).
//! 3. Merge the base branch into the task's *worktree*. This validates the
//!    merge and surfaces conflicts on the feature side, keeping the base
//!    branch clean.
//! 4. Conflict: abort the worktree merge, release the mutex, and report the
//!    conflict. The mutex is never held during conflict resolution, and the
//!    worktree is retained for the resolution task.
//! 5. Clean: merge the feature branch into the base branch with `--no-ff`.
//! 6. Success: report completion, then best-effort remove the worktree and
//!    delete the feature branch.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, PipelineEvent};
use crate::git::{Git, MergeOutcome, retry_transient};
use crate::logging::{self, LogLevel, SharedSink};
use crate::pipeline::queue::StageQueue;
use crate::task::{EngineerResult, FailurePhase, ReviewResult, Task};
use crate::worktree::WorktreeManager;

/// One unit of merge work: an approved task with its full history.
#[derive(Debug, Clone)]
pub struct MergeItem {
    pub task: Task,
    pub result: EngineerResult,
    pub reviews: Vec<ReviewResult>,
    pub engineer_id: String,
}

/// Result of one merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAttempt {
    /// The base branch now contains the task's changes.
    Merged,
    /// The worktree-side merge conflicted and was aborted.
    Conflict { paths: Vec<String> },
    /// Hard, non-conflict failure; both sides were aborted.
    Failed { error: String },
}

/// Coordinates merges into the base branch.
pub struct MergeCoordinator {
    base_repo: std::path::PathBuf,
    base_branch: String,
    use_remote: bool,
    worktrees: Arc<WorktreeManager>,
    /// The merge mutex. Fair: waiters acquire in FIFO order.
    lane: Mutex<()>,
    /// Gauge of attempts currently inside the mutex, for invariant checks.
    active: AtomicUsize,
}

impl MergeCoordinator {
    pub fn new(
        base_repo: impl Into<std::path::PathBuf>,
        base_branch: impl Into<String>,
        use_remote: bool,
        worktrees: Arc<WorktreeManager>,
    ) -> Self {
        Self {
            base_repo: base_repo.into(),
            base_branch: base_branch.into(),
            use_remote,
            worktrees,
            lane: Mutex::new(()),
            active: AtomicUsize::new(0),
        }
    }

    /// Number of merge attempts currently holding the mutex (0 or 1).
    pub fn active_merges(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Run one merge attempt for a task.
    ///
    /// The mutex is held for steps 2-5 only; conflict resolution happens
    /// outside it.
    pub async fn attempt(&self, task: &Task) -> MergeAttempt {
        let Some(branch) = task.branch_name.clone() else {
            return MergeAttempt::Failed {
                error: "task has no branch to merge".into(),
            };
        };
        let Some(worktree_path) = task.worktree_path.clone() else {
            return MergeAttempt::Failed {
                error: "task has no worktree to merge".into(),
            };
        };

        let _guard = self.lane.lock().await;
        self.active.fetch_add(1, Ordering::SeqCst);

        let base = Git::new(&self.base_repo);
        let worktree = Git::new(&worktree_path);
        let base_branch = self.base_branch.clone();
        let use_remote = self.use_remote;

        let attempt = tokio::task::spawn_blocking(move || {
            merge_steps(&base, &worktree, &branch, &base_branch, use_remote)
        })
        .await
        .expect("merge task panicked");

        self.active.fetch_sub(1, Ordering::SeqCst);
        attempt
    }

    /// Step 6 cleanup: remove the worktree and delete the feature branch.
    /// Best-effort on both sides.
    pub async fn cleanup_merged(&self, task: &Task) {
        self.worktrees.release(task.id).await;

        if let Some(branch) = &task.branch_name {
            let base = Git::new(&self.base_repo);
            let branch = branch.clone();
            let result = tokio::task::spawn_blocking(move || base.delete_branch(&branch))
                .await
                .expect("branch deletion task panicked");
            if let Err(e) = result {
                tracing::warn!(task_id = %task.id, error = %e, "failed to delete merged branch");
            }
        }
    }
}

impl std::fmt::Debug for MergeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeCoordinator")
            .field("base_repo", &self.base_repo)
            .field("base_branch", &self.base_branch)
            .field("use_remote", &self.use_remote)
            .finish()
    }
}

/// Steps 2-5, executed while the caller holds the merge mutex.
fn merge_steps(
    base: &Git,
    worktree: &Git,
    branch: &str,
    base_branch: &str,
    use_remote: bool,
) -> MergeAttempt {
    // 2. Refresh the base branch.
    if let Err(e) = retry_transient(|| base.checkout(base_branch)) {
        return MergeAttempt::Failed {
            error: format!("failed to checkout base branch: {e}"),
        };
    }
    if use_remote && base.has_origin_remote() {
        if let Err(e) = retry_transient(|| base.pull_origin(base_branch)) {
            return MergeAttempt::Failed {
                error: format!("failed to pull base branch: {e}"),
            };
        }
    }

    // 3. Validate by merging base into the worktree (feature side).
    match worktree.merge(base_branch) {
        Ok(MergeOutcome::Merged) => {}
        Ok(MergeOutcome::Conflicted { paths }) => {
            // 4. Abort and hand the conflict back to the pipeline.
            worktree.merge_abort();
            return MergeAttempt::Conflict { paths };
        }
        Err(e) => {
            worktree.merge_abort();
            return MergeAttempt::Failed {
                error: format!("worktree merge failed: {e}"),
            };
        }
    }

    // 5. Land the feature branch on base with an explicit merge commit.
    match base.merge_no_ff(branch) {
        Ok(MergeOutcome::Merged) => MergeAttempt::Merged,
        Ok(MergeOutcome::Conflicted { .. }) => {
            // The worktree already contains base, so this should not
            // conflict; treat it as a hard failure and clean up both sides.
            base.merge_abort();
            MergeAttempt::Failed {
                error: "base merge conflicted after clean worktree validation".into(),
            }
        }
        Err(e) => {
            base.merge_abort();
            MergeAttempt::Failed {
                error: format!("base merge failed: {e}"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// The merge stage: a single worker draining the merge queue through the
/// coordinator.
pub struct MergeStage {
    coordinator: Arc<MergeCoordinator>,
    bus: Arc<EventBus>,
    queue: Arc<StageQueue<MergeItem>>,
    sink: SharedSink,
    cancel: CancellationToken,
}

impl MergeStage {
    pub fn new(
        coordinator: Arc<MergeCoordinator>,
        bus: Arc<EventBus>,
        queue: Arc<StageQueue<MergeItem>>,
        sink: SharedSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            coordinator,
            bus,
            queue,
            sink,
            cancel,
        }
    }

    /// Spawn the single merge worker.
    pub fn spawn_worker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let stage = Arc::clone(self);
        tokio::spawn(async move { stage.worker().await })
    }

    async fn worker(&self) {
        tracing::debug!("merge worker started");
        while let Some(item) = self.queue.pop().await {
            // Git is not interruptible; an in-flight merge always finishes
            // so the base branch is never left half-merged. Items dequeued
            // after cancellation are dropped.
            if self.cancel.is_cancelled() {
                tracing::warn!(task_id = %item.task.id, "shutdown: skipping queued merge");
                self.queue.task_done();
                continue;
            }
            self.process(item).await;
            self.queue.task_done();
        }
        tracing::debug!("merge worker stopped");
    }

    async fn process(&self, item: MergeItem) {
        let MergeItem {
            task,
            result,
            reviews,
            engineer_id,
        } = item;

        tracing::info!(
            task_id = %task.id,
            branch = task.branch_name.as_deref().unwrap_or("?"),
            "merge started"
        );

        match self.coordinator.attempt(&task).await {
            MergeAttempt::Merged => {
                self.sink.log(logging::record(
                    "merge-coordinator",
                    &task.id.to_string(),
                    LogLevel::Info,
                    format!("merge completed: {}", task.title),
                ));
                self.bus.emit(PipelineEvent::MergeCompleted {
                    task: task.clone(),
                    success: true,
                    error: None,
                });
                self.coordinator.cleanup_merged(&task).await;
            }
            MergeAttempt::Conflict { paths } => {
                self.sink.log(logging::record(
                    "merge-coordinator",
                    &task.id.to_string(),
                    LogLevel::Warn,
                    format!(
                        "merge conflict detected: {} ({} files)",
                        task.title,
                        paths.len()
                    ),
                ));
                self.bus.emit(PipelineEvent::MergeConflictDetected {
                    task,
                    result,
                    reviews,
                    engineer_id,
                });
            }
            MergeAttempt::Failed { error } => {
                self.sink.log(logging::record(
                    "merge-coordinator",
                    &task.id.to_string(),
                    LogLevel::Error,
                    format!("merge failed: {} ({error})", task.title),
                ));
                self.bus.emit(PipelineEvent::MergeCompleted {
                    task: task.clone(),
                    success: false,
                    error: Some(error.clone()),
                });
                self.bus.emit(PipelineEvent::TaskFailed {
                    task,
                    error,
                    phase: FailurePhase::Merge,
                });
            }
        }
    }
}
