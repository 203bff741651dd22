//! Pipeline manager: owns the three stage queues and wires them together.
//!
//! The manager holds the task graph, the worktree manager, the event bus,
//! and the engineer cache; stages communicate only through events, and all
//! graph mutation happens in the manager's listeners so lifecycle state has
//! a single writer.
//!
//! Event wiring:
//!
//! | event                      | action                                      |
//! |----------------------------|---------------------------------------------|
//! | DEVELOPMENT_COMPLETED      | record workspace, enqueue review            |
//! | REVIEW_COMPLETED (revise)  | re-admit to development as `[修正]` revision |
//! | MERGE_READY                | enqueue merge                               |
//! | MERGE_CONFLICT_DETECTED    | synthesize conflict-resolution task         |
//! | MERGE_COMPLETED (success)  | mark merged, admit newly-ready tasks        |
//! | TASK_FAILED                | mark failed, release engineer and worktree  |

pub mod queue;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agents::{EngineerCache, RoleConfig, prompts};
use crate::config::{ConfigError, PipelineConfig};
use crate::develop::{DevItem, DevelopmentStage};
use crate::events::{EventBus, EventKind, PipelineEvent};
use crate::executor::AgentExecutor;
use crate::graph::{GraphError, TaskGraph};
use crate::logging::{SharedSink, TracingSink};
use crate::merge::{MergeCoordinator, MergeItem, MergeStage};
use crate::report::{CompletionReporter, PipelineReport};
use crate::review::{ReviewItem, ReviewStage};
use crate::statefile::StateFiles;
use crate::task::{ConflictLink, FailurePhase, ReviewResult, Task, TaskPriority, TaskType};
use crate::worktree::{WorktreeError, WorktreeManager};

use queue::StageQueue;

/// Fatal errors before the pipeline starts.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Shared pipeline state captured by the event listeners.
struct Shared {
    config: PipelineConfig,
    bus: Arc<EventBus>,
    graph: Mutex<TaskGraph>,
    worktrees: Arc<WorktreeManager>,
    engineers: Arc<EngineerCache>,
    dev_queue: Arc<StageQueue<DevItem>>,
    review_queue: Arc<StageQueue<ReviewItem>>,
    merge_queue: Arc<StageQueue<MergeItem>>,
    /// Review history per original task id.
    reviews: Mutex<HashMap<Uuid, Vec<ReviewResult>>>,
    /// Revision rounds consumed per original task id.
    review_rounds: Mutex<HashMap<Uuid, u32>>,
    reporter: CompletionReporter,
    statefiles: StateFiles,
    cancel: CancellationToken,
}

impl Shared {
    /// Admit a task to the development stage: `ready -> running`, then
    /// enqueue at its priority.
    fn admit(&self, task: Task) {
        {
            let mut graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
            graph.mark_running(task.graph_id());
        }
        tracing::info!(task_id = %task.id, title = %task.title, "task admitted to development");
        self.dev_queue
            .push(task.priority.weight(), DevItem { task, attempt: 0 });
    }

    /// Overwrite the `.kugutsu/` snapshot files. Best-effort.
    fn write_state(&self) {
        let snapshot = {
            let graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
            graph.snapshot()
        };
        if let Err(e) = self.statefiles.write_snapshot(&snapshot) {
            tracing::debug!(error = %e, "failed to write pipeline snapshot");
        }
        if let Err(e) = self.statefiles.write_completion_status(&snapshot) {
            tracing::debug!(error = %e, "failed to write completion status");
        }
    }

    /// Release the engineer sessions tied to a task (both the event task's
    /// id and, for conflict resolutions, the original's).
    fn drop_engineers(&self, task: &Task) {
        self.engineers.remove(task.id);
        let gid = task.graph_id();
        if gid != task.id {
            self.engineers.remove(gid);
        }
    }
}

/// The pipeline manager.
pub struct PipelineManager {
    shared: Arc<Shared>,
    executor: Arc<dyn AgentExecutor>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    coordinator: Arc<MergeCoordinator>,
    sink: SharedSink,
}

impl PipelineManager {
    /// Build a pipeline for a planned task list.
    ///
    /// Fails fast on invalid configuration, a base path that is not a git
    /// repository, or a cyclic task graph.
    pub fn new(
        config: PipelineConfig,
        tasks: Vec<Task>,
        executor: Arc<dyn AgentExecutor>,
    ) -> Result<Self, SetupError> {
        config.validate()?;

        let worktrees = Arc::new(WorktreeManager::new(
            &config.base_repo,
            &config.worktree_root,
            &config.base_branch,
        )?);
        let graph = TaskGraph::load(tasks)?;
        let total_tasks = graph.snapshot().len();

        let project = config
            .base_repo
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("project")
            .to_string();
        let statefiles = StateFiles::new(&config.base_repo, &project);

        let coordinator = Arc::new(MergeCoordinator::new(
            &config.base_repo,
            &config.base_branch,
            config.use_remote,
            Arc::clone(&worktrees),
        ));

        let shared = Arc::new(Shared {
            bus: Arc::new(EventBus::new(config.max_listeners)),
            graph: Mutex::new(graph),
            worktrees,
            engineers: Arc::new(EngineerCache::new()),
            dev_queue: Arc::new(StageQueue::new("development")),
            review_queue: Arc::new(StageQueue::new("review")),
            merge_queue: Arc::new(StageQueue::new("merge")),
            reviews: Mutex::new(HashMap::new()),
            review_rounds: Mutex::new(HashMap::new()),
            reporter: CompletionReporter::new(total_tasks),
            statefiles,
            cancel: CancellationToken::new(),
            config,
        });

        Ok(Self {
            shared,
            executor,
            workers: Mutex::new(Vec::new()),
            coordinator,
            sink: Arc::new(TracingSink),
        })
    }

    /// Replace the log sink (defaults to [`TracingSink`]). External viewers
    /// attach here; call before [`PipelineManager::start`].
    pub fn with_log_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.shared.bus
    }

    pub fn coordinator(&self) -> &Arc<MergeCoordinator> {
        &self.coordinator
    }

    /// Trigger a graceful shutdown: cancel in-flight executor calls and
    /// stop admitting work. In-flight merges run to completion.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Run the pipeline to completion and produce the final report.
    pub async fn run(&self) -> PipelineReport {
        self.start();
        self.wait_for_completion().await;
        self.finish().await
    }

    /// Register listeners, spawn stage workers, and admit every initially
    /// ready task. Call once.
    pub fn start(&self) {
        let shared = &self.shared;

        if let Err(e) = shared.statefiles.prepare() {
            tracing::warn!(error = %e, "failed to prepare .kugutsu directory");
        } else {
            let graph = shared.graph.lock().unwrap_or_else(|e| e.into_inner());
            for (task, _) in graph.snapshot() {
                if let Err(e) = shared.statefiles.write_task_instructions(&task) {
                    tracing::debug!(task_id = %task.id, error = %e, "failed to write task instructions");
                }
            }
        }

        self.wire();
        self.spawn_stages();

        let ready = {
            let graph = shared.graph.lock().unwrap_or_else(|e| e.into_inner());
            graph.ready_tasks()
        };
        for task in ready {
            shared.admit(task);
        }
        shared.write_state();
    }

    /// Block until every queue is idle and every task is merged, failed, or
    /// permanently blocked behind a failed dependency.
    pub async fn wait_for_completion(&self) {
        loop {
            if self.is_settled() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Stop the stages and build the final report.
    pub async fn finish(&self) -> PipelineReport {
        let shared = &self.shared;
        shared.dev_queue.close();
        shared.review_queue.close();
        shared.merge_queue.close();

        let workers = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for handle in workers {
            let _ = handle.await;
        }

        if shared.config.cleanup_on_success {
            if let Err(e) = shared.worktrees.prune().await {
                tracing::debug!(error = %e, "worktree prune failed");
            }
        }

        shared.write_state();
        let graph = shared.graph.lock().unwrap_or_else(|e| e.into_inner());
        shared.reporter.report(&graph)
    }

    fn is_settled(&self) -> bool {
        let shared = &self.shared;
        if !(shared.dev_queue.is_idle()
            && shared.review_queue.is_idle()
            && shared.merge_queue.is_idle())
        {
            return false;
        }
        let graph = shared.graph.lock().unwrap_or_else(|e| e.into_inner());
        graph
            .non_terminal()
            .into_iter()
            .all(|id| graph.is_unreachable(id))
    }

    fn spawn_stages(&self) {
        let shared = &self.shared;
        let concurrency = shared.config.max_concurrent_engineers;
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());

        let develop = Arc::new(DevelopmentStage::new(
            Arc::clone(&self.executor),
            Arc::clone(&shared.worktrees),
            Arc::clone(&shared.engineers),
            Arc::clone(&shared.bus),
            Arc::clone(&shared.dev_queue),
            RoleConfig::engineer(shared.config.max_turns),
            shared.config.dev_retry_limit,
            Arc::clone(&self.sink),
            shared.cancel.clone(),
        ));
        workers.extend(develop.spawn_workers(concurrency));

        let review = Arc::new(ReviewStage::new(
            Arc::clone(&self.executor),
            Arc::clone(&shared.bus),
            Arc::clone(&shared.review_queue),
            RoleConfig::tech_lead(shared.config.max_turns),
            shared.config.default_verdict,
            Arc::clone(&self.sink),
            shared.cancel.clone(),
        ));
        workers.extend(review.spawn_workers(concurrency));

        let merge = Arc::new(MergeStage::new(
            Arc::clone(&self.coordinator),
            Arc::clone(&shared.bus),
            Arc::clone(&shared.merge_queue),
            Arc::clone(&self.sink),
            shared.cancel.clone(),
        ));
        workers.push(merge.spawn_worker());
    }

    // -----------------------------------------------------------------
    // Event wiring
    // -----------------------------------------------------------------

    fn wire(&self) {
        self.on_development_completed();
        self.on_review_completed();
        self.on_merge_ready();
        self.on_merge_conflict();
        self.on_merge_completed();
        self.on_task_failed();
        self.on_dependency_resolved();
    }

    fn on_development_completed(&self) {
        let s = Arc::clone(&self.shared);
        self.shared
            .bus
            .subscribe(EventKind::DevelopmentCompleted, move |env| {
                let PipelineEvent::DevelopmentCompleted { task, result, .. } = &env.event else {
                    return Ok(());
                };
                let gid = task.graph_id();

                {
                    let mut graph = s.graph.lock().unwrap_or_else(|e| e.into_inner());
                    if let (Some(branch), Some(path)) = (&task.branch_name, &task.worktree_path)
                    {
                        graph.assign_workspace(gid, branch.clone(), path.clone());
                    }
                    graph.mark_developed(gid);
                    graph.mark_reviewing(gid);
                }

                let prior_reviews = {
                    let reviews = s.reviews.lock().unwrap_or_else(|e| e.into_inner());
                    reviews.get(&gid).cloned().unwrap_or_default()
                };
                s.review_queue.push(
                    task.priority.weight(),
                    ReviewItem {
                        task: task.clone(),
                        result: result.clone(),
                        prior_reviews,
                    },
                );
                s.write_state();
                Ok(())
            });
    }

    fn on_review_completed(&self) {
        let s = Arc::clone(&self.shared);
        self.shared
            .bus
            .subscribe(EventKind::ReviewCompleted, move |env| {
                let PipelineEvent::ReviewCompleted {
                    task,
                    review,
                    needs_revision,
                    ..
                } = &env.event
                else {
                    return Ok(());
                };
                let gid = task.graph_id();

                {
                    let mut reviews = s.reviews.lock().unwrap_or_else(|e| e.into_inner());
                    reviews.entry(gid).or_default().push(review.clone());
                }

                if !*needs_revision {
                    // Approval continues via MERGE_READY; reviewer errors
                    // continue via TASK_FAILED. Nothing to do here.
                    s.write_state();
                    return Ok(());
                }

                let rounds = {
                    let mut rounds = s.review_rounds.lock().unwrap_or_else(|e| e.into_inner());
                    let entry = rounds.entry(gid).or_insert(0);
                    *entry += 1;
                    *entry
                };

                if rounds > s.config.max_review_retries {
                    tracing::error!(
                        task_id = %task.id,
                        rounds,
                        "review retries exhausted"
                    );
                    let failed_task = task.clone();
                    s.write_state();
                    s.bus.emit(PipelineEvent::TaskFailed {
                        task: failed_task,
                        error: format!(
                            "review requested changes {rounds} times (limit {})",
                            s.config.max_review_retries
                        ),
                        phase: FailurePhase::Review,
                    });
                    return Ok(());
                }

                // Re-admit as a revision: comments appended, title marked.
                let mut revised = task.clone();
                revised.title = prompts::revision_title(&revised.title);
                revised.description = prompts::revision_description(&revised.description, review);

                {
                    let mut graph = s.graph.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(stored) = graph.task_mut(gid) {
                        stored.title = revised.title.clone();
                        stored.description = revised.description.clone();
                    }
                    graph.mark_running(gid);
                }

                tracing::info!(
                    task_id = %task.id,
                    round = rounds,
                    "revision requested, re-admitting to development"
                );
                s.dev_queue.push(
                    revised.priority.weight(),
                    DevItem {
                        task: revised,
                        attempt: 0,
                    },
                );
                s.write_state();
                Ok(())
            });
    }

    fn on_merge_ready(&self) {
        let s = Arc::clone(&self.shared);
        self.shared.bus.subscribe(EventKind::MergeReady, move |env| {
            let PipelineEvent::MergeReady {
                task,
                result,
                reviews,
                engineer_id,
            } = &env.event
            else {
                return Ok(());
            };

            {
                let mut graph = s.graph.lock().unwrap_or_else(|e| e.into_inner());
                graph.mark_merging(task.graph_id());
            }
            s.merge_queue.push(
                task.priority.weight(),
                MergeItem {
                    task: task.clone(),
                    result: result.clone(),
                    reviews: reviews.clone(),
                    engineer_id: engineer_id.clone(),
                },
            );
            s.write_state();
            Ok(())
        });
    }

    fn on_merge_conflict(&self) {
        let s = Arc::clone(&self.shared);
        self.shared
            .bus
            .subscribe(EventKind::MergeConflictDetected, move |env| {
                let PipelineEvent::MergeConflictDetected {
                    task,
                    result,
                    reviews,
                    engineer_id,
                } = &env.event
                else {
                    return Ok(());
                };
                let gid = task.graph_id();

                {
                    let mut graph = s.graph.lock().unwrap_or_else(|e| e.into_inner());
                    graph.mark_running(gid);
                }

                // Synthesize the conflict-resolution task: priority high,
                // same worktree (deliberately not released), fresh id,
                // linked back to the original.
                let resolution = conflict_resolution_task(
                    task,
                    result.clone(),
                    reviews.clone(),
                    engineer_id.clone(),
                    &s.config.base_branch,
                );
                tracing::info!(
                    task_id = %task.id,
                    resolution_id = %resolution.id,
                    "conflict resolution task synthesized"
                );
                s.dev_queue.push(
                    TaskPriority::High.weight(),
                    DevItem {
                        task: resolution,
                        attempt: 0,
                    },
                );
                s.write_state();
                Ok(())
            });
    }

    fn on_merge_completed(&self) {
        let s = Arc::clone(&self.shared);
        self.shared
            .bus
            .subscribe(EventKind::MergeCompleted, move |env| {
                let PipelineEvent::MergeCompleted { task, success, .. } = &env.event else {
                    return Ok(());
                };
                if !*success {
                    // The coordinator emits TASK_FAILED alongside; the
                    // failure listener owns the bookkeeping.
                    return Ok(());
                }
                let gid = task.graph_id();

                let (newly_ready, merged_task) = {
                    let mut graph = s.graph.lock().unwrap_or_else(|e| e.into_inner());
                    let newly = graph.mark_merged(gid);
                    let merged = graph.task(gid).cloned();
                    (newly, merged)
                };

                s.drop_engineers(task);
                if let Some(merged) = merged_task {
                    s.reporter.record_merged(&merged);
                }

                if !newly_ready.is_empty() {
                    s.bus.emit(PipelineEvent::DependencyResolved {
                        merged_task_id: gid,
                        ready_tasks: newly_ready.clone(),
                    });
                    for next in newly_ready {
                        s.admit(next);
                    }
                }
                s.write_state();
                Ok(())
            });
    }

    fn on_task_failed(&self) {
        let s = Arc::clone(&self.shared);
        self.shared.bus.subscribe(EventKind::TaskFailed, move |env| {
            let PipelineEvent::TaskFailed { task, error, phase } = &env.event else {
                return Ok(());
            };
            let gid = task.graph_id();

            let affected = {
                let mut graph = s.graph.lock().unwrap_or_else(|e| e.into_inner());
                match graph.state(gid) {
                    Some(state) if !state.is_terminal() => graph.mark_failed(gid),
                    _ => {
                        tracing::warn!(task_id = %task.id, "duplicate failure event ignored");
                        return Ok(());
                    }
                }
            };

            s.reporter.record_failed(task, *phase, error);
            s.drop_engineers(task);

            // Merge conflicts are not failures and never reach here, so the
            // failing task's worktree is always released.
            let worktrees = Arc::clone(&s.worktrees);
            tokio::spawn(async move { worktrees.release(gid).await });

            if !affected.is_empty() {
                tracing::warn!(
                    task_id = %task.id,
                    blocked = affected.len(),
                    "dependents left blocked by failure"
                );
            }
            s.write_state();
            Ok(())
        });
    }

    fn on_dependency_resolved(&self) {
        self.shared
            .bus
            .subscribe(EventKind::DependencyResolved, move |env| {
                let PipelineEvent::DependencyResolved {
                    merged_task_id,
                    ready_tasks,
                } = &env.event
                else {
                    return Ok(());
                };
                tracing::info!(
                    merged_task_id = %merged_task_id,
                    promoted = ready_tasks.len(),
                    "dependencies resolved"
                );
                Ok(())
            });
    }
}

/// Build the synthetic conflict-resolution task for a conflicted merge.
fn conflict_resolution_task(
    conflicted: &Task,
    prior_result: crate::task::EngineerResult,
    prior_reviews: Vec<ReviewResult>,
    engineer_id: String,
    base_branch: &str,
) -> Task {
    let original_id = conflicted.graph_id();
    let description = format!(
        "Merging `{base_branch}` into branch `{branch}` produced conflicts.\n\
         Run `git merge {base_branch}` in this worktree, resolve every\n\
         conflict, and commit the merge.\n\n\
         ## Original task\n{original}",
        base_branch = base_branch,
        branch = conflicted.branch_name.as_deref().unwrap_or("?"),
        original = conflicted.description,
    );

    let mut task = Task::new(
        TaskType::ConflictResolution,
        format!("Resolve merge conflict: {}", conflicted.title),
        description,
    )
    .with_priority(TaskPriority::High);
    task.branch_name = conflicted.branch_name.clone();
    task.worktree_path = conflicted.worktree_path.clone();
    task.conflict = Some(Box::new(ConflictLink {
        original_task_id: original_id,
        prior_result,
        prior_reviews,
        engineer_id,
    }));
    task
}
