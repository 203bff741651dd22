//! Review workflow: TechLead verdicts over developed tasks.
//!
//! One review attempt per queued item. The TechLead is short-lived and
//! stateless across tasks: every review is a fresh executor session. The
//! parsed verdict drives the pipeline: CHANGES_REQUESTED sends the task
//! back to development (pipeline policy, bounded by `max_review_retries`),
//! APPROVED and COMMENTED hand the task to merge, executor failures are
//! terminal without retry.

pub mod verdict;

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agents::{RoleConfig, prompts};
use crate::events::{EventBus, PipelineEvent};
use crate::executor::{AgentExecutor, ExecutionRequest};
use crate::logging::{self, LogLevel, SharedSink};
use crate::pipeline::queue::StageQueue;
use crate::task::{EngineerResult, FailurePhase, ReviewResult, ReviewVerdict, Task};

/// One unit of review work.
#[derive(Debug, Clone)]
pub struct ReviewItem {
    pub task: Task,
    pub result: EngineerResult,
    /// Review history from earlier rounds, carried so approval events can
    /// ship the full history to the merge stage.
    pub prior_reviews: Vec<ReviewResult>,
}

/// The review stage.
pub struct ReviewStage {
    executor: Arc<dyn AgentExecutor>,
    bus: Arc<EventBus>,
    queue: Arc<StageQueue<ReviewItem>>,
    role: RoleConfig,
    default_verdict: ReviewVerdict,
    sink: SharedSink,
    cancel: CancellationToken,
}

impl ReviewStage {
    pub fn new(
        executor: Arc<dyn AgentExecutor>,
        bus: Arc<EventBus>,
        queue: Arc<StageQueue<ReviewItem>>,
        role: RoleConfig,
        default_verdict: ReviewVerdict,
        sink: SharedSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            executor,
            bus,
            queue,
            role,
            default_verdict,
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
        tracing::debug!(worker = index, "review worker started");
        while let Some(item) = self.queue.pop().await {
            self.process(item).await;
            self.queue.task_done();
        }
        tracing::debug!(worker = index, "review worker stopped");
    }

    async fn process(&self, item: ReviewItem) {
        let ReviewItem {
            task,
            result,
            mut prior_reviews,
        } = item;

        let reviewer_id = format!("techlead-{}", Uuid::new_v4().simple());
        tracing::info!(
            task_id = %task.id,
            reviewer_id = %reviewer_id,
            round = prior_reviews.len() + 1,
            "review started"
        );

        let Some(worktree_path) = task.worktree_path.clone() else {
            // A task can only reach review through development, which sets
            // the worktree; reaching here without one is a wiring bug.
            self.fail(task, result, reviewer_id, "task has no worktree to review".into());
            return;
        };

        let request = ExecutionRequest {
            prompt: prompts::review(&task, &result),
            working_dir: worktree_path,
            max_turns: self.role.max_turns,
            allowed_tools: self.role.allowed_tools.clone(),
            resume: None,
            cancel: self.cancel.child_token(),
        };

        let started = Utc::now();
        let outcome = match self.executor.execute(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail(task, result, reviewer_id, format!("executor failed: {e:#}"));
                return;
            }
        };

        if !outcome.success {
            let error = outcome
                .error
                .unwrap_or_else(|| "reviewer reported failure".to_string());
            self.fail(task, result, reviewer_id, error);
            return;
        }

        let text = outcome.assistant_text();
        let verdict = verdict::parse_verdict(&text, self.default_verdict);
        let comments = verdict::parse_comments(&text);

        let review = ReviewResult {
            task_id: task.id,
            verdict,
            comments,
            reviewer_id,
            timestamp: started,
            duration_ms: outcome.duration.as_millis() as u64,
            error: None,
        };

        self.sink.log(logging::record(
            "techlead",
            &review.reviewer_id,
            LogLevel::Info,
            format!(
                "review completed: {} -> {verdict} ({} comments)",
                task.title,
                review.comments.len()
            ),
        ));

        let needs_revision = review.needs_revision();
        self.bus.emit(PipelineEvent::ReviewCompleted {
            task: task.clone(),
            review: review.clone(),
            result: result.clone(),
            needs_revision,
        });

        if !needs_revision {
            prior_reviews.push(review);
            let engineer_id = result.engineer_id.clone();
            self.bus.emit(PipelineEvent::MergeReady {
                task,
                result,
                reviews: prior_reviews,
                engineer_id,
            });
        }
    }

    /// Reviewer infrastructure failures are terminal: a verdict-ERROR
    /// review is recorded, then the task fails in the review phase.
    fn fail(&self, task: Task, result: EngineerResult, reviewer_id: String, error: String) {
        self.sink.log(logging::record(
            "techlead",
            &reviewer_id,
            LogLevel::Error,
            format!("review failed: {} ({error})", task.title),
        ));

        let review = ReviewResult {
            task_id: task.id,
            verdict: ReviewVerdict::Error,
            comments: vec![],
            reviewer_id,
            timestamp: Utc::now(),
            duration_ms: 0,
            error: Some(error.clone()),
        };

        self.bus.emit(PipelineEvent::ReviewCompleted {
            task: task.clone(),
            review,
            result,
            needs_revision: false,
        });
        self.bus.emit(PipelineEvent::TaskFailed {
            task,
            error,
            phase: FailurePhase::Review,
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
    use std::sync::Mutex;
    use std::time::Duration;
    use crate::task::TaskType;

    /// Executor that replies with a fixed review transcript.
    struct FixedReviewer {
        reply: String,
        succeed: bool,
    }

    #[async_trait]
    impl AgentExecutor for FixedReviewer {
        fn name(&self) -> &str {
            "fixed-reviewer"
        }

        async fn execute(&self, _request: ExecutionRequest) -> Result<ExecutionOutcome> {
            Ok(ExecutionOutcome {
                success: self.succeed,
                transcript: vec![Message::AssistantText {
                    text: self.reply.clone(),
                }],
                session_id: None,
                error: if self.succeed { None } else { Some("boom".into()) },
                duration: Duration::from_millis(1),
            })
        }
    }

    fn stage(reply: &str, succeed: bool) -> (Arc<ReviewStage>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new(16));
        let queue = Arc::new(StageQueue::new("review"));
        let stage = Arc::new(ReviewStage::new(
            Arc::new(FixedReviewer {
                reply: reply.to_string(),
                succeed,
            }),
            Arc::clone(&bus),
            queue,
            RoleConfig::tech_lead(15),
            ReviewVerdict::Approved,
            Arc::new(logging::NoopSink),
            CancellationToken::new(),
        ));
        (stage, bus)
    }

    fn reviewed_task() -> (Task, EngineerResult) {
        let mut task = Task::new(TaskType::Feature, "t", "d");
        task.branch_name = Some("feature/task-x".into());
        task.worktree_path = Some("/tmp/task-x".into());
        let result = EngineerResult {
            task_id: task.id,
            engineer_id: "engineer-1".into(),
            success: true,
            transcript: vec![],
            error: None,
            duration_ms: 5,
            changed_files: vec!["src/lib.rs".into()],
            needs_re_review: false,
        };
        (task, result)
    }

    fn collect(bus: &EventBus, kind: EventKind) -> Arc<Mutex<Vec<PipelineEvent>>> {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let sink_clone = Arc::clone(&sink);
        bus.subscribe(kind, move |envelope| {
            sink_clone.lock().unwrap().push(envelope.event.clone());
            Ok(())
        });
        sink
    }

    #[tokio::test]
    async fn approval_emits_review_completed_then_merge_ready() {
        let (stage, bus) = stage("レビュー結果: APPROVED\n良い実装です。", true);
        let reviews = collect(&bus, EventKind::ReviewCompleted);
        let merges = collect(&bus, EventKind::MergeReady);

        let (task, result) = reviewed_task();
        stage
            .process(ReviewItem {
                task,
                result,
                prior_reviews: vec![],
            })
            .await;

        let review_events = reviews.lock().unwrap();
        assert_eq!(review_events.len(), 1);
        match &review_events[0] {
            PipelineEvent::ReviewCompleted {
                review,
                needs_revision,
                ..
            } => {
                assert_eq!(review.verdict, ReviewVerdict::Approved);
                assert!(!*needs_revision);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let merge_events = merges.lock().unwrap();
        assert_eq!(merge_events.len(), 1);
        match &merge_events[0] {
            PipelineEvent::MergeReady { reviews, .. } => {
                assert_eq!(reviews.len(), 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn changes_requested_sets_needs_revision_without_merge_ready() {
        let (stage, bus) = stage(
            "レビュー結果: CHANGES_REQUESTED\n- Add test\n- Fix naming",
            true,
        );
        let reviews = collect(&bus, EventKind::ReviewCompleted);
        let merges = collect(&bus, EventKind::MergeReady);

        let (task, result) = reviewed_task();
        stage
            .process(ReviewItem {
                task,
                result,
                prior_reviews: vec![],
            })
            .await;

        match &reviews.lock().unwrap()[0] {
            PipelineEvent::ReviewCompleted {
                review,
                needs_revision,
                ..
            } => {
                assert!(*needs_revision);
                assert_eq!(review.comments, vec!["Add test", "Fix naming"]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(merges.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn commented_verdict_still_reaches_merge() {
        let (stage, bus) = stage("レビュー結果: COMMENTED\n- Consider a rename", true);
        let merges = collect(&bus, EventKind::MergeReady);

        let (task, result) = reviewed_task();
        stage
            .process(ReviewItem {
                task,
                result,
                prior_reviews: vec![],
            })
            .await;

        assert_eq!(merges.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reviewer_failure_is_terminal() {
        let (stage, bus) = stage("", false);
        let reviews = collect(&bus, EventKind::ReviewCompleted);
        let failures = collect(&bus, EventKind::TaskFailed);
        let merges = collect(&bus, EventKind::MergeReady);

        let (task, result) = reviewed_task();
        stage
            .process(ReviewItem {
                task,
                result,
                prior_reviews: vec![],
            })
            .await;

        match &reviews.lock().unwrap()[0] {
            PipelineEvent::ReviewCompleted { review, .. } => {
                assert_eq!(review.verdict, ReviewVerdict::Error);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match &failures.lock().unwrap()[0] {
            PipelineEvent::TaskFailed { phase, .. } => {
                assert_eq!(*phase, FailurePhase::Review);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(merges.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn merge_ready_accumulates_history() {
        let (stage, bus) = stage("レビュー結果: APPROVED", true);
        let merges = collect(&bus, EventKind::MergeReady);

        let (task, result) = reviewed_task();
        let earlier = ReviewResult {
            task_id: task.id,
            verdict: ReviewVerdict::ChangesRequested,
            comments: vec!["Add test".into()],
            reviewer_id: "techlead-early".into(),
            timestamp: Utc::now(),
            duration_ms: 3,
            error: None,
        };

        stage
            .process(ReviewItem {
                task,
                result,
                prior_reviews: vec![earlier],
            })
            .await;

        match &merges.lock().unwrap()[0] {
            PipelineEvent::MergeReady { reviews, .. } => {
                assert_eq!(reviews.len(), 2);
                assert_eq!(reviews[0].verdict, ReviewVerdict::ChangesRequested);
                assert_eq!(reviews[1].verdict, ReviewVerdict::Approved);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
