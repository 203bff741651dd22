//! Core data model: tasks, engineer/review results, and failure phases.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Kind of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    Feature,
    Bugfix,
    Refactor,
    Test,
    Docs,
    /// Synthetic task created when a merge attempt hit conflicts. Always
    /// priority-high and always carries a [`ConflictLink`].
    ConflictResolution,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Feature => "feature",
            Self::Bugfix => "bugfix",
            Self::Refactor => "refactor",
            Self::Test => "test",
            Self::Docs => "docs",
            Self::ConflictResolution => "conflict-resolution",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskType {
    type Err = TaskTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "feature" => Ok(Self::Feature),
            "bugfix" => Ok(Self::Bugfix),
            "refactor" => Ok(Self::Refactor),
            "test" => Ok(Self::Test),
            "docs" => Ok(Self::Docs),
            "conflict-resolution" => Ok(Self::ConflictResolution),
            other => Err(TaskTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskType`] string.
#[derive(Debug, Clone)]
pub struct TaskTypeParseError(pub String);

impl fmt::Display for TaskTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task type: {:?}", self.0)
    }
}

impl std::error::Error for TaskTypeParseError {}

// ---------------------------------------------------------------------------

/// Scheduling priority of a task.
///
/// The development queue orders by [`TaskPriority::weight`] (descending)
/// with FIFO tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    High,
    Medium,
    Low,
}

impl TaskPriority {
    /// Numeric queue weight: high = 50, medium = 0, low = -50.
    pub fn weight(self) -> i32 {
        match self {
            Self::High => 50,
            Self::Medium => 0,
            Self::Low => -50,
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskPriority {
    type Err = TaskPriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(TaskPriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskPriority`] string.
#[derive(Debug, Clone)]
pub struct TaskPriorityParseError(pub String);

impl fmt::Display for TaskPriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task priority: {:?}", self.0)
    }
}

impl std::error::Error for TaskPriorityParseError {}

// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
///
/// Transitions are enforced by [`crate::graph::TaskGraph`]:
///
/// ```text
/// waiting   -> ready      (all dependencies merged)
/// ready     -> running    (admitted to development)
/// running   -> developed  (engineer succeeded)
/// developed -> reviewing
/// reviewing -> running    (revision requested)
/// reviewing -> merging
/// merging   -> merged
/// merging   -> running    (merge conflict, re-entered development)
/// any       -> failed     (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Waiting,
    Ready,
    Running,
    Developed,
    Reviewing,
    Merging,
    Merged,
    Failed,
}

impl TaskState {
    /// Whether this state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Developed => "developed",
            Self::Reviewing => "reviewing",
            Self::Merging => "merging",
            Self::Merged => "merged",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// The pipeline phase in which a terminal failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    Development,
    Review,
    Merge,
    Setup,
}

impl fmt::Display for FailurePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Development => "development",
            Self::Review => "review",
            Self::Merge => "merge",
            Self::Setup => "setup",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Linkage carried by a conflict-resolution task back to the task whose
/// merge collided with the base branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictLink {
    /// The task whose merge hit conflicts.
    pub original_task_id: Uuid,
    /// The engineer result that was about to be merged.
    pub prior_result: EngineerResult,
    /// Review history accumulated before the conflict.
    pub prior_reviews: Vec<ReviewResult>,
    /// Engineer that produced the conflicting work.
    pub engineer_id: String,
}

/// A unit of development work flowing through the pipeline.
///
/// Created once by the planner and owned by the pipeline manager for its
/// entire journey. `branch_name` and `worktree_path` are set exactly once,
/// from the pair returned by `WorktreeManager::acquire`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: TaskType,
    pub title: String,
    pub description: String,
    pub priority: TaskPriority,
    /// Identifiers of tasks that must be merged before this one starts.
    pub dependencies: Vec<Uuid>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<PathBuf>,
    /// Present iff `task_type == ConflictResolution`.
    pub conflict: Option<Box<ConflictLink>>,
}

impl Task {
    /// Create a task with no dependencies and medium priority.
    pub fn new(task_type: TaskType, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type,
            title: title.into(),
            description: description.into(),
            priority: TaskPriority::Medium,
            dependencies: Vec::new(),
            branch_name: None,
            worktree_path: None,
            conflict: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Whether this is a synthetic conflict-resolution task.
    pub fn is_conflict_resolution(&self) -> bool {
        self.task_type == TaskType::ConflictResolution
    }

    /// The task id used for dependency bookkeeping: a conflict-resolution
    /// task stands in for its original, so readiness propagation and state
    /// tracking key off the original id.
    pub fn graph_id(&self) -> Uuid {
        match &self.conflict {
            Some(link) => link.original_task_id,
            None => self.id,
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of one engineer pass over a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineerResult {
    pub task_id: Uuid,
    /// Engineer (executor session owner) that produced this result.
    pub engineer_id: String,
    pub success: bool,
    /// Raw transcript of the executor session.
    pub transcript: Vec<String>,
    pub error: Option<String>,
    /// Wall-clock duration of the executor invocation, in milliseconds.
    pub duration_ms: u64,
    /// Paths reported changed by `git status --porcelain` in the worktree.
    pub changed_files: Vec<String>,
    /// Set when this result came out of a conflict resolution, so the
    /// review stage does not short-circuit on prior approvals.
    pub needs_re_review: bool,
}

/// Verdict returned by a TechLead review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewVerdict {
    Approved,
    ChangesRequested,
    Commented,
    Error,
}

impl fmt::Display for ReviewVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Approved => "APPROVED",
            Self::ChangesRequested => "CHANGES_REQUESTED",
            Self::Commented => "COMMENTED",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Outcome of one review pass over a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResult {
    pub task_id: Uuid,
    pub verdict: ReviewVerdict,
    /// Reviewer comments in transcript order.
    pub comments: Vec<String>,
    pub reviewer_id: String,
    pub timestamp: DateTime<Utc>,
    /// Wall-clock duration of the review, in milliseconds.
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl ReviewResult {
    /// Whether this review sends the task back to development.
    pub fn needs_revision(&self) -> bool {
        self.verdict == ReviewVerdict::ChangesRequested
    }
}
