//! kugutsu-core: a multi-agent development pipeline.
//!
//! Given a list of tasks with dependencies, the pipeline carries each task
//! through parallel development (LLM engineers in per-task git worktrees),
//! code review (TechLead verdicts), and serialized merging into a single
//! base branch, ending with a clean history of reviewed merge commits.
//!
//! ```text
//! planner -> PipelineManager -> DevelopmentStage -> AgentExecutor
//!                |                    |
//!                |              DEVELOPMENT_COMPLETED
//!                |                    v
//!                |              ReviewStage -> AgentExecutor
//!                |                    |
//!                |           REVIEW_COMPLETED / MERGE_READY
//!                |                    v
//!                |              MergeCoordinator --conflict--> back to
//!                |                    |                        development
//!                |              MERGE_COMPLETED
//!                v                    v
//!          TaskGraph readiness   CompletionReporter
//! ```

pub mod agents;
pub mod config;
pub mod develop;
pub mod events;
pub mod executor;
pub mod git;
pub mod graph;
pub mod logging;
pub mod merge;
pub mod pipeline;
pub mod planner;
pub mod report;
pub mod review;
pub mod statefile;
pub mod task;
pub mod worktree;

pub use config::PipelineConfig;
pub use pipeline::{PipelineManager, SetupError};
pub use report::PipelineReport;
pub use task::{Task, TaskPriority, TaskType};
