//! Completion tracking and the final pipeline report.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::graph::TaskGraph;
use crate::task::{FailurePhase, Task};

/// A merged task in the final report.
#[derive(Debug, Clone, Serialize)]
pub struct MergedSummary {
    pub task_id: Uuid,
    pub title: String,
    pub merged_at: DateTime<Utc>,
}

/// A failed task in the final report.
#[derive(Debug, Clone, Serialize)]
pub struct FailureSummary {
    pub task_id: Uuid,
    pub title: String,
    pub phase: FailurePhase,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// A task left blocked behind a failed dependency.
#[derive(Debug, Clone, Serialize)]
pub struct BlockedSummary {
    pub task_id: Uuid,
    pub title: String,
    /// The failed dependencies keeping this task from ever running.
    pub failed_dependencies: Vec<Uuid>,
}

/// Final report for one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_tasks: usize,
    pub merged: Vec<MergedSummary>,
    pub failed: Vec<FailureSummary>,
    pub blocked: Vec<BlockedSummary>,
}

impl PipelineReport {
    /// Exit code for the run: 0 on full success, 1 when any task failed or
    /// was left blocked.
    pub fn exit_code(&self) -> i32 {
        if self.failed.is_empty() && self.blocked.is_empty() {
            0
        } else {
            1
        }
    }

    /// Human-readable summary for the CLI.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let elapsed = self.finished_at - self.started_at;
        out.push_str(&format!(
            "Pipeline finished: {} merged, {} failed, {} blocked ({} tasks, {}s)\n",
            self.merged.len(),
            self.failed.len(),
            self.blocked.len(),
            self.total_tasks,
            elapsed.num_seconds(),
        ));
        for m in &self.merged {
            out.push_str(&format!("  merged  {}\n", m.title));
        }
        for f in &self.failed {
            out.push_str(&format!("  failed  {} ({} phase): {}\n", f.title, f.phase, f.error));
        }
        for b in &self.blocked {
            out.push_str(&format!(
                "  blocked {} (waiting on {} failed dependencies)\n",
                b.title,
                b.failed_dependencies.len()
            ));
        }
        out
    }
}

#[derive(Debug, Default)]
struct ReporterState {
    merged: Vec<MergedSummary>,
    failed: Vec<FailureSummary>,
}

/// Tracks per-task completion as merge/failure events arrive and produces
/// the final report.
#[derive(Debug)]
pub struct CompletionReporter {
    started_at: DateTime<Utc>,
    total_tasks: usize,
    state: Mutex<ReporterState>,
}

impl CompletionReporter {
    pub fn new(total_tasks: usize) -> Self {
        Self {
            started_at: Utc::now(),
            total_tasks,
            state: Mutex::new(ReporterState::default()),
        }
    }

    pub fn record_merged(&self, task: &Task) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.merged.push(MergedSummary {
            task_id: task.id,
            title: task.title.clone(),
            merged_at: Utc::now(),
        });
    }

    pub fn record_failed(&self, task: &Task, phase: FailurePhase, error: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.failed.push(FailureSummary {
            task_id: task.id,
            title: task.title.clone(),
            phase,
            error: error.to_string(),
            failed_at: Utc::now(),
        });
    }

    /// Count of tasks that reached a terminal outcome.
    pub fn settled_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.merged.len() + state.failed.len()
    }

    /// Whether every task reached a terminal outcome (blocked tasks never
    /// do; see [`CompletionReporter::report`]).
    pub fn all_done(&self) -> bool {
        self.settled_count() >= self.total_tasks
    }

    /// Build the final report, deriving the blocked set from the graph:
    /// every non-terminal task at this point is stuck behind a failed
    /// dependency.
    pub fn report(&self, graph: &TaskGraph) -> PipelineReport {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let mut blocked = Vec::new();
        for (task, task_state) in graph.snapshot() {
            if task_state.is_terminal() {
                continue;
            }
            let failed_dependencies = graph
                .dependency_status(task.id)
                .map(|status| status.failed)
                .unwrap_or_default();
            blocked.push(BlockedSummary {
                task_id: task.id,
                title: task.title.clone(),
                failed_dependencies,
            });
        }
        blocked.sort_by_key(|b| b.task_id);

        PipelineReport {
            started_at: self.started_at,
            finished_at: Utc::now(),
            total_tasks: self.total_tasks,
            merged: state.merged.clone(),
            failed: state.failed.clone(),
            blocked,
        }
    }
}
