//! The `.kugutsu/` on-disk convention.
//!
//! Under the base repository, `.kugutsu/<project>/` holds task instruction
//! Markdown files, a completion-status checklist, and a pipeline snapshot
//! JSON overwritten on every state change. This is a convention for
//! external tools, not a protocol: the orchestrator writes it and never
//! reads it back, and a missing or partial directory is harmless.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::task::{Task, TaskState};

/// One task row in the snapshot JSON.
#[derive(Debug, Serialize)]
struct SnapshotTask {
    id: String,
    title: String,
    task_type: String,
    priority: String,
    state: String,
    branch: Option<String>,
    worktree: Option<String>,
}

/// The pipeline snapshot file.
#[derive(Debug, Serialize)]
struct Snapshot {
    updated_at: DateTime<Utc>,
    tasks: Vec<SnapshotTask>,
}

/// Writer for the `.kugutsu/` layout.
#[derive(Debug, Clone)]
pub struct StateFiles {
    project_dir: PathBuf,
}

impl StateFiles {
    /// `base_repo/.kugutsu/<project>/`
    pub fn new(base_repo: &Path, project: &str) -> Self {
        Self {
            project_dir: base_repo.join(".kugutsu").join(project),
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Create the project directory tree.
    pub fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(self.project_dir.join("tasks"))
    }

    /// Write one task's instruction file.
    pub fn write_task_instructions(&self, task: &Task) -> io::Result<()> {
        let path = self
            .project_dir
            .join("tasks")
            .join(format!("task-{}.md", task.id));
        let body = format!(
            "# {title}\n\n\
             - id: {id}\n\
             - type: {task_type}\n\
             - priority: {priority}\n\n\
             {description}\n",
            title = task.title,
            id = task.id,
            task_type = task.task_type,
            priority = task.priority,
            description = task.description,
        );
        fs::write(path, body)
    }

    /// Overwrite the completion-status checklist.
    pub fn write_completion_status(&self, snapshot: &[(Task, TaskState)]) -> io::Result<()> {
        let mut rows: Vec<&(Task, TaskState)> = snapshot.iter().collect();
        rows.sort_by(|a, b| a.0.title.cmp(&b.0.title));

        let mut body = String::from("# Completion status\n\n");
        for (task, state) in rows {
            let mark = if *state == TaskState::Merged { "x" } else { " " };
            body.push_str(&format!("- [{mark}] {} ({state})\n", task.title));
        }
        fs::write(self.project_dir.join("completion-status.md"), body)
    }

    /// Overwrite the pipeline snapshot JSON.
    pub fn write_snapshot(&self, snapshot: &[(Task, TaskState)]) -> io::Result<()> {
        let mut tasks: Vec<SnapshotTask> = snapshot
            .iter()
            .map(|(task, state)| SnapshotTask {
                id: task.id.to_string(),
                title: task.title.clone(),
                task_type: task.task_type.to_string(),
                priority: task.priority.to_string(),
                state: state.to_string(),
                branch: task.branch_name.clone(),
                worktree: task
                    .worktree_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
            })
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));

        let doc = Snapshot {
            updated_at: Utc::now(),
            tasks,
        };
        let json = serde_json::to_string_pretty(&doc).map_err(io::Error::other)?;
        fs::write(self.project_dir.join("pipeline-state.json"), json)
    }
}
