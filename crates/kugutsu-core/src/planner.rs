//! Planner boundary: turning a user request into the task list.
//!
//! Natural-language decomposition itself is outside the pipeline; the
//! orchestrator only consumes a `Vec<Task>`. [`ProductOwnerPlanner`] backs
//! the trait with a ProductOwner agent run and parses the JSON task list
//! out of its transcript.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agents::{RoleConfig, prompts};
use crate::executor::{AgentExecutor, ExecutionRequest};
use crate::task::{Task, TaskPriority, TaskType};

/// Produces the pipeline's input task list.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &str) -> Result<Vec<Task>>;
}

/// Planner backed by a ProductOwner agent session.
pub struct ProductOwnerPlanner {
    executor: std::sync::Arc<dyn AgentExecutor>,
    role: RoleConfig,
    base_repo: PathBuf,
    cancel: CancellationToken,
}

impl ProductOwnerPlanner {
    pub fn new(
        executor: std::sync::Arc<dyn AgentExecutor>,
        role: RoleConfig,
        base_repo: impl Into<PathBuf>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            executor,
            role,
            base_repo: base_repo.into(),
            cancel,
        }
    }
}

#[async_trait]
impl Planner for ProductOwnerPlanner {
    async fn plan(&self, request: &str) -> Result<Vec<Task>> {
        let execution = ExecutionRequest {
            prompt: prompts::planning(request),
            working_dir: self.base_repo.clone(),
            max_turns: self.role.max_turns,
            allowed_tools: self.role.allowed_tools.clone(),
            resume: None,
            cancel: self.cancel.child_token(),
        };

        let outcome = self
            .executor
            .execute(execution)
            .await
            .context("product owner execution failed")?;

        if !outcome.success {
            bail!(
                "product owner failed to plan: {}",
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }

        let tasks = parse_task_list(&outcome.assistant_text())
            .context("product owner produced an unparseable task list")?;
        tracing::info!(tasks = tasks.len(), "planning complete");
        Ok(tasks)
    }
}

/// Task element as emitted by the ProductOwner.
#[derive(Debug, Deserialize)]
struct PlannedTask {
    title: String,
    description: String,
    #[serde(rename = "type", default)]
    task_type: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    depends_on: Vec<usize>,
}

/// Parse the JSON task array out of a planning transcript.
///
/// Accepts either a ```json fenced block or a bare JSON array. Dependency
/// references are indices into the array and are resolved to task ids.
pub fn parse_task_list(text: &str) -> Result<Vec<Task>> {
    let json = extract_json_array(text).context("no JSON task array found in transcript")?;
    let planned: Vec<PlannedTask> =
        serde_json::from_str(json).context("task array is not valid JSON")?;

    if planned.is_empty() {
        bail!("planner returned an empty task list");
    }

    // Assign ids first so indices can resolve to them.
    let ids: Vec<Uuid> = planned.iter().map(|_| Uuid::new_v4()).collect();

    let mut tasks = Vec::with_capacity(planned.len());
    for (index, spec) in planned.into_iter().enumerate() {
        let task_type = match &spec.task_type {
            Some(raw) => TaskType::from_str(raw)
                .with_context(|| format!("task {index}: invalid type {raw:?}"))?,
            None => TaskType::Feature,
        };
        let priority = match &spec.priority {
            Some(raw) => TaskPriority::from_str(raw)
                .with_context(|| format!("task {index}: invalid priority {raw:?}"))?,
            None => TaskPriority::Medium,
        };

        let mut seen = HashSet::new();
        let mut dependencies = Vec::new();
        for dep in &spec.depends_on {
            if *dep >= ids.len() {
                bail!("task {index}: dependency index {dep} out of range");
            }
            if *dep == index {
                bail!("task {index}: depends on itself");
            }
            if seen.insert(*dep) {
                dependencies.push(ids[*dep]);
            }
        }

        let mut task = Task::new(task_type, spec.title, spec.description)
            .with_priority(priority)
            .with_dependencies(dependencies);
        task.id = ids[index];
        tasks.push(task);
    }

    Ok(tasks)
}

/// Find the JSON array in the transcript: fenced block first, then the
/// outermost bracket pair.
fn extract_json_array(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + "```json".len()..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim());
        }
    }
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"Here is the breakdown:

```json
[
  {"title": "Add model", "description": "Define the data model.", "type": "feature", "priority": "high", "depends_on": []},
  {"title": "Add API", "description": "Expose the model.", "type": "feature", "priority": "medium", "depends_on": [0]},
  {"title": "Write docs", "description": "Document it.", "type": "docs", "priority": "low", "depends_on": [0, 1]}
]
```

Three tasks total."#;

    #[test]
    fn parses_fenced_task_list_with_dependencies() {
        let tasks = parse_task_list(PLAN).unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].task_type, TaskType::Feature);
        assert_eq!(tasks[0].priority, TaskPriority::High);
        assert!(tasks[0].dependencies.is_empty());

        assert_eq!(tasks[1].dependencies, vec![tasks[0].id]);
        assert_eq!(tasks[2].dependencies, vec![tasks[0].id, tasks[1].id]);
        assert_eq!(tasks[2].task_type, TaskType::Docs);
    }

    #[test]
    fn parses_bare_array_without_fence() {
        let text = r#"[{"title": "t", "description": "d"}]"#;
        let tasks = parse_task_list(text).unwrap();
        assert_eq!(tasks.len(), 1);
        // Defaults apply when type/priority are omitted.
        assert_eq!(tasks[0].task_type, TaskType::Feature);
        assert_eq!(tasks[0].priority, TaskPriority::Medium);
    }

    #[test]
    fn rejects_out_of_range_dependency() {
        let text = r#"[{"title": "t", "description": "d", "depends_on": [5]}]"#;
        assert!(parse_task_list(text).is_err());
    }

    #[test]
    fn rejects_self_dependency() {
        let text = r#"[{"title": "t", "description": "d", "depends_on": [0]}]"#;
        assert!(parse_task_list(text).is_err());
    }

    #[test]
    fn rejects_empty_list() {
        assert!(parse_task_list("[]").is_err());
    }

    #[test]
    fn rejects_invalid_type() {
        let text = r#"[{"title": "t", "description": "d", "type": "chore"}]"#;
        assert!(parse_task_list(text).is_err());
    }

    #[test]
    fn rejects_transcript_without_array() {
        assert!(parse_task_list("no tasks here").is_err());
    }
}
