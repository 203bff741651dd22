//! Task DAG and lifecycle state tracking.
//!
//! The graph owns every task for the duration of a run, holds forward
//! (dependency) and inverse (dependent) edges, and answers the scheduling
//! question "which tasks became ready" when a merge lands. Conflict-
//! resolution tasks are not nodes: they alias their original task via
//! [`crate::task::Task::graph_id`], so callers always pass original ids.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use uuid::Uuid;

use crate::task::{Task, TaskState};

/// Errors from building the task graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("duplicate task id: {0}")]
    DuplicateTask(Uuid),

    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: Uuid, dependency: Uuid },

    #[error("dependency cycles detected: {}", format_cycles(.0))]
    CyclesDetected(Vec<Vec<Uuid>>),
}

fn format_cycles(cycles: &[Vec<Uuid>]) -> String {
    cycles
        .iter()
        .map(|cycle| {
            let mut parts: Vec<String> = cycle.iter().map(Uuid::to_string).collect();
            if let Some(first) = parts.first().cloned() {
                parts.push(first);
            }
            parts.join(" -> ")
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Diagnostic breakdown of a task's dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyStatus {
    /// Dependencies not yet started (waiting or ready).
    pub blocking: Vec<Uuid>,
    /// Dependencies somewhere between development and merge.
    pub in_progress: Vec<Uuid>,
    /// Dependencies that terminally failed.
    pub failed: Vec<Uuid>,
}

impl DependencyStatus {
    /// Whether every dependency has merged.
    pub fn is_clear(&self) -> bool {
        self.blocking.is_empty() && self.in_progress.is_empty() && self.failed.is_empty()
    }
}

struct Node {
    task: Task,
    state: TaskState,
    dependencies: HashSet<Uuid>,
    dependents: HashSet<Uuid>,
}

/// The task DAG with per-task lifecycle state.
pub struct TaskGraph {
    nodes: HashMap<Uuid, Node>,
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut counts: HashMap<TaskState, usize> = HashMap::new();
        for node in self.nodes.values() {
            *counts.entry(node.state).or_default() += 1;
        }
        f.debug_struct("TaskGraph")
            .field("tasks", &self.nodes.len())
            .field("states", &counts)
            .finish()
    }
}

impl TaskGraph {
    /// Build the graph from the planner's task list.
    ///
    /// Rejects duplicate ids, references to unknown tasks, and any
    /// dependency cycle (the error names every minimal cycle path).
    /// Zero-dependency tasks start `ready`, all others `waiting`.
    pub fn load(tasks: Vec<Task>) -> Result<Self, GraphError> {
        let mut nodes: HashMap<Uuid, Node> = HashMap::new();

        for task in tasks {
            let id = task.id;
            let dependencies: HashSet<Uuid> = task.dependencies.iter().copied().collect();
            let state = if dependencies.is_empty() {
                TaskState::Ready
            } else {
                TaskState::Waiting
            };
            let node = Node {
                task,
                state,
                dependencies,
                dependents: HashSet::new(),
            };
            if nodes.insert(id, node).is_some() {
                return Err(GraphError::DuplicateTask(id));
            }
        }

        // Validate references and build inverse edges.
        let ids: Vec<Uuid> = nodes.keys().copied().collect();
        for id in &ids {
            let deps: Vec<Uuid> = nodes[id].dependencies.iter().copied().collect();
            for dep in deps {
                if !nodes.contains_key(&dep) {
                    return Err(GraphError::UnknownDependency {
                        task: *id,
                        dependency: dep,
                    });
                }
                nodes.get_mut(&dep).unwrap().dependents.insert(*id);
            }
        }

        let graph = Self { nodes };
        let cycles = graph.detect_cycles();
        if !cycles.is_empty() {
            return Err(GraphError::CyclesDetected(cycles));
        }

        Ok(graph)
    }

    /// Every minimal cycle path in the dependency graph, found with a
    /// recursion-stack DFS. Empty for a valid DAG.
    pub fn detect_cycles(&self) -> Vec<Vec<Uuid>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        fn visit(
            graph: &TaskGraph,
            id: Uuid,
            colors: &mut HashMap<Uuid, Color>,
            stack: &mut Vec<Uuid>,
            cycles: &mut Vec<Vec<Uuid>>,
        ) {
            colors.insert(id, Color::Gray);
            stack.push(id);

            let mut deps: Vec<Uuid> = graph.nodes[&id].dependencies.iter().copied().collect();
            deps.sort();
            for dep in deps {
                match colors.get(&dep).copied().unwrap_or(Color::White) {
                    Color::White => visit(graph, dep, colors, stack, cycles),
                    Color::Gray => {
                        // Back edge: the cycle is the stack slice from the
                        // first occurrence of `dep`.
                        let start = stack.iter().position(|&s| s == dep).unwrap();
                        cycles.push(stack[start..].to_vec());
                    }
                    Color::Black => {}
                }
            }

            stack.pop();
            colors.insert(id, Color::Black);
        }

        let mut colors = HashMap::new();
        let mut stack = Vec::new();
        let mut cycles = Vec::new();

        let mut ids: Vec<Uuid> = self.nodes.keys().copied().collect();
        ids.sort();
        for id in ids {
            if colors.get(&id).copied().map(|c| c == Color::White).unwrap_or(true) {
                visit(self, id, &mut colors, &mut stack, &mut cycles);
            }
        }

        cycles
    }

    /// Tasks currently in `ready`, available for admission.
    pub fn ready_tasks(&self) -> Vec<Task> {
        self.nodes
            .values()
            .filter(|n| n.state == TaskState::Ready)
            .map(|n| n.task.clone())
            .collect()
    }

    pub fn state(&self, id: Uuid) -> Option<TaskState> {
        self.nodes.get(&id).map(|n| n.state)
    }

    pub fn task(&self, id: Uuid) -> Option<&Task> {
        self.nodes.get(&id).map(|n| &n.task)
    }

    /// Mutable access to a task for field updates the pipeline owns
    /// (description revisions, workspace assignment).
    pub fn task_mut(&mut self, id: Uuid) -> Option<&mut Task> {
        self.nodes.get_mut(&id).map(|n| &mut n.task)
    }

    /// Record the worktree pair for a task. The pair is set exactly once;
    /// re-assignment with the same values is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if the task already carries a different branch or path;
    /// that is a scheduling bug, not a runtime condition.
    pub fn assign_workspace(&mut self, id: Uuid, branch: String, path: std::path::PathBuf) {
        let node = self.expect_node_mut(id);
        match (&node.task.branch_name, &node.task.worktree_path) {
            (None, None) => {
                node.task.branch_name = Some(branch);
                node.task.worktree_path = Some(path);
            }
            (Some(b), Some(p)) => {
                assert!(
                    *b == branch && *p == path,
                    "workspace for task {id} reassigned: {b} -> {branch}"
                );
            }
            _ => panic!("task {id} has partially assigned workspace"),
        }
    }

    /// `ready -> running` on first admission, `reviewing -> running` when a
    /// revision is re-admitted, `merging -> running` when a merge conflict
    /// sends the task back to development.
    pub fn mark_running(&mut self, id: Uuid) {
        self.transition(
            id,
            &[TaskState::Ready, TaskState::Reviewing, TaskState::Merging],
            TaskState::Running,
        );
    }

    /// `running -> developed`.
    pub fn mark_developed(&mut self, id: Uuid) {
        self.transition(id, &[TaskState::Running], TaskState::Developed);
    }

    /// `developed -> reviewing`.
    pub fn mark_reviewing(&mut self, id: Uuid) {
        self.transition(id, &[TaskState::Developed], TaskState::Reviewing);
    }

    /// `reviewing -> merging`.
    pub fn mark_merging(&mut self, id: Uuid) {
        self.transition(id, &[TaskState::Reviewing], TaskState::Merging);
    }

    /// `merging -> merged`; promotes every dependent whose dependencies are
    /// now all merged from `waiting` to `ready` and returns the promoted
    /// tasks.
    pub fn mark_merged(&mut self, id: Uuid) -> Vec<Task> {
        self.transition(id, &[TaskState::Merging], TaskState::Merged);

        let dependents: Vec<Uuid> = self.nodes[&id].dependents.iter().copied().collect();
        let mut promoted = Vec::new();

        for dependent in dependents {
            if self.nodes[&dependent].state != TaskState::Waiting {
                continue;
            }
            let all_merged = self.nodes[&dependent]
                .dependencies
                .iter()
                .all(|dep| self.nodes[dep].state == TaskState::Merged);
            if all_merged {
                self.nodes.get_mut(&dependent).unwrap().state = TaskState::Ready;
                promoted.push(self.nodes[&dependent].task.clone());
            }
        }

        promoted
    }

    /// Move a task to `failed` and return the transitive set of dependents
    /// that can no longer run. Dependents are *not* failed here; policy
    /// belongs to the caller.
    pub fn mark_failed(&mut self, id: Uuid) -> Vec<Uuid> {
        let node = self.expect_node_mut(id);
        assert!(
            !node.state.is_terminal(),
            "illegal transition for task {id}: {} -> failed",
            node.state
        );
        node.state = TaskState::Failed;

        // BFS over inverse edges.
        let mut affected = Vec::new();
        let mut seen = HashSet::new();
        let mut frontier = vec![id];
        while let Some(current) = frontier.pop() {
            for dependent in &self.nodes[&current].dependents {
                if seen.insert(*dependent) {
                    affected.push(*dependent);
                    frontier.push(*dependent);
                }
            }
        }

        affected
    }

    /// Diagnostic dependency breakdown for a task.
    pub fn dependency_status(&self, id: Uuid) -> Option<DependencyStatus> {
        let node = self.nodes.get(&id)?;
        let mut status = DependencyStatus::default();
        let mut deps: Vec<Uuid> = node.dependencies.iter().copied().collect();
        deps.sort();
        for dep in deps {
            match self.nodes[&dep].state {
                TaskState::Waiting | TaskState::Ready => status.blocking.push(dep),
                TaskState::Running
                | TaskState::Developed
                | TaskState::Reviewing
                | TaskState::Merging => status.in_progress.push(dep),
                TaskState::Failed => status.failed.push(dep),
                TaskState::Merged => {}
            }
        }
        Some(status)
    }

    /// Whether a task can never run: it is `waiting` and some dependency
    /// (transitively) failed. Such tasks stay `waiting` forever and are
    /// reported as blocked rather than failed.
    pub fn is_unreachable(&self, id: Uuid) -> bool {
        let Some(node) = self.nodes.get(&id) else {
            return false;
        };
        if node.state != TaskState::Waiting {
            return false;
        }
        node.dependencies.iter().any(|dep| {
            self.nodes[dep].state == TaskState::Failed || self.is_unreachable(*dep)
        })
    }

    /// Whether every task has reached a terminal state.
    pub fn all_terminal(&self) -> bool {
        self.nodes.values().all(|n| n.state.is_terminal())
    }

    /// Ids of tasks not yet in a terminal state.
    pub fn non_terminal(&self) -> Vec<Uuid> {
        self.nodes
            .values()
            .filter(|n| !n.state.is_terminal())
            .map(|n| n.task.id)
            .collect()
    }

    /// All tasks with their current states, for reporting and snapshots.
    pub fn snapshot(&self) -> Vec<(Task, TaskState)> {
        self.nodes
            .values()
            .map(|n| (n.task.clone(), n.state))
            .collect()
    }

    fn transition(&mut self, id: Uuid, from: &[TaskState], to: TaskState) {
        let node = self.expect_node_mut(id);
        assert!(
            from.contains(&node.state),
            "illegal transition for task {id}: {} -> {to}",
            node.state
        );
        node.state = to;
    }

    fn expect_node_mut(&mut self, id: Uuid) -> &mut Node {
        self.nodes
            .get_mut(&id)
            .unwrap_or_else(|| panic!("unknown task id {id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskType;

    fn task(title: &str) -> Task {
        Task::new(TaskType::Feature, title, "description")
    }

    fn task_with_deps(title: &str, deps: Vec<Uuid>) -> Task {
        task(title).with_dependencies(deps)
    }

    #[test]
    fn load_marks_initial_states() {
        let a = task("a");
        let b = task_with_deps("b", vec![a.id]);
        let (a_id, b_id) = (a.id, b.id);

        let graph = TaskGraph::load(vec![a, b]).expect("should load");
        assert_eq!(graph.state(a_id), Some(TaskState::Ready));
        assert_eq!(graph.state(b_id), Some(TaskState::Waiting));

        let ready = graph.ready_tasks();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, a_id);
    }

    #[test]
    fn load_rejects_duplicate_ids() {
        let a = task("a");
        let mut b = task("b");
        b.id = a.id;
        assert!(matches!(
            TaskGraph::load(vec![a, b]),
            Err(GraphError::DuplicateTask(_))
        ));
    }

    #[test]
    fn load_rejects_unknown_dependency() {
        let ghost = Uuid::new_v4();
        let a = task_with_deps("a", vec![ghost]);
        assert!(matches!(
            TaskGraph::load(vec![a]),
            Err(GraphError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn load_rejects_direct_cycle_naming_it() {
        let mut a = task("a");
        let mut b = task("b");
        a.dependencies = vec![b.id];
        b.dependencies = vec![a.id];
        let (a_id, b_id) = (a.id, b.id);

        match TaskGraph::load(vec![a, b]) {
            Err(GraphError::CyclesDetected(cycles)) => {
                assert_eq!(cycles.len(), 1);
                let cycle: HashSet<Uuid> = cycles[0].iter().copied().collect();
                assert_eq!(cycle, HashSet::from([a_id, b_id]));
            }
            other => panic!("expected CyclesDetected, got {other:?}"),
        }
    }

    #[test]
    fn load_reports_multiple_cycles() {
        // Two disjoint 2-cycles.
        let mut a = task("a");
        let mut b = task("b");
        a.dependencies = vec![b.id];
        b.dependencies = vec![a.id];

        let mut c = task("c");
        let mut d = task("d");
        c.dependencies = vec![d.id];
        d.dependencies = vec![c.id];

        match TaskGraph::load(vec![a, b, c, d]) {
            Err(GraphError::CyclesDetected(cycles)) => assert_eq!(cycles.len(), 2),
            other => panic!("expected CyclesDetected, got {other:?}"),
        }
    }

    #[test]
    fn diamond_dag_is_accepted() {
        let a = task("a");
        let b = task_with_deps("b", vec![a.id]);
        let c = task_with_deps("c", vec![a.id]);
        let d = task_with_deps("d", vec![b.id, c.id]);
        assert!(TaskGraph::load(vec![a, b, c, d]).is_ok());
    }

    #[test]
    fn merge_promotes_ready_dependents() {
        let a = task("a");
        let b = task_with_deps("b", vec![a.id]);
        let (a_id, b_id) = (a.id, b.id);

        let mut graph = TaskGraph::load(vec![a, b]).unwrap();
        graph.mark_running(a_id);
        graph.mark_developed(a_id);
        graph.mark_reviewing(a_id);
        graph.mark_merging(a_id);

        let promoted = graph.mark_merged(a_id);
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, b_id);
        assert_eq!(graph.state(b_id), Some(TaskState::Ready));
    }

    #[test]
    fn merge_does_not_promote_with_outstanding_deps() {
        let a = task("a");
        let b = task("b");
        let c = task_with_deps("c", vec![a.id, b.id]);
        let (a_id, c_id) = (a.id, c.id);

        let mut graph = TaskGraph::load(vec![a, b, c]).unwrap();
        graph.mark_running(a_id);
        graph.mark_developed(a_id);
        graph.mark_reviewing(a_id);
        graph.mark_merging(a_id);

        let promoted = graph.mark_merged(a_id);
        assert!(promoted.is_empty());
        assert_eq!(graph.state(c_id), Some(TaskState::Waiting));
    }

    #[test]
    fn mark_failed_returns_transitive_dependents() {
        let a = task("a");
        let b = task_with_deps("b", vec![a.id]);
        let c = task_with_deps("c", vec![b.id]);
        let d = task("d");
        let (a_id, b_id, c_id, d_id) = (a.id, b.id, c.id, d.id);

        let mut graph = TaskGraph::load(vec![a, b, c, d]).unwrap();
        graph.mark_running(a_id);

        let affected: HashSet<Uuid> = graph.mark_failed(a_id).into_iter().collect();
        assert_eq!(affected, HashSet::from([b_id, c_id]));

        // Dependents stay waiting; policy is the caller's.
        assert_eq!(graph.state(b_id), Some(TaskState::Waiting));
        assert_eq!(graph.state(c_id), Some(TaskState::Waiting));
        assert_eq!(graph.state(d_id), Some(TaskState::Ready));
    }

    #[test]
    #[should_panic(expected = "illegal transition")]
    fn illegal_transition_panics() {
        let a = task("a");
        let a_id = a.id;
        let mut graph = TaskGraph::load(vec![a]).unwrap();
        // ready -> developed skips running.
        graph.mark_developed(a_id);
    }

    #[test]
    fn revision_reenters_running_from_reviewing() {
        let a = task("a");
        let a_id = a.id;
        let mut graph = TaskGraph::load(vec![a]).unwrap();

        graph.mark_running(a_id);
        graph.mark_developed(a_id);
        graph.mark_reviewing(a_id);
        // Changes requested: back to development.
        graph.mark_running(a_id);
        assert_eq!(graph.state(a_id), Some(TaskState::Running));
    }

    #[test]
    fn conflict_reenters_running_from_merging() {
        let a = task("a");
        let a_id = a.id;
        let mut graph = TaskGraph::load(vec![a]).unwrap();

        graph.mark_running(a_id);
        graph.mark_developed(a_id);
        graph.mark_reviewing(a_id);
        graph.mark_merging(a_id);
        // Merge conflict: back to development (as the resolution task).
        graph.mark_running(a_id);
        assert_eq!(graph.state(a_id), Some(TaskState::Running));
    }

    #[test]
    fn dependency_status_buckets() {
        let a = task("a");
        let b = task("b");
        let c = task("c");
        let d = task_with_deps("d", vec![a.id, b.id, c.id]);
        let (a_id, b_id, c_id, d_id) = (a.id, b.id, c.id, d.id);

        let mut graph = TaskGraph::load(vec![a, b, c, d]).unwrap();
        graph.mark_running(a_id);
        graph.mark_running(b_id);
        graph.mark_failed(b_id);

        let status = graph.dependency_status(d_id).unwrap();
        assert_eq!(status.blocking, vec![c_id]);
        assert_eq!(status.in_progress, vec![a_id]);
        assert_eq!(status.failed, vec![b_id]);
        assert!(!status.is_clear());
    }

    #[test]
    fn workspace_assignment_is_write_once() {
        let a = task("a");
        let a_id = a.id;
        let mut graph = TaskGraph::load(vec![a]).unwrap();

        graph.assign_workspace(a_id, "feature/task-x".into(), "/wt/task-x".into());
        // Same values again: no-op.
        graph.assign_workspace(a_id, "feature/task-x".into(), "/wt/task-x".into());
        assert_eq!(
            graph.task(a_id).unwrap().branch_name.as_deref(),
            Some("feature/task-x")
        );
    }

    #[test]
    #[should_panic(expected = "reassigned")]
    fn workspace_reassignment_panics() {
        let a = task("a");
        let a_id = a.id;
        let mut graph = TaskGraph::load(vec![a]).unwrap();
        graph.assign_workspace(a_id, "feature/task-x".into(), "/wt/task-x".into());
        graph.assign_workspace(a_id, "feature/task-y".into(), "/wt/task-y".into());
    }

    #[test]
    fn unreachable_propagates_through_waiting_chains() {
        let a = task("a");
        let b = task_with_deps("b", vec![a.id]);
        let c = task_with_deps("c", vec![b.id]);
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);

        let mut graph = TaskGraph::load(vec![a, b, c]).unwrap();
        assert!(!graph.is_unreachable(b_id));

        graph.mark_running(a_id);
        graph.mark_failed(a_id);

        assert!(graph.is_unreachable(b_id));
        assert!(graph.is_unreachable(c_id), "blockage is transitive");
        assert!(!graph.is_unreachable(a_id), "failed tasks are terminal, not blocked");
    }

    #[test]
    fn all_terminal_tracks_completion() {
        let a = task("a");
        let a_id = a.id;
        let mut graph = TaskGraph::load(vec![a]).unwrap();
        assert!(!graph.all_terminal());

        graph.mark_running(a_id);
        graph.mark_developed(a_id);
        graph.mark_reviewing(a_id);
        graph.mark_merging(a_id);
        graph.mark_merged(a_id);
        assert!(graph.all_terminal());
        assert!(graph.non_terminal().is_empty());
    }
}
