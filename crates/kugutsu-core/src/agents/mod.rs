//! Agent roles and the engineer session cache.
//!
//! Roles (Engineer, TechLead, ProductOwner) differ only in prompt template
//! and tool allow-list, so they are configuration over a shared executor
//! rather than separate types. Engineer sessions are stateful: one executor
//! session per task survives development, review, and revision rounds, and
//! is resumed via [`SessionHandle`]. TechLead and ProductOwner runs are
//! stateless one-shots.

pub mod prompts;

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use crate::executor::SessionHandle;
use crate::task::Task;

/// The three agent roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Engineer,
    TechLead,
    ProductOwner,
}

/// Per-role executor configuration.
#[derive(Debug, Clone)]
pub struct RoleConfig {
    pub role: AgentRole,
    pub allowed_tools: Vec<String>,
    pub max_turns: u32,
}

impl RoleConfig {
    /// Engineers get the full editing toolset.
    pub fn engineer(max_turns: u32) -> Self {
        Self {
            role: AgentRole::Engineer,
            allowed_tools: ["Bash", "Read", "Edit", "Write", "Glob", "Grep"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_turns,
        }
    }

    /// TechLeads inspect but do not edit.
    pub fn tech_lead(max_turns: u32) -> Self {
        Self {
            role: AgentRole::TechLead,
            allowed_tools: ["Bash", "Read", "Glob", "Grep"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_turns,
        }
    }

    /// ProductOwners only read while decomposing the request.
    pub fn product_owner(max_turns: u32) -> Self {
        Self {
            role: AgentRole::ProductOwner,
            allowed_tools: ["Read", "Glob", "Grep"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_turns,
        }
    }
}

/// One cached engineer: a stable identifier plus the resumable session.
#[derive(Debug, Clone)]
pub struct EngineerSession {
    pub engineer_id: String,
    /// Session to resume; `None` until the first run reports one.
    pub resume: Option<SessionHandle>,
}

/// Engineer sessions keyed by task id, owned by the pipeline manager.
///
/// Kept outside the `Task` itself: embedding sessions in tasks would tie
/// task clones flowing through queues to live executor state. Entries are
/// removed deterministically on terminal merge success or terminal failure,
/// so the cache never exceeds the number of non-terminal tasks.
#[derive(Debug, Default)]
pub struct EngineerCache {
    inner: Mutex<HashMap<Uuid, EngineerSession>>,
}

impl EngineerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the engineer for a task, creating one on first use.
    ///
    /// Conflict-resolution tasks are keyed by their own id, so they always
    /// start a fresh session with no stale context from the original
    /// engineer.
    pub fn obtain(&self, task: &Task) -> EngineerSession {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(task.id)
            .or_insert_with(|| EngineerSession {
                engineer_id: format!("engineer-{}", task.id),
                resume: None,
            })
            .clone()
    }

    /// Record the resumable session reported by the latest run.
    pub fn store_session(&self, task_id: Uuid, handle: SessionHandle) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = map.get_mut(&task_id) {
            session.resume = Some(handle);
        }
    }

    /// Drop the engineer for a task (terminal merge or failure).
    pub fn remove(&self, task_id: Uuid) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(&task_id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
