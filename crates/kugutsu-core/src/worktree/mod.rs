//! Per-task git worktree lifecycle.
//!
//! Every task develops in its own worktree, sharing the base repository's
//! object store but with an independent working directory and index. The
//! manager derives branch and path names deterministically from the task id
//! so acquisition is idempotent across retries and revision rounds.
//!
//! Git does not support concurrent worktree mutations on one repository (it
//! takes a lock file on the shared object store), so all mutating worktree
//! operations are serialized through an internal lock. Acquisitions for the
//! *same* task are additionally serialized per key; acquisitions for
//! different tasks only contend on the short git-level critical section.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::git::{Git, GitError};

/// Errors from worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// The base repository path is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    #[error(transparent)]
    Git(#[from] GitError),

    /// Failed to parse porcelain output from `git worktree list`.
    #[error("failed to parse worktree list output: {0}")]
    Parse(String),

    #[error("failed to create worktree root {path}: {source}")]
    RootCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Information about a single registered worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head_commit: String,
}

/// Manages per-task worktrees under a single root directory.
pub struct WorktreeManager {
    base_repo: PathBuf,
    worktree_root: PathBuf,
    base_branch: String,
    /// Serializes mutating git worktree operations (shared lock file).
    git_lock: Arc<Mutex<()>>,
    /// Per-task acquisition locks so concurrent `acquire` calls for the
    /// same id collapse onto one creation.
    in_flight: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for WorktreeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorktreeManager")
            .field("base_repo", &self.base_repo)
            .field("worktree_root", &self.worktree_root)
            .field("base_branch", &self.base_branch)
            .finish()
    }
}

impl WorktreeManager {
    /// Create a manager rooted at `base_repo`.
    ///
    /// # Errors
    ///
    /// Returns [`WorktreeError::NotAGitRepo`] if `base_repo` is not a git
    /// repository.
    pub fn new(
        base_repo: impl Into<PathBuf>,
        worktree_root: impl Into<PathBuf>,
        base_branch: impl Into<String>,
    ) -> Result<Self, WorktreeError> {
        let base_repo = base_repo.into();
        Git::new(&base_repo)
            .verify_repo()
            .map_err(|_| WorktreeError::NotAGitRepo(base_repo.clone()))?;

        Ok(Self {
            base_repo,
            worktree_root: worktree_root.into(),
            base_branch: base_branch.into(),
            git_lock: Arc::new(Mutex::new(())),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_repo(&self) -> &Path {
        &self.base_repo
    }

    pub fn worktree_root(&self) -> &Path {
        &self.worktree_root
    }

    /// Deterministic branch name for a task.
    pub fn branch_for(task_id: Uuid) -> String {
        format!("feature/task-{task_id}")
    }

    /// Deterministic worktree path for a task.
    pub fn path_for(&self, task_id: Uuid) -> PathBuf {
        self.worktree_root.join(format!("task-{task_id}"))
    }

    /// Acquire the worktree for a task, creating branch and directory on
    /// first use.
    ///
    /// Idempotent: if the worktree already exists it is returned verbatim.
    /// If only the branch exists (e.g. a previous run), it is checked out
    /// into a fresh worktree; otherwise a new branch is created off the
    /// configured base branch. Concurrent calls for the same id are
    /// serialized and all observe the same `(path, branch)` pair.
    ///
    /// Never mutates the task; callers record the returned pair.
    pub async fn acquire(&self, task_id: Uuid) -> Result<(PathBuf, String), WorktreeError> {
        let key_lock = {
            let mut map = self.in_flight.lock().await;
            Arc::clone(map.entry(task_id).or_default())
        };
        let _key_guard = key_lock.lock().await;

        let branch = Self::branch_for(task_id);
        let path = self.path_for(task_id);

        if self.registered(&path).await? {
            tracing::debug!(task_id = %task_id, path = %path.display(), "reusing existing worktree");
            return Ok((path, branch));
        }

        if !self.worktree_root.exists() {
            std::fs::create_dir_all(&self.worktree_root).map_err(|e| {
                WorktreeError::RootCreation {
                    path: self.worktree_root.clone(),
                    source: e,
                }
            })?;
        }

        let _git_guard = self.git_lock.lock().await;
        let git = Git::new(&self.base_repo);
        let base_branch = self.base_branch.clone();
        let branch_clone = branch.clone();
        let path_clone = path.clone();

        tokio::task::spawn_blocking(move || {
            create_worktree(&git, &path_clone, &branch_clone, &base_branch)
        })
        .await
        .expect("worktree creation task panicked")?;

        tracing::info!(task_id = %task_id, branch = %branch, path = %path.display(), "worktree created");
        Ok((path, branch))
    }

    /// Remove a task's worktree (force). Best-effort: failures are logged
    /// and swallowed because this runs on cleanup paths that must not
    /// cascade. A second call for the same id is a no-op.
    pub async fn release(&self, task_id: Uuid) {
        let path = self.path_for(task_id);
        let _git_guard = self.git_lock.lock().await;
        let git = Git::new(&self.base_repo);

        let result = tokio::task::spawn_blocking(move || {
            let path_str = path.to_string_lossy().into_owned();
            git.run(&["worktree", "remove", "--force", &path_str])
        })
        .await
        .expect("worktree removal task panicked");

        match result {
            Ok(_) => {
                tracing::info!(task_id = %task_id, "worktree removed");
            }
            Err(e) => {
                // Already-removed worktrees are routine here.
                tracing::debug!(task_id = %task_id, error = %e, "worktree removal skipped");
            }
        }
    }

    /// List all worktrees registered against the base repository.
    pub async fn list(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let git = Git::new(&self.base_repo);
        let out = tokio::task::spawn_blocking(move || git.run(&["worktree", "list", "--porcelain"]))
            .await
            .expect("worktree list task panicked")?;
        parse_porcelain(&out)
    }

    /// Whether a worktree is registered for the task.
    pub async fn exists(&self, task_id: Uuid) -> Result<bool, WorktreeError> {
        self.registered(&self.path_for(task_id)).await
    }

    /// Prune stale worktree metadata (directories removed externally).
    pub async fn prune(&self) -> Result<(), WorktreeError> {
        let _git_guard = self.git_lock.lock().await;
        let git = Git::new(&self.base_repo);
        tokio::task::spawn_blocking(move || git.run(&["worktree", "prune"]))
            .await
            .expect("worktree prune task panicked")?;
        Ok(())
    }

    async fn registered(&self, path: &Path) -> Result<bool, WorktreeError> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        Ok(self.list().await?.iter().any(|wt| {
            wt.path.canonicalize().unwrap_or_else(|_| wt.path.clone()) == canonical
        }))
    }
}

/// Create the worktree, handling the "branch already exists" case by
/// checking the existing branch out instead of creating a new one.
fn create_worktree(
    git: &Git,
    path: &Path,
    branch: &str,
    base_branch: &str,
) -> Result<(), WorktreeError> {
    let path_str = path.to_string_lossy().into_owned();

    let result = if git.branch_exists(branch) {
        git.run(&["worktree", "add", &path_str, branch])
    } else {
        match git.run(&["worktree", "add", "-b", branch, &path_str, base_branch]) {
            // Lost a race against an external branch creation; the branch
            // existing already is benign, check it out instead.
            Err(GitError::Exit { stderr, .. }) if stderr.contains("already exists") => {
                git.run(&["worktree", "add", &path_str, branch])
            }
            other => other,
        }
    };

    if let Err(e) = result {
        if path.exists() {
            tracing::warn!(path = %path.display(), "cleaning up partial worktree directory");
            let _ = std::fs::remove_dir_all(path);
            let _ = git.run(&["worktree", "prune"]);
        }
        return Err(e.into());
    }

    Ok(())
}

/// Parse `git worktree list --porcelain` output.
///
/// Blocks are separated by blank lines:
///
/// ```text
/// worktree <path>
/// HEAD <sha>
/// branch refs/heads/<name>
/// ```
///
/// The main worktree may show `bare`, detached worktrees show `detached`.
fn parse_porcelain(output: &str) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    let mut worktrees = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut head: Option<String> = None;
    let mut branch: Option<String> = None;

    let mut flush = |path: &mut Option<PathBuf>,
                     head: &mut Option<String>,
                     branch: &mut Option<String>,
                     out: &mut Vec<WorktreeInfo>| {
        if let (Some(p), Some(h)) = (path.take(), head.take()) {
            out.push(WorktreeInfo {
                path: p,
                branch: branch.take(),
                head_commit: h,
            });
        } else {
            *branch = None;
        }
    };

    for line in output.lines() {
        if line.is_empty() {
            flush(&mut path, &mut head, &mut branch, &mut worktrees);
            continue;
        }
        if let Some(rest) = line.strip_prefix("worktree ") {
            path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            head = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            branch = Some(rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string());
        }
        // `bare`, `detached`, `prunable` carry no extra data we need.
    }
    flush(&mut path, &mut head, &mut branch, &mut worktrees);

    Ok(worktrees)
}
