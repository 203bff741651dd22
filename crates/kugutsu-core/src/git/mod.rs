//! Thin wrapper around the `git` command line.
//!
//! Both the worktree manager and the merge coordinator shell out to a
//! standard `git` binary (2.20+ semantics). This module owns subprocess
//! invocation, exit-status classification, and porcelain parsing helpers so
//! those components only deal in typed results.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

/// Errors from running git commands.
#[derive(Debug, Error)]
pub enum GitError {
    /// The target path is not inside a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// The git binary could not be executed at all.
    #[error("failed to run git {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Git exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },
}

impl GitError {
    /// Whether the failure looks transient (lock contention, network
    /// hiccup). Transient errors are retried once in place by callers.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Exit { stderr, .. } => {
                stderr.contains("index.lock")
                    || stderr.contains("Could not resolve host")
                    || stderr.contains("unable to access")
                    || stderr.contains("Connection timed out")
                    || stderr.contains("early EOF")
            }
            _ => false,
        }
    }
}

/// Outcome of merging one branch into the currently checked-out branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// The merge stopped on conflicts. Paths are the conflicted entries
    /// (`UU`/`AA`/`DD` lines of `git status --porcelain`).
    Conflicted { paths: Vec<String> },
}

/// Git operations rooted at one working directory (the base repository or
/// a task worktree).
#[derive(Debug, Clone)]
pub struct Git {
    dir: PathBuf,
}

impl Git {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run one git command, returning trimmed stdout.
    pub fn run(&self, args: &[&str]) -> Result<String, GitError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            .output()
            .map_err(|e| GitError::Spawn {
                command: args.join(" "),
                source: e,
            })?;

        if !output.status.success() {
            return Err(GitError::Exit {
                command: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Verify the directory is inside a git repository.
    pub fn verify_repo(&self) -> Result<(), GitError> {
        self.run(&["rev-parse", "--git-dir"])
            .map(|_| ())
            .map_err(|_| GitError::NotAGitRepo(self.dir.clone()))
    }

    pub fn checkout(&self, branch: &str) -> Result<(), GitError> {
        self.run(&["checkout", branch]).map(|_| ())
    }

    pub fn current_branch(&self) -> Result<String, GitError> {
        self.run(&["branch", "--show-current"])
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        self.run(&["rev-parse", "--verify", &format!("refs/heads/{branch}")])
            .is_ok()
    }

    /// Whether an `origin` remote is configured.
    pub fn has_origin_remote(&self) -> bool {
        self.run(&["remote"])
            .map(|out| out.lines().any(|l| l.trim() == "origin"))
            .unwrap_or(false)
    }

    pub fn pull_origin(&self, branch: &str) -> Result<(), GitError> {
        self.run(&["pull", "origin", branch]).map(|_| ())
    }

    /// Merge `branch` into the current branch. A non-zero exit is
    /// classified as a conflict only when the porcelain status shows
    /// unmerged entries; anything else is surfaced as an error.
    ///
    /// On conflict the merge is left in progress; callers decide whether
    /// to abort.
    pub fn merge(&self, branch: &str) -> Result<MergeOutcome, GitError> {
        match self.run(&["merge", branch]) {
            Ok(_) => Ok(MergeOutcome::Merged),
            Err(err) => {
                let conflicts = self.conflicted_paths()?;
                if conflicts.is_empty() {
                    Err(err)
                } else {
                    Ok(MergeOutcome::Conflicted { paths: conflicts })
                }
            }
        }
    }

    /// Merge `branch` into the current branch with `--no-ff`, always
    /// producing a merge commit.
    pub fn merge_no_ff(&self, branch: &str) -> Result<MergeOutcome, GitError> {
        match self.run(&["merge", "--no-ff", branch]) {
            Ok(_) => Ok(MergeOutcome::Merged),
            Err(err) => {
                let conflicts = self.conflicted_paths()?;
                if conflicts.is_empty() {
                    Err(err)
                } else {
                    Ok(MergeOutcome::Conflicted { paths: conflicts })
                }
            }
        }
    }

    /// Abort an in-progress merge. Best-effort: a failure (e.g. no merge
    /// in progress) is ignored.
    pub fn merge_abort(&self) {
        let _ = self.run(&["merge", "--abort"]);
    }

    pub fn status_porcelain(&self) -> Result<Vec<String>, GitError> {
        let out = self.run(&["status", "--porcelain"])?;
        Ok(out.lines().map(|l| l.to_string()).collect())
    }

    /// Paths with unmerged status (`UU`, `AA`, `DD`).
    pub fn conflicted_paths(&self) -> Result<Vec<String>, GitError> {
        let lines = self.status_porcelain()?;
        Ok(lines
            .iter()
            .filter(|l| l.starts_with("UU") || l.starts_with("AA") || l.starts_with("DD"))
            .map(|l| l[2..].trim().to_string())
            .collect())
    }

    /// Changed paths from the porcelain status (any entry).
    pub fn changed_files(&self) -> Result<Vec<String>, GitError> {
        let lines = self.status_porcelain()?;
        Ok(lines
            .iter()
            .filter(|l| l.len() > 3)
            .map(|l| l[3..].trim().to_string())
            .collect())
    }

    pub fn add_all(&self) -> Result<(), GitError> {
        self.run(&["add", "-A"]).map(|_| ())
    }

    /// Commit staged changes. Returns `false` when there was nothing to
    /// commit.
    pub fn commit(&self, message: &str) -> Result<bool, GitError> {
        if self.status_porcelain()?.is_empty() {
            return Ok(false);
        }
        self.run(&["commit", "-m", message]).map(|_| true)
    }

    /// Delete a local branch. Uses `-d`, so git refuses unless the branch
    /// is merged into the current branch. Idempotent: a missing branch is
    /// not an error.
    pub fn delete_branch(&self, branch: &str) -> Result<(), GitError> {
        match self.run(&["branch", "-d", branch]) {
            Ok(_) => Ok(()),
            Err(GitError::Exit { stderr, .. }) if stderr.contains("not found") => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn rev_parse_head(&self) -> Result<String, GitError> {
        self.run(&["rev-parse", "HEAD"])
    }
}

/// Retry a git operation once when the first failure is transient.
pub fn retry_transient<T>(
    mut op: impl FnMut() -> Result<T, GitError>,
) -> Result<T, GitError> {
    match op() {
        Ok(v) => Ok(v),
        Err(e) if e.is_transient() => {
            tracing::warn!(error = %e, "transient git failure, retrying once");
            op()
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn create_temp_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let repo_path = dir.path().to_path_buf();

        let run = |args: &[&str]| {
            let output = Command::new("git")
                .args(args)
                .current_dir(&repo_path)
                .output()
                .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
            assert!(
                output.status.success(),
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        };

        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "test@kugutsu.dev"]);
        run(&["config", "user.name", "Kugutsu Test"]);
        std::fs::write(repo_path.join("README.md"), "# Test repo\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "Initial commit"]);

        (dir, repo_path)
    }

    #[test]
    fn verify_repo_accepts_git_dir() {
        let (_dir, repo) = create_temp_repo();
        assert!(Git::new(&repo).verify_repo().is_ok());
    }

    #[test]
    fn verify_repo_rejects_plain_dir() {
        let dir = TempDir::new().unwrap();
        let err = Git::new(dir.path()).verify_repo().unwrap_err();
        assert!(matches!(err, GitError::NotAGitRepo(_)));
    }

    #[test]
    fn current_branch_and_branch_exists() {
        let (_dir, repo) = create_temp_repo();
        let git = Git::new(&repo);
        assert_eq!(git.current_branch().unwrap(), "main");
        assert!(git.branch_exists("main"));
        assert!(!git.branch_exists("feature/nope"));
    }

    #[test]
    fn no_origin_remote_in_fresh_repo() {
        let (_dir, repo) = create_temp_repo();
        assert!(!Git::new(&repo).has_origin_remote());
    }

    #[test]
    fn commit_reports_nothing_to_commit() {
        let (_dir, repo) = create_temp_repo();
        let git = Git::new(&repo);
        git.add_all().unwrap();
        assert!(!git.commit("empty").unwrap());

        std::fs::write(repo.join("new.txt"), "data\n").unwrap();
        git.add_all().unwrap();
        assert!(git.commit("add new.txt").unwrap());
        assert!(git.status_porcelain().unwrap().is_empty());
    }

    #[test]
    fn changed_files_lists_untracked() {
        let (_dir, repo) = create_temp_repo();
        let git = Git::new(&repo);
        std::fs::write(repo.join("a.txt"), "a\n").unwrap();
        std::fs::write(repo.join("b.txt"), "b\n").unwrap();

        let mut files = git.changed_files().unwrap();
        files.sort();
        assert_eq!(files, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn merge_detects_conflict_and_abort_recovers() {
        let (_dir, repo) = create_temp_repo();
        let git = Git::new(&repo);

        // Branch off and change the same line both sides.
        git.run(&["checkout", "-b", "side"]).unwrap();
        std::fs::write(repo.join("README.md"), "# side edit\n").unwrap();
        git.add_all().unwrap();
        git.commit("side edit").unwrap();

        git.checkout("main").unwrap();
        std::fs::write(repo.join("README.md"), "# main edit\n").unwrap();
        git.add_all().unwrap();
        git.commit("main edit").unwrap();

        let outcome = git.merge("side").unwrap();
        match outcome {
            MergeOutcome::Conflicted { paths } => {
                assert_eq!(paths, vec!["README.md"]);
            }
            MergeOutcome::Merged => panic!("expected a conflict"),
        }

        git.merge_abort();
        assert!(git.conflicted_paths().unwrap().is_empty());
    }

    #[test]
    fn merge_no_ff_creates_merge_commit() {
        let (_dir, repo) = create_temp_repo();
        let git = Git::new(&repo);

        git.run(&["checkout", "-b", "feature/x"]).unwrap();
        std::fs::write(repo.join("x.txt"), "x\n").unwrap();
        git.add_all().unwrap();
        git.commit("add x").unwrap();

        git.checkout("main").unwrap();
        let outcome = git.merge_no_ff("feature/x").unwrap();
        assert_eq!(outcome, MergeOutcome::Merged);

        // A --no-ff merge has two parents.
        let parents = git.run(&["rev-list", "--parents", "-n", "1", "HEAD"]).unwrap();
        assert_eq!(parents.split_whitespace().count(), 3);
    }

    #[test]
    fn delete_branch_is_idempotent() {
        let (_dir, repo) = create_temp_repo();
        let git = Git::new(&repo);
        git.run(&["branch", "gone"]).unwrap();
        git.delete_branch("gone").unwrap();
        git.delete_branch("gone").unwrap();
    }

    #[test]
    fn delete_branch_refuses_unmerged_work() {
        let (_dir, repo) = create_temp_repo();
        let git = Git::new(&repo);

        git.run(&["checkout", "-b", "unmerged"]).unwrap();
        std::fs::write(repo.join("wip.txt"), "wip\n").unwrap();
        git.add_all().unwrap();
        git.commit("wip commit").unwrap();
        git.checkout("main").unwrap();

        assert!(git.delete_branch("unmerged").is_err());
        assert!(git.branch_exists("unmerged"));
    }

    #[test]
    fn transient_classification() {
        let transient = GitError::Exit {
            command: "pull".into(),
            code: 1,
            stderr: "fatal: Unable to create '/repo/.git/index.lock': File exists".into(),
        };
        assert!(transient.is_transient());

        let hard = GitError::Exit {
            command: "merge".into(),
            code: 1,
            stderr: "fatal: refusing to merge unrelated histories".into(),
        };
        assert!(!hard.is_transient());
    }

    #[test]
    fn retry_transient_retries_once() {
        let mut calls = 0;
        let result: Result<u32, GitError> = retry_transient(|| {
            calls += 1;
            if calls == 1 {
                Err(GitError::Exit {
                    command: "pull".into(),
                    code: 1,
                    stderr: "index.lock".into(),
                })
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls, 2);
    }
}
