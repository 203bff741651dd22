//! Pipeline configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::ReviewVerdict;

/// Errors produced while validating a [`PipelineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("base repository path does not exist: {0}")]
    BaseRepoMissing(PathBuf),

    #[error("max_concurrent_engineers must be between 1 and 100, got {0}")]
    InvalidConcurrency(usize),

    #[error("max_turns must be between 1 and 50, got {0}")]
    InvalidMaxTurns(u32),
}

/// Configuration for a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Path to the base git repository.
    pub base_repo: PathBuf,
    /// Directory under which per-task worktrees are created.
    pub worktree_root: PathBuf,
    /// Branch that completed tasks are merged into.
    pub base_branch: String,
    /// Number of concurrent development (and review) workers.
    pub max_concurrent_engineers: usize,
    /// Turn budget handed to each executor invocation.
    pub max_turns: u32,
    /// Revision rounds allowed before a review failure is terminal.
    pub max_review_retries: u32,
    /// Engineer retries allowed before a development failure is terminal.
    pub dev_retry_limit: u32,
    /// Whether to `git pull origin <base>` before each merge. Only takes
    /// effect when an `origin` remote actually exists.
    pub use_remote: bool,
    /// Remove worktrees for merged tasks when the run finishes.
    pub cleanup_on_success: bool,
    /// Verdict assumed when the review transcript matches neither the
    /// explicit header nor any fallback keyword. The source system defaults
    /// this to APPROVED even though keywords have already been checked;
    /// that behavior is preserved here and exposed as a knob.
    pub default_verdict: ReviewVerdict,
    /// Soft ceiling on live event-bus listeners (warn and continue beyond).
    pub max_listeners: usize,
}

impl PipelineConfig {
    /// Build a config with defaults for everything except the repo path.
    ///
    /// The worktree root defaults to a sibling of the base repository named
    /// `<repo-name>-worktrees`.
    pub fn new(base_repo: impl Into<PathBuf>) -> Self {
        let base_repo = base_repo.into();
        let worktree_root = {
            let repo_name = base_repo
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("repo");
            let base_name = format!("{repo_name}-worktrees");
            base_repo
                .parent()
                .map(|p| p.join(&base_name))
                .unwrap_or_else(|| PathBuf::from(base_name))
        };

        Self {
            base_repo,
            worktree_root,
            base_branch: "main".to_string(),
            max_concurrent_engineers: 3,
            max_turns: 30,
            max_review_retries: 5,
            dev_retry_limit: 3,
            use_remote: false,
            cleanup_on_success: true,
            default_verdict: ReviewVerdict::Approved,
            max_listeners: 64,
        }
    }

    /// Validate ranges and the repository path.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.base_repo.exists() {
            return Err(ConfigError::BaseRepoMissing(self.base_repo.clone()));
        }
        if self.max_concurrent_engineers == 0 || self.max_concurrent_engineers > 100 {
            return Err(ConfigError::InvalidConcurrency(self.max_concurrent_engineers));
        }
        if self.max_turns == 0 || self.max_turns > 50 {
            return Err(ConfigError::InvalidMaxTurns(self.max_turns));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_worktree_root_is_sibling() {
        let cfg = PipelineConfig::new("/work/myrepo");
        assert_eq!(cfg.worktree_root, PathBuf::from("/work/myrepo-worktrees"));
        assert_eq!(cfg.base_branch, "main");
        assert_eq!(cfg.max_review_retries, 5);
        assert_eq!(cfg.dev_retry_limit, 3);
    }

    #[test]
    fn validate_rejects_missing_repo() {
        let cfg = PipelineConfig::new("/definitely/not/a/path");
        assert!(matches!(cfg.validate(), Err(ConfigError::BaseRepoMissing(_))));
    }

    #[test]
    fn validate_rejects_bad_ranges() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cfg = PipelineConfig::new(dir.path());
        cfg.max_concurrent_engineers = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidConcurrency(0))));

        cfg.max_concurrent_engineers = 101;
        assert!(cfg.validate().is_err());

        cfg.max_concurrent_engineers = 4;
        cfg.max_turns = 51;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidMaxTurns(51))));

        cfg.max_turns = 30;
        assert!(cfg.validate().is_ok());
    }
}
