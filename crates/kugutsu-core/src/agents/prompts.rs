//! Prompt templates for the three agent roles.
//!
//! The verdict header and the revision marker are load-bearing: the review
//! parser matches `レビュー結果:` exactly, and revision titles are prefixed
//! `[修正]` so transcripts and status files show which rounds were rework.

use crate::task::{EngineerResult, ReviewResult, Task};

/// Title prefix applied when a task is re-admitted for revision.
pub const REVISION_PREFIX: &str = "[修正]";

/// Header the TechLead is instructed to emit; the parser's first pass
/// matches it verbatim.
pub const VERDICT_HEADER: &str = "レビュー結果:";

/// Prompt for an engineer developing (or revising) a task.
pub fn development(task: &Task) -> String {
    format!(
        "あなたはこのリポジトリで作業するエンジニアです。\n\
         You are an engineer working in this repository worktree.\n\n\
         ## Task: {title}\n\
         Type: {task_type}\n\n\
         {description}\n\n\
         Implement the task completely. Commit nothing yourself; the\n\
         pipeline commits and merges your work. When you are done, state\n\
         what you changed.",
        title = task.title,
        task_type = task.task_type,
        description = task.description,
    )
}

/// Prompt for an engineer resolving a merge conflict. The aborted merge
/// left the worktree clean; the engineer re-runs it and resolves.
pub fn conflict_resolution(task: &Task) -> String {
    format!(
        "Merging the base branch into this worktree's branch produced\n\
         conflicts, and the merge was aborted. Re-run the merge, resolve\n\
         every conflict so the code implements both sides' intent, then\n\
         stage the resolution with `git add` and conclude the merge with\n\
         `git commit`.\n\n\
         ## Task: {title}\n\n\
         {description}\n\n\
         Do not discard either side's changes without a reason. After the\n\
         merge commit exists, state which files you resolved and how.",
        title = task.title,
        description = task.description,
    )
}

/// Prompt for a TechLead reviewing an engineer's work.
pub fn review(task: &Task, result: &EngineerResult) -> String {
    let changed = if result.changed_files.is_empty() {
        "(no files reported)".to_string()
    } else {
        result.changed_files.join("\n")
    };

    format!(
        "あなたはテックリードとしてコードレビューを行います。\n\
         You are the tech lead reviewing the work in this worktree.\n\n\
         ## Task: {title}\n\n\
         {description}\n\n\
         ## Changed files\n{changed}\n\n\
         Inspect the changes against the task. Then output your verdict on\n\
         its own line, exactly in this form:\n\n\
         {header} APPROVED\n\
         {header} CHANGES_REQUESTED\n\
         {header} COMMENTED\n\n\
         If you request changes, list each required change as a bullet\n\
         starting with `- `.",
        title = task.title,
        description = task.description,
        changed = changed,
        header = VERDICT_HEADER,
    )
}

/// Prompt for the ProductOwner decomposing a user request into tasks.
pub fn planning(user_request: &str) -> String {
    format!(
        "あなたはプロダクトオーナーとして開発依頼をタスクに分解します。\n\
         You are the product owner. Decompose the following development\n\
         request into independent tasks for parallel engineers.\n\n\
         ## Request\n{user_request}\n\n\
         Output a JSON array (inside a ```json code fence) where each\n\
         element has: \"title\", \"description\", \"type\" (feature|bugfix|\n\
         refactor|test|docs), \"priority\" (high|medium|low), and\n\
         \"depends_on\" (array of indices into this list). Keep tasks\n\
         small enough to review in one pass.",
    )
}

/// Description for a re-admitted revision round: the original description
/// with the reviewer's comments appended.
pub fn revision_description(original: &str, review: &ReviewResult) -> String {
    let comments = if review.comments.is_empty() {
        "- (no specific comments; address the requested changes)".to_string()
    } else {
        review
            .comments
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "{original}\n\n## レビュー指摘事項 (from {reviewer})\n{comments}",
        original = original,
        reviewer = review.reviewer_id,
        comments = comments,
    )
}

/// Title for a re-admitted revision round.
pub fn revision_title(original: &str) -> String {
    if original.starts_with(REVISION_PREFIX) {
        original.to_string()
    } else {
        format!("{REVISION_PREFIX} {original}")
    }
}
