//! Shared test utilities for kugutsu integration tests.
//!
//! Provides temporary git repository fixtures and a scripted agent
//! executor so pipeline scenarios run hermetically: real git, fake LLM.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use kugutsu_core::executor::{AgentExecutor, ExecutionOutcome, ExecutionRequest, Message};
use kugutsu_core::logging::{LogRecord, LogSink};

// ---------------------------------------------------------------------------
// Git fixtures
// ---------------------------------------------------------------------------

/// A temporary git repository with an initial commit on `main`.
pub struct TempRepo {
    /// Held to keep the directory alive.
    _dir: TempDir,
    path: PathBuf,
}

impl TempRepo {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().to_path_buf();

        git(&path, &["init", "-b", "main"]);
        git(&path, &["config", "user.email", "test@kugutsu.dev"]);
        git(&path, &["config", "user.name", "Kugutsu Test"]);
        std::fs::write(path.join("README.md"), "# Test repo\n").expect("failed to write README");
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "Initial commit"]);

        Self { _dir: dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of merge commits landed on `main` itself (first-parent
    /// history, so feature-side merges do not count).
    pub fn merge_commit_count(&self) -> usize {
        let out = git_output(
            &self.path,
            &["rev-list", "--merges", "--first-parent", "--count", "main"],
        );
        out.trim().parse().expect("rev-list count should be numeric")
    }

    /// Subject lines of all commits on `main`, newest first.
    pub fn log_subjects(&self) -> Vec<String> {
        git_output(&self.path, &["log", "--format=%s", "main"])
            .lines()
            .map(|l| l.to_string())
            .collect()
    }

    /// Whether a merge is currently in progress (dangling MERGE_HEAD).
    pub fn has_merge_head(&self) -> bool {
        self.path.join(".git/MERGE_HEAD").exists()
    }
}

impl Default for TempRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a git command in `dir`, asserting success.
pub fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {}: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Run a git command in `dir`, asserting success and returning stdout.
pub fn git_output(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {}: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

// ---------------------------------------------------------------------------
// Log sink
// ---------------------------------------------------------------------------

/// Log sink that keeps every record for assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<LogRecord>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Executor kinds seen so far (e.g. "engineer", "techlead").
    pub fn kinds(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .map(|r| r.executor.kind)
            .collect()
    }
}

impl LogSink for RecordingSink {
    fn log(&self, record: LogRecord) {
        self.records.lock().unwrap().push(record);
    }
}

// ---------------------------------------------------------------------------
// Scripted executor
// ---------------------------------------------------------------------------

/// One recorded executor invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub prompt: String,
    pub working_dir: PathBuf,
    pub resume: Option<String>,
    /// Whether this was a review (TechLead) invocation.
    pub is_review: bool,
}

/// Whether a request is a TechLead review: review prompts instruct the
/// verdict header, engineer prompts do not.
pub fn is_review_request(request: &ExecutionRequest) -> bool {
    request.prompt.contains("レビュー結果:")
}

/// Extract the task title from an engineer or review prompt.
pub fn extract_task_title(prompt: &str) -> Option<String> {
    prompt.lines().find_map(|line| {
        line.strip_prefix("## Task: ")
            .or_else(|| line.strip_prefix("## Original task: "))
            .map(|t| t.trim().to_string())
    })
}

type Handler = Box<dyn Fn(&ExecutionRequest) -> ExecutionOutcome + Send + Sync>;

/// Agent executor driven by a test-provided handler. Records every
/// invocation for assertions.
pub struct MockExecutor {
    handler: Handler,
    invocations: Mutex<Vec<Invocation>>,
}

impl MockExecutor {
    pub fn new(
        handler: impl Fn(&ExecutionRequest) -> ExecutionOutcome + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Executor for clean-path scenarios: engineers write one file named
    /// after the task title and succeed; reviews approve.
    pub fn approving() -> Self {
        Self::new(|request| {
            if is_review_request(request) {
                return outcome_text("レビュー結果: APPROVED\n問題ありません。");
            }
            write_task_file(request);
            outcome_text("implemented")
        })
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn engineer_invocations(&self) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|i| !i.is_review)
            .collect()
    }

    pub fn review_invocations(&self) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|i| i.is_review)
            .collect()
    }
}

#[async_trait]
impl AgentExecutor for MockExecutor {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome> {
        self.invocations.lock().unwrap().push(Invocation {
            prompt: request.prompt.clone(),
            working_dir: request.working_dir.clone(),
            resume: request.resume.as_ref().map(|h| h.0.clone()),
            is_review: is_review_request(&request),
        });
        // Yield so concurrent workers interleave like real executions.
        tokio::task::yield_now().await;
        Ok((self.handler)(&request))
    }
}

/// Successful outcome whose transcript is one assistant message.
pub fn outcome_text(text: &str) -> ExecutionOutcome {
    ExecutionOutcome {
        success: true,
        transcript: vec![Message::AssistantText {
            text: text.to_string(),
        }],
        session_id: Some(format!("session-{}", uuid::Uuid::new_v4().simple())),
        error: None,
        duration: Duration::from_millis(1),
    }
}

/// Successful outcome with a fixed session id, for asserting session
/// reuse across revision rounds.
pub fn outcome_text_with_session(text: &str, session: &str) -> ExecutionOutcome {
    ExecutionOutcome {
        session_id: Some(session.to_string()),
        ..outcome_text(text)
    }
}

/// Failed outcome with an error message.
pub fn outcome_failure(error: &str) -> ExecutionOutcome {
    ExecutionOutcome {
        success: false,
        transcript: vec![],
        session_id: None,
        error: Some(error.to_string()),
        duration: Duration::from_millis(1),
    }
}

/// Write a file derived from the task title into the working directory,
/// simulating engineer output.
pub fn write_task_file(request: &ExecutionRequest) {
    let title = extract_task_title(&request.prompt).unwrap_or_else(|| "work".to_string());
    let name: String = title
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    std::fs::write(
        request.working_dir.join(format!("{name}.txt")),
        format!("{title}\n"),
    )
    .expect("failed to write task file");
}

/// Run `git merge <base>` in the working directory and resolve every
/// conflicted file by keeping both intents (used by conflict-resolution
/// scripts).
pub fn resolve_merge_conflicts(working_dir: &Path, base_branch: &str) {
    let merge = Command::new("git")
        .args(["merge", base_branch])
        .current_dir(working_dir)
        .output()
        .expect("failed to run git merge");

    if merge.status.success() {
        return;
    }

    let status = git_output(working_dir, &["status", "--porcelain"]);
    for line in status.lines() {
        if line.starts_with("UU") || line.starts_with("AA") || line.starts_with("DD") {
            let path = line[2..].trim();
            let full = working_dir.join(path);
            let content = std::fs::read_to_string(&full).unwrap_or_default();
            let resolved: String = content
                .lines()
                .filter(|l| {
                    !l.starts_with("<<<<<<<") && !l.starts_with("=======") && !l.starts_with(">>>>>>>")
                })
                .map(|l| format!("{l}\n"))
                .collect();
            std::fs::write(&full, resolved).expect("failed to write resolution");
        }
    }

    git(working_dir, &["add", "-A"]);
    git(working_dir, &["commit", "--no-edit"]);
}
