//! Claude Code executor adapter.
//!
//! Spawns `claude -p --output-format stream-json` as a subprocess and
//! parses its JSONL output into the common [`Message`] transcript. Session
//! resumption maps to `--resume <session-id>`.

use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

use super::trait_def::AgentExecutor;
use super::types::{ExecutionOutcome, ExecutionRequest, Message, SessionHandle};

/// Executor backed by the Claude Code CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCodeExecutor {
    /// Path to the `claude` binary. Defaults to `"claude"` (found via `$PATH`).
    binary_path: String,
}

impl ClaudeCodeExecutor {
    pub fn new() -> Self {
        Self {
            binary_path: "claude".to_string(),
        }
    }

    /// Use a custom binary path (testing, non-standard installs).
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary_path: path.into(),
        }
    }
}

impl Default for ClaudeCodeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// JSONL parsing
// ---------------------------------------------------------------------------

/// Everything extracted from one stream-json line.
#[derive(Debug, Default)]
struct ParsedLine {
    messages: Vec<Message>,
    session_id: Option<String>,
    /// Present on the terminal `result` line: `true` means the run errored.
    result_is_error: Option<bool>,
    /// Set when stdout itself failed mid-read.
    read_failed: bool,
}

/// Parse a single JSONL line from stream-json output.
///
/// Returns `Err` only for invalid JSON; callers log and skip those lines.
fn parse_stream_line(line: &str) -> Result<ParsedLine> {
    let v: serde_json::Value =
        serde_json::from_str(line).context("malformed JSON in stream output")?;

    let mut parsed = ParsedLine::default();
    if let Some(sid) = v.get("session_id").and_then(|s| s.as_str()) {
        parsed.session_id = Some(sid.to_string());
    }

    match v.get("type").and_then(|t| t.as_str()).unwrap_or("") {
        // assistant -- message with text and tool_use content blocks
        "assistant" => {
            if let Some(blocks) = v
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array())
            {
                for block in blocks {
                    match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                        "text" => {
                            if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                                parsed.messages.push(Message::AssistantText {
                                    text: text.to_string(),
                                });
                            }
                        }
                        "tool_use" => {
                            parsed.messages.push(Message::ToolInvocation {
                                name: block
                                    .get("name")
                                    .and_then(|n| n.as_str())
                                    .unwrap_or("unknown")
                                    .to_string(),
                                input: block
                                    .get("input")
                                    .cloned()
                                    .unwrap_or(serde_json::Value::Null),
                            });
                        }
                        _ => {}
                    }
                }
            }
        }

        // user -- carries tool_result content blocks back to the model
        "user" => {
            if let Some(blocks) = v
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array())
            {
                for block in blocks {
                    if block.get("type").and_then(|t| t.as_str()) == Some("tool_result") {
                        let is_error = block
                            .get("is_error")
                            .and_then(|e| e.as_bool())
                            .unwrap_or(false);
                        parsed.messages.push(Message::ToolResult {
                            name: block
                                .get("tool_use_id")
                                .and_then(|n| n.as_str())
                                .unwrap_or("unknown")
                                .to_string(),
                            success: !is_error,
                            payload: block
                                .get("content")
                                .cloned()
                                .unwrap_or(serde_json::Value::Null),
                        });
                    }
                }
            }
        }

        // system -- init notice carrying the session id
        "system" => {
            let subtype = v.get("subtype").and_then(|s| s.as_str()).unwrap_or("");
            parsed.messages.push(Message::SystemNotice {
                text: subtype.to_string(),
            });
            if let Some(sid) = parsed.session_id.clone() {
                parsed.messages.push(Message::SessionMarker { session_id: sid });
            }
        }

        // result -- terminal line with the success flag
        "result" => {
            parsed.result_is_error =
                Some(v.get("is_error").and_then(|e| e.as_bool()).unwrap_or(false));
            if let Some(text) = v.get("result").and_then(|r| r.as_str()) {
                parsed.messages.push(Message::AssistantText {
                    text: text.to_string(),
                });
            }
        }

        "error" => {
            let message = v
                .get("error")
                .and_then(|e| e.get("message").and_then(|m| m.as_str()))
                .or_else(|| v.get("message").and_then(|m| m.as_str()))
                .unwrap_or("unknown error")
                .to_string();
            parsed.messages.push(Message::Error { message });
        }

        other => {
            debug!(event_type = other, "ignoring unrecognised stream-json event type");
        }
    }

    Ok(parsed)
}

/// Stream the agent's stdout as parsed JSONL lines.
///
/// Malformed lines are logged and skipped; a read error yields one final
/// item flagging the failure, then the stream ends.
fn parsed_lines(stdout: ChildStdout) -> impl Stream<Item = ParsedLine> {
    async_stream::stream! {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match parse_stream_line(trimmed) {
                        Ok(parsed) => yield parsed,
                        Err(e) => {
                            warn!(line = trimmed, error = %e, "skipping malformed JSONL line");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    yield ParsedLine {
                        messages: vec![Message::Error {
                            message: format!("stdout read error: {e}"),
                        }],
                        read_failed: true,
                        ..ParsedLine::default()
                    };
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Process control
// ---------------------------------------------------------------------------

/// SIGTERM, grace period, then SIGKILL.
async fn kill_gracefully(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        let grace = tokio::time::timeout(std::time::Duration::from_secs(2), child.wait()).await;
        if grace.is_ok() {
            return;
        }
    }
    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill agent process");
    }
}

#[async_trait]
impl AgentExecutor for ClaudeCodeExecutor {
    fn name(&self) -> &str {
        "claude-code"
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome> {
        let started = Instant::now();

        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--max-turns")
            .arg(request.max_turns.to_string());
        if !request.allowed_tools.is_empty() {
            cmd.arg("--allowedTools").arg(request.allowed_tools.join(","));
        }
        if let Some(SessionHandle(session)) = &request.resume {
            cmd.arg("--resume").arg(session);
        }
        cmd.current_dir(&request.working_dir);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::null());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn claude binary at '{}' -- is it installed and on PATH?",
                self.binary_path
            )
        })?;

        // Claude Code in `-p` mode reads the user prompt from stdin; close
        // it so the agent starts processing.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(request.prompt.as_bytes()).await {
                warn!(error = %e, "failed to write prompt to agent stdin");
            }
            drop(stdin);
        }

        let stdout = child.stdout.take().context("child process has no stdout")?;
        let mut lines = std::pin::pin!(parsed_lines(stdout));

        let mut transcript = vec![Message::UserInput {
            text: request.prompt.clone(),
        }];
        let mut session_id: Option<String> = None;
        let mut result_is_error: Option<bool> = None;
        let mut read_failed = false;

        loop {
            tokio::select! {
                _ = request.cancel.cancelled() => {
                    warn!("executor cancelled, terminating agent");
                    kill_gracefully(&mut child).await;
                    return Ok(ExecutionOutcome {
                        success: false,
                        transcript,
                        session_id,
                        error: Some("cancelled by orchestrator shutdown".to_string()),
                        duration: started.elapsed(),
                    });
                }
                parsed = lines.next() => match parsed {
                    Some(parsed) => {
                        if parsed.session_id.is_some() {
                            session_id = parsed.session_id;
                        }
                        if parsed.result_is_error.is_some() {
                            result_is_error = parsed.result_is_error;
                        }
                        read_failed |= parsed.read_failed;
                        transcript.extend(parsed.messages);
                    }
                    None => break,
                }
            }
        }

        let status = child.wait().await.context("failed to await agent exit")?;

        // Prefer the explicit result line; fall back to the exit status.
        let success = match result_is_error {
            Some(is_error) => !is_error,
            None => status.success(),
        } && !read_failed;

        let error = if success {
            None
        } else {
            transcript
                .iter()
                .rev()
                .find_map(|m| match m {
                    Message::Error { message } => Some(message.clone()),
                    _ => None,
                })
                .or_else(|| Some(format!("agent exited with status {status}")))
        };

        Ok(ExecutionOutcome {
            success,
            transcript,
            session_id,
            error,
            duration: started.elapsed(),
        })
    }
}
