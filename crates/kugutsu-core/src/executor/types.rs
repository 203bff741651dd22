//! Executor request/response types.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Opaque handle to a prior executor session, used to resume stateful
/// conversations across development, review, and revision rounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle(pub String);

/// One structured message in an executor transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Message {
    UserInput {
        text: String,
    },
    AssistantText {
        text: String,
    },
    ToolInvocation {
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        name: String,
        success: bool,
        payload: serde_json::Value,
    },
    SystemNotice {
        text: String,
    },
    Error {
        message: String,
    },
    SessionMarker {
        session_id: String,
    },
}

impl Message {
    /// Render the message as one transcript line.
    pub fn render(&self) -> String {
        match self {
            Self::UserInput { text } => format!("[user] {text}"),
            Self::AssistantText { text } => text.clone(),
            Self::ToolInvocation { name, input } => format!("[tool:{name}] {input}"),
            Self::ToolResult { name, success, .. } => {
                format!("[tool-result:{name}] {}", if *success { "ok" } else { "error" })
            }
            Self::SystemNotice { text } => format!("[system] {text}"),
            Self::Error { message } => format!("[error] {message}"),
            Self::SessionMarker { session_id } => format!("[session] {session_id}"),
        }
    }
}

/// One executor invocation.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub prompt: String,
    pub working_dir: PathBuf,
    pub max_turns: u32,
    /// Tool names the agent may use, in the runtime's own vocabulary.
    pub allowed_tools: Vec<String>,
    /// Resume a prior session; `None` starts fresh.
    pub resume: Option<SessionHandle>,
    /// Triggered on orchestrator shutdown; the executor terminates the
    /// agent and returns a failed outcome.
    pub cancel: CancellationToken,
}

impl ExecutionRequest {
    pub fn new(prompt: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            working_dir: working_dir.into(),
            max_turns: 30,
            allowed_tools: Vec::new(),
            resume: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Terminal result of one executor invocation.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub transcript: Vec<Message>,
    /// Session identifier reported by the runtime, resumable via
    /// [`SessionHandle`].
    pub session_id: Option<String>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl ExecutionOutcome {
    /// Concatenated assistant text, used by verdict parsing.
    pub fn assistant_text(&self) -> String {
        self.transcript
            .iter()
            .filter_map(|m| match m {
                Message::AssistantText { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Transcript rendered line by line.
    pub fn rendered(&self) -> Vec<String> {
        self.transcript.iter().map(Message::render).collect()
    }

    /// The session handle to resume from, when the runtime reported one.
    pub fn session_handle(&self) -> Option<SessionHandle> {
        self.session_id.clone().map(SessionHandle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_text_joins_only_assistant_messages() {
        let outcome = ExecutionOutcome {
            success: true,
            transcript: vec![
                Message::SystemNotice { text: "init".into() },
                Message::AssistantText { text: "first".into() },
                Message::ToolInvocation {
                    name: "Bash".into(),
                    input: serde_json::json!({"command": "ls"}),
                },
                Message::AssistantText { text: "second".into() },
            ],
            session_id: Some("sess-1".into()),
            error: None,
            duration: Duration::from_millis(5),
        };

        assert_eq!(outcome.assistant_text(), "first\nsecond");
        assert_eq!(outcome.session_handle(), Some(SessionHandle("sess-1".into())));
        assert_eq!(outcome.rendered().len(), 4);
    }

    #[test]
    fn message_serde_round_trip() {
        let msg = Message::ToolResult {
            name: "Read".into(),
            success: true,
            payload: serde_json::json!({"lines": 10}),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
