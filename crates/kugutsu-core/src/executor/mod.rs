//! Agent executor interface for LLM-backed workers.
//!
//! The pipeline treats the agent runtime as opaque: given a prompt, a
//! working directory, a tool allow-list, and an optional prior session,
//! an executor produces a transcript of structured [`Message`]s and a
//! terminal success flag. [`ClaudeCodeExecutor`] is the concrete adapter;
//! tests substitute a scripted implementation of [`AgentExecutor`].

pub mod claude_code;
pub mod trait_def;
pub mod types;

pub use claude_code::ClaudeCodeExecutor;
pub use trait_def::AgentExecutor;
pub use types::{ExecutionOutcome, ExecutionRequest, Message, SessionHandle};
