//! The `AgentExecutor` trait -- the opaque boundary to the agent runtime.

use anyhow::Result;
use async_trait::async_trait;

use super::types::{ExecutionOutcome, ExecutionRequest};

/// Runs one agent session to completion.
///
/// Implementors wrap a specific agent CLI and translate its output into
/// the common [`super::Message`] transcript. The trait is object-safe so
/// stages can hold `Arc<dyn AgentExecutor>`.
///
/// Contract:
/// - `execute` returns `Err` only for infrastructure failures (binary not
///   found, spawn failure). An agent that runs and fails returns
///   `Ok(outcome)` with `success = false`.
/// - When `request.cancel` fires mid-run, the agent process is terminated
///   and the outcome reports failure with a cancellation error.
/// - When `request.resume` is set, the runtime continues that session;
///   otherwise a fresh session starts.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Human-readable name for this executor (e.g. "claude-code").
    fn name(&self) -> &str;

    /// Run the agent and collect its transcript and terminal status.
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome>;
}

// Compile-time assertion: AgentExecutor must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn AgentExecutor) {}
};
