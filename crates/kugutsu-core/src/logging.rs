//! Pluggable structured log sink.
//!
//! Pipeline components emit [`LogRecord`]s through a [`LogSink`] so external
//! viewers can attach without the core knowing about them. The default sink
//! forwards to `tracing`; a no-op sink exists for tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Identifies the component (and instance) that produced a record.
#[derive(Debug, Clone, Serialize)]
pub struct LogExecutor {
    /// Component kind, e.g. "engineer", "techlead", "merge-coordinator".
    pub kind: String,
    /// Instance identifier, e.g. an engineer id or task id.
    pub id: String,
}

/// One structured log record.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub executor: LogExecutor,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Free-form structured context.
    pub context: Option<serde_json::Value>,
}

/// Destination for pipeline log records.
pub trait LogSink: Send + Sync {
    fn log(&self, record: LogRecord);
}

/// Sink that forwards records to the `tracing` subscriber.
#[derive(Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, record: LogRecord) {
        let kind = record.executor.kind.as_str();
        let id = record.executor.id.as_str();
        match record.level {
            LogLevel::Debug => tracing::debug!(kind, id, "{}", record.message),
            LogLevel::Info => tracing::info!(kind, id, "{}", record.message),
            LogLevel::Warn => tracing::warn!(kind, id, "{}", record.message),
            LogLevel::Error => tracing::error!(kind, id, "{}", record.message),
        }
    }
}

/// Sink that discards everything.
#[derive(Debug, Default)]
pub struct NoopSink;

impl LogSink for NoopSink {
    fn log(&self, _record: LogRecord) {}
}

/// Convenience constructor used by components.
pub fn record(
    kind: &str,
    id: &str,
    level: LogLevel,
    message: impl Into<String>,
) -> LogRecord {
    LogRecord {
        executor: LogExecutor {
            kind: kind.to_string(),
            id: id.to_string(),
        },
        level,
        message: message.into(),
        timestamp: Utc::now(),
        context: None,
    }
}

/// Shared handle type used throughout the pipeline.
pub type SharedSink = Arc<dyn LogSink>;
