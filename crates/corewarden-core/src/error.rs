use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Failure categories surfaced to the surrounding application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// Validation failed before spawn
    ConfigInvalid,
    /// The OS refused to execute the binary
    SpawnFailure,
    /// The process exited inside the startup grace window
    EarlyExit,
    /// The process exited after running normally
    RuntimeCrash,
    /// Download or extraction of the binary failed
    InstallFailure,
}

impl FailureKind {
    /// Check if this failure is governed by the crash-retry policy
    pub fn is_crash(&self) -> bool {
        matches!(self, FailureKind::EarlyExit | FailureKind::RuntimeCrash)
    }
}

/// Human-actionable description of a failure: one summary line, matched hints,
/// and the tail of the captured output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub exit_code: Option<i32>,
    pub summary: String,
    pub hints: Vec<String>,
    pub recent_logs: Vec<String>,
}

impl Diagnostic {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Default::default()
        }
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_hints(mut self, hints: Vec<String>) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_recent_logs(mut self, lines: Vec<String>) -> Self {
        self.recent_logs = lines;
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "[exit {code}] {}", self.summary)?,
            None => write!(f, "{}", self.summary)?,
        }
        for hint in &self.hints {
            write!(f, "\n  hint: {hint}")?;
        }
        if !self.recent_logs.is_empty() {
            write!(f, "\n  recent output:")?;
            for line in &self.recent_logs {
                write!(f, "\n    {line}")?;
            }
        }
        Ok(())
    }
}

/// Returned by a queued operation whose worker has gone away
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("serialized queue is closed")]
pub struct QueueClosed;
