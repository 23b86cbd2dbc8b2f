//! Captured core output: ANSI stripping, level parsing and the bounded ring
//! of recent lines used for diagnostics.

use serde::Serialize;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

static ANSI_ESCAPE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("ANSI escape pattern is valid")
});

/// Remove terminal color and cursor sequences from a line of output
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    ANSI_ESCAPE.replace_all(text, "")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Pick the level token out of a core log line, e.g.
    /// `+0800 2025-01-01 12:00:00 ERROR [42 0ms] router: ...`
    pub fn detect(line: &str) -> Self {
        for token in line.split_whitespace().take(6) {
            let token = token.trim_matches(|c: char| !c.is_ascii_alphabetic());
            match token.to_ascii_uppercase().as_str() {
                "TRACE" => return LogLevel::Trace,
                "DEBUG" => return LogLevel::Debug,
                "INFO" => return LogLevel::Info,
                "WARN" | "WARNING" => return LogLevel::Warn,
                "ERROR" => return LogLevel::Error,
                "FATAL" | "PANIC" => return LogLevel::Fatal,
                _ => {}
            }
        }
        if line.starts_with("panic:") {
            LogLevel::Fatal
        } else {
            LogLevel::Info
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub text: String,
}

impl LogLine {
    /// Strip ANSI sequences and classify a raw output line
    pub fn parse(raw: &str) -> Self {
        let text = strip_ansi(raw).trim_end().to_string();
        Self {
            level: LogLevel::detect(&text),
            text,
        }
    }
}

/// Fixed-capacity ring of the most recent lines
#[derive(Debug, Clone)]
pub struct LogRing {
    capacity: usize,
    lines: VecDeque<LogLine>,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, line: LogLine) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// The last `count` lines, oldest first
    pub fn tail(&self, count: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(count);
        self.lines.iter().skip(skip).map(|l| l.text.clone()).collect()
    }

    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lines.iter().cloned().collect()
    }
}

/// A `LogRing` shared between output readers and the supervisor
#[derive(Debug, Clone)]
pub struct SharedLogRing(Arc<Mutex<LogRing>>);

impl SharedLogRing {
    pub fn new(capacity: usize) -> Self {
        Self(Arc::new(Mutex::new(LogRing::new(capacity))))
    }

    fn lock(&self) -> MutexGuard<'_, LogRing> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, line: LogLine) {
        self.lock().push(line);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn tail(&self, count: usize) -> Vec<String> {
        self.lock().tail(count)
    }

    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lock().snapshot()
    }
}
