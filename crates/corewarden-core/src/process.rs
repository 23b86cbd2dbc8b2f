use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncRead;

/// Unique identifier for a process
pub type ProcessId = u32;

/// Captured stdout or stderr of a spawned process
pub type ProcessOutput = Box<dyn AsyncRead + Send + Unpin>;

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, absent when the process was ended by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn with_code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "terminated by signal"),
        }
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Signal delivered
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Insufficient privileges
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

impl TerminationResult {
    /// The target is gone or about to be
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            TerminationResult::Success | TerminationResult::ProcessNotFound
        )
    }
}

/// One entry of a process-tree snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessNode {
    pub pid: ProcessId,
    pub parent_pid: Option<ProcessId>,
    /// Executable name as reported by the OS
    pub name: String,
    pub path: Option<PathBuf>,
}

impl ProcessNode {
    pub fn new(pid: ProcessId, parent_pid: Option<ProcessId>, name: impl Into<String>) -> Self {
        Self {
            pid,
            parent_pid,
            name: name.into(),
            path: None,
        }
    }
}

/// Trait representing a handle to a running process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID (None if process has exited)
    fn get_pid(&self) -> Option<ProcessId>;

    /// Get the executable that started this process
    fn get_command(&self) -> &Path;

    /// Get the arguments passed to this process
    fn get_args(&self) -> &[String];

    /// Take ownership of the piped stdout; subsequent calls return None
    fn take_stdout(&mut self) -> Option<ProcessOutput>;

    /// Take ownership of the piped stderr; subsequent calls return None
    fn take_stderr(&mut self) -> Option<ProcessOutput>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> Result<ProcessExit>;
}

/// Spawning of processes with piped output
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// The type of process handle this lifecycle manager produces
    type Handle: ProcessHandle + 'static;

    /// Spawn a new process. Errors are the raw OS error so callers can tell a
    /// missing binary from a permission problem.
    async fn spawn_process(
        &self,
        command: &Path,
        args: &[String],
        working_dir: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> std::io::Result<Self::Handle>;
}

/// Termination by process id
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Ask the process to exit (SIGTERM on Unix, plain taskkill on Windows)
    async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult;

    /// Kill the process and everything it started (process group on Unix,
    /// whole tree on Windows)
    async fn force_kill(&self, pid: ProcessId) -> TerminationResult;
}

/// Source of OS process-tree snapshots
#[async_trait]
pub trait ProcessTreeProvider: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<ProcessNode>>;
}

/// Platform process manager combining spawn, termination and tree snapshots
pub trait ProcessManager:
    ProcessLifecycle + ProcessTermination + ProcessTreeProvider + 'static
{
    /// Create a new process manager instance
    fn new() -> Self
    where
        Self: Sized;
}

/// Factory trait for creating platform-specific process managers
pub trait ProcessManagerFactory {
    /// The type of process manager this factory creates
    type Manager: ProcessManager;

    /// Create a process manager for the current platform
    fn create_process_manager() -> Self::Manager;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}
