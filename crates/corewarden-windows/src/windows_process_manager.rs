use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use corewarden_core::*;

/// CREATE_NO_WINDOW - Creates a process without a console window
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Windows-specific process handle implementation
pub struct WindowsProcessHandle {
    child: Child,
    command: PathBuf,
    args: Vec<String>,
}

impl WindowsProcessHandle {
    pub fn new(child: Child, command: PathBuf, args: Vec<String>) -> Self {
        Self {
            child,
            command,
            args,
        }
    }
}

#[async_trait]
impl ProcessHandle for WindowsProcessHandle {
    fn get_pid(&self) -> Option<ProcessId> {
        self.child.id()
    }

    fn get_command(&self) -> &Path {
        &self.command
    }

    fn get_args(&self) -> &[String] {
        &self.args
    }

    fn take_stdout(&mut self) -> Option<ProcessOutput> {
        self.child
            .stdout
            .take()
            .map(|out| Box::new(out) as ProcessOutput)
    }

    fn take_stderr(&mut self) -> Option<ProcessOutput> {
        self.child
            .stderr
            .take()
            .map(|err| Box::new(err) as ProcessOutput)
    }

    async fn wait(&mut self) -> Result<ProcessExit> {
        let status = self.child.wait().await?;
        Ok(ProcessExit::from(status))
    }
}

/// Windows-specific process manager with process tree management
pub struct WindowsProcessManager {
    system: Mutex<System>,
}

impl Default for WindowsProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessLifecycle for WindowsProcessManager {
    type Handle = WindowsProcessHandle;

    async fn spawn_process(
        &self,
        command: &Path,
        args: &[String],
        working_dir: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> std::io::Result<Self::Handle> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        #[cfg(windows)]
        {
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let child = cmd.spawn()?;

        if let Some(pid) = child.id() {
            info!(
                pid = %pid,
                command = %command.display(),
                args = ?args,
                "Spawned Windows process"
            );
        }

        Ok(WindowsProcessHandle::new(
            child,
            command.to_path_buf(),
            args.to_vec(),
        ))
    }
}

#[async_trait]
impl ProcessTermination for WindowsProcessManager {
    async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult {
        match self.taskkill(pid, false).await {
            Ok(true) => {
                info!(pid = %pid, "Successfully sent graceful termination to process");
                TerminationResult::Success
            }
            Ok(false) => {
                debug!(pid = %pid, "Process not found for graceful termination");
                TerminationResult::ProcessNotFound
            }
            Err(e) => {
                warn!(pid = %pid, error = %e, "Failed to gracefully terminate process");
                TerminationResult::Failed(format!("Graceful termination failed: {e}"))
            }
        }
    }

    async fn force_kill(&self, pid: ProcessId) -> TerminationResult {
        match self.taskkill_tree(pid).await {
            Ok(true) => {
                info!(root_pid = %pid, "Successfully terminated process tree");
                TerminationResult::Success
            }
            Ok(false) => {
                debug!(root_pid = %pid, "Process tree not found for force kill");
                TerminationResult::ProcessNotFound
            }
            Err(e) => {
                warn!(root_pid = %pid, error = %e, "Failed to force kill process tree");
                TerminationResult::Failed(format!("Force kill failed: {e}"))
            }
        }
    }
}

#[async_trait]
impl ProcessTreeProvider for WindowsProcessManager {
    async fn snapshot(&self) -> Result<Vec<ProcessNode>> {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_exe(UpdateKind::OnlyIfNotSet),
        );

        Ok(system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessNode {
                pid: pid.as_u32(),
                parent_pid: process.parent().map(|ppid| ppid.as_u32()),
                name: process.name().to_string_lossy().into_owned(),
                path: process.exe().map(Path::to_path_buf),
            })
            .collect())
    }
}

impl ProcessManager for WindowsProcessManager {
    fn new() -> Self {
        info!("Initializing Windows process manager with system monitoring");
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl WindowsProcessManager {
    /// Use taskkill to terminate a single process
    async fn taskkill(&self, pid: u32, force: bool) -> Result<bool> {
        let pid_string = pid.to_string();
        let mut args = vec!["/PID", &pid_string];
        if force {
            args.push("/F");
        }

        let output = Self::quiet_command("taskkill").args(&args).output().await?;

        Ok(output.status.success())
    }

    /// Use taskkill with /T to terminate a process tree
    async fn taskkill_tree(&self, pid: u32) -> Result<bool> {
        let output = Self::quiet_command("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .output()
            .await?;

        Ok(output.status.success())
    }

    fn quiet_command(program: &str) -> Command {
        #[allow(unused_mut)]
        let mut cmd = Command::new(program);
        #[cfg(windows)]
        {
            cmd.creation_flags(CREATE_NO_WINDOW);
        }
        cmd
    }
}
