#[cfg(unix)]
mod unix_impl {
    use anyhow::Result;
    use async_trait::async_trait;
    use corewarden_core::{
        ProcessExit, ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager, ProcessNode,
        ProcessOutput, ProcessTermination, ProcessTreeProvider, TerminationResult,
    };
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::process::Stdio;
    use std::sync::Mutex;
    use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
    use tokio::process::{Child, Command};
    use tracing::{debug, info, warn};

    /// Unix-specific process handle implementation
    pub struct UnixProcessHandle {
        child: Child,
        command: PathBuf,
        args: Vec<String>,
    }

    impl UnixProcessHandle {
        pub fn new(child: Child, command: PathBuf, args: Vec<String>) -> Self {
            Self {
                child,
                command,
                args,
            }
        }
    }

    #[async_trait]
    impl ProcessHandle for UnixProcessHandle {
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

    /// Unix-specific process manager. Every child leads its own process group
    /// so a hard kill takes its helpers down with it.
    pub struct UnixProcessManager {
        system: Mutex<System>,
    }

    impl Default for UnixProcessManager {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ProcessLifecycle for UnixProcessManager {
        type Handle = UnixProcessHandle;

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

            // New process group, leader pid == pgid
            cmd.process_group(0);

            let child = cmd.spawn()?;

            if let Some(pid) = child.id() {
                info!(
                    pid = %pid,
                    command = %command.display(),
                    args = ?args,
                    "Spawned Unix process"
                );
            }

            Ok(UnixProcessHandle::new(
                child,
                command.to_path_buf(),
                args.to_vec(),
            ))
        }
    }

    #[async_trait]
    impl ProcessTermination for UnixProcessManager {
        async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult {
            let nix_pid = NixPid::from_raw(pid as i32);

            match signal::kill(nix_pid, Signal::SIGTERM) {
                Ok(()) => {
                    info!(pid = %pid, "Sent SIGTERM to process");
                    TerminationResult::Success
                }
                Err(nix::errno::Errno::ESRCH) => {
                    debug!(pid = %pid, "Process not found (already terminated)");
                    TerminationResult::ProcessNotFound
                }
                Err(nix::errno::Errno::EPERM) => {
                    warn!(pid = %pid, "Permission denied to terminate process");
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!(pid = %pid, error = %e, "Failed to send SIGTERM to process");
                    TerminationResult::Failed(format!("SIGTERM failed: {e}"))
                }
            }
        }

        async fn force_kill(&self, pid: ProcessId) -> TerminationResult {
            let pgid = NixPid::from_raw(pid as i32);

            match signal::killpg(pgid, Signal::SIGKILL) {
                Ok(()) => {
                    info!(pgid = %pid, "Sent SIGKILL to process group");
                    TerminationResult::Success
                }
                Err(nix::errno::Errno::ESRCH) => {
                    // The group may be gone while a straggler with another pgid survives
                    match signal::kill(pgid, Signal::SIGKILL) {
                        Ok(()) => {
                            info!(pid = %pid, "Sent SIGKILL to process");
                            TerminationResult::Success
                        }
                        Err(_) => {
                            debug!(pid = %pid, "Process group not found (already terminated)");
                            TerminationResult::ProcessNotFound
                        }
                    }
                }
                Err(nix::errno::Errno::EPERM) => {
                    warn!(pgid = %pid, "Permission denied to kill process group");
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!(pgid = %pid, error = %e, "Failed to send SIGKILL to process group");
                    TerminationResult::Failed(format!("SIGKILL to process group failed: {e}"))
                }
            }
        }
    }

    #[async_trait]
    impl ProcessTreeProvider for UnixProcessManager {
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

            let nodes: Vec<ProcessNode> = system
                .processes()
                .iter()
                .map(|(pid, process)| ProcessNode {
                    pid: pid.as_u32(),
                    parent_pid: process.parent().map(|ppid| ppid.as_u32()),
                    name: process.name().to_string_lossy().into_owned(),
                    path: process.exe().map(Path::to_path_buf),
                })
                .collect();

            debug!(count = nodes.len(), "Captured process tree snapshot");
            Ok(nodes)
        }
    }

    impl ProcessManager for UnixProcessManager {
        fn new() -> Self {
            info!("Initializing Unix process manager with system monitoring");
            Self {
                system: Mutex::new(System::new()),
            }
        }
    }
}

// Re-export the Unix implementation when on Unix systems
#[cfg(unix)]
pub use unix_impl::{UnixProcessHandle, UnixProcessManager};

// Provide stub implementations for non-Unix systems
#[cfg(not(unix))]
pub struct UnixProcessHandle;

#[cfg(not(unix))]
pub struct UnixProcessManager;

#[cfg(not(unix))]
impl UnixProcessManager {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(unix))]
impl Default for UnixProcessManager {
    fn default() -> Self {
        Self::new()
    }
}
