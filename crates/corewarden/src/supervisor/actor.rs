use crate::diagnostics::{classify_runtime, diagnose, hints};
use crate::error::SupervisorError;
use crate::installer::BinaryProvider;
use crate::validator::ConfigCheck;
use corewarden_core::{
    CoreStatus, Diagnostic, EventBus, FailureKind, LogLine, ProcessExit, ProcessHandle, ProcessId,
    ProcessManager, ProcessOutput, Responder, RetryPolicy, RUN_VERB, SharedLogRing, StatusEvent,
    SupervisorSettings, pump_lines,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long an exited process's output readers may take to drain their pipes
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

pub(super) enum LifecycleCommand {
    Start {
        config: PathBuf,
        reply: Responder<(), SupervisorError>,
    },
    Stop {
        suppress_events: bool,
        reply: Responder<(), SupervisorError>,
    },
    Restart {
        config: PathBuf,
        reply: Responder<(), SupervisorError>,
    },
    Shutdown {
        reply: Responder<(), SupervisorError>,
    },
    /// Sent by the exit watcher of process `generation`
    Exited {
        generation: u64,
        exit: ProcessExit,
    },
    /// Delayed crash restart, void once `epoch` is stale
    RetryStart {
        epoch: u64,
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartOrigin {
    Caller,
    CrashRetry,
}

struct TrackedProcess {
    generation: u64,
    pid: Option<ProcessId>,
    config: PathBuf,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl TrackedProcess {
    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

enum LaunchError {
    Fatal(SupervisorError),
    EarlyExit {
        exit: ProcessExit,
        diagnostic: Diagnostic,
    },
}

impl From<SupervisorError> for LaunchError {
    fn from(error: SupervisorError) -> Self {
        LaunchError::Fatal(error)
    }
}

pub(super) struct SupervisorActor<M: ProcessManager> {
    manager: Arc<M>,
    binaries: Arc<dyn BinaryProvider>,
    validator: Arc<dyn ConfigCheck>,
    settings: SupervisorSettings,
    crash_policy: RetryPolicy,
    events: EventBus,
    status: watch::Sender<CoreStatus>,
    logs: SharedLogRing,
    mailbox: mpsc::WeakUnboundedSender<LifecycleCommand>,
    tracked: Option<TrackedProcess>,
    /// Bumped on every spawn; a pending hard kill only fires while it is unchanged
    generation: AtomicU64,
    retry_count: u32,
    /// Bumped by stops and caller starts to void scheduled crash restarts
    retry_epoch: u64,
}

impl<M: ProcessManager> SupervisorActor<M> {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        manager: Arc<M>,
        binaries: Arc<dyn BinaryProvider>,
        validator: Arc<dyn ConfigCheck>,
        settings: SupervisorSettings,
        events: EventBus,
        status: watch::Sender<CoreStatus>,
        logs: SharedLogRing,
        mailbox: mpsc::WeakUnboundedSender<LifecycleCommand>,
    ) -> Self {
        Self {
            manager,
            binaries,
            validator,
            crash_policy: RetryPolicy::new(&settings.crash_retry),
            settings,
            events,
            status,
            logs,
            mailbox,
            tracked: None,
            generation: AtomicU64::new(0),
            retry_count: 0,
            retry_epoch: 0,
        }
    }

    pub(super) async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<LifecycleCommand>) {
        while let Some(command) = mailbox.recv().await {
            match command {
                LifecycleCommand::Start { config, reply } => {
                    let result = self.start(config, StartOrigin::Caller).await;
                    reply.send(result);
                }
                LifecycleCommand::Stop {
                    suppress_events,
                    reply,
                } => {
                    self.stop(suppress_events).await;
                    reply.send(Ok(()));
                }
                LifecycleCommand::Restart { config, reply } => {
                    self.stop(true).await;
                    let result = self.start(config, StartOrigin::Caller).await;
                    reply.send(result);
                }
                LifecycleCommand::Shutdown { reply } => {
                    self.stop(false).await;
                    reply.send(Ok(()));
                    break;
                }
                LifecycleCommand::Exited { generation, exit } => {
                    self.on_exit(generation, exit);
                }
                LifecycleCommand::RetryStart { epoch, config } => {
                    if epoch == self.retry_epoch {
                        // failures were already reported as events
                        let _ = self.start(config, StartOrigin::CrashRetry).await;
                    } else {
                        debug!(epoch, current = self.retry_epoch, "Dropping cancelled crash restart");
                    }
                }
            }
        }

        if self.tracked.is_some() {
            self.stop(true).await;
        }
        debug!("Supervisor actor finished");
    }

    fn is_alive(&self) -> bool {
        self.tracked.as_ref().is_some_and(|t| !t.has_exited())
    }

    fn set_status(&self, status: CoreStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            debug!(status = ?status, "Core status changed");
            self.events.emit(StatusEvent::Status { status });
        }
    }

    fn report(&self, kind: FailureKind, diagnostic: Diagnostic, terminal: bool) {
        self.events.emit(StatusEvent::Error {
            kind,
            diagnostic,
            terminal,
        });
    }

    fn exit_diagnostic(&self, exit: ProcessExit, fallback: &str) -> Diagnostic {
        diagnose(exit.code, &self.logs.tail(self.settings.log_capacity), fallback)
    }

    async fn start(&mut self, config: PathBuf, origin: StartOrigin) -> Result<(), SupervisorError> {
        if self.is_alive() {
            debug!("Core already running, start ignored");
            return Ok(());
        }
        // an exited process whose exit notice is still queued
        self.tracked = None;

        if origin == StartOrigin::Caller {
            self.retry_count = 0;
            self.retry_epoch += 1;
        }

        self.set_status(CoreStatus::Starting);
        match self.launch(&config).await {
            Ok(tracked) => {
                info!(pid = ?tracked.pid, generation = tracked.generation, "Core is running");
                self.tracked = Some(tracked);
                self.set_status(CoreStatus::Running);
                Ok(())
            }
            Err(LaunchError::Fatal(error)) => {
                error!(error = %error, "Core failed to start");
                self.set_status(CoreStatus::Stopped);
                if let Some(kind) = error.kind() {
                    self.report(kind, error.diagnostic(), true);
                }
                Err(error)
            }
            Err(LaunchError::EarlyExit { exit, diagnostic }) => {
                if exit.success() {
                    self.set_status(CoreStatus::Stopped);
                    self.report(FailureKind::EarlyExit, diagnostic.clone(), true);
                } else {
                    self.handle_crash(FailureKind::EarlyExit, exit, diagnostic.clone(), config);
                }
                Err(SupervisorError::EarlyExit(diagnostic))
            }
        }
    }

    async fn launch(&self, config: &Path) -> Result<TrackedProcess, LaunchError> {
        let binary = self
            .binaries
            .ensure_binary()
            .await
            .map_err(SupervisorError::from)?;
        self.validator
            .check(&binary, config)
            .await
            .map_err(SupervisorError::from)?;

        self.logs.clear();
        let args = vec![
            RUN_VERB.to_string(),
            "-c".to_string(),
            config.to_string_lossy().into_owned(),
        ];
        let mut handle = self
            .manager
            .spawn_process(&binary, &args, binary.parent(), &self.settings.env)
            .await
            .map_err(|e| {
                let message = format!("{}: {e}", binary.display());
                SupervisorError::Spawn(Diagnostic::new(message.clone()).with_hints(hints(&message)))
            })?;

        let pid = handle.get_pid();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let readers: Vec<JoinHandle<()>> = [handle.take_stdout(), handle.take_stderr()]
            .into_iter()
            .flatten()
            .map(|io| self.spawn_reader(io))
            .collect();

        let (exit_tx, exit_rx) = watch::channel(None);
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let exit = handle.wait().await.unwrap_or_else(|e| {
                warn!(error = %e, "Failed to wait for core process");
                ProcessExit { code: None }
            });
            let drained = tokio::time::timeout(READER_DRAIN_TIMEOUT, async {
                for reader in readers {
                    let _ = reader.await;
                }
            })
            .await;
            if drained.is_err() {
                debug!(generation, "Output readers still busy after exit");
            }
            exit_tx.send_replace(Some(exit));
            if let Some(mailbox) = mailbox.upgrade() {
                let _ = mailbox.send(LifecycleCommand::Exited { generation, exit });
            }
        });

        info!(pid = ?pid, generation, config = %config.display(), "Core process spawned");

        let mut exit_watch = exit_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.settings.startup_grace()) => Ok(TrackedProcess {
                generation,
                pid,
                config: config.to_path_buf(),
                exit: exit_rx,
            }),
            exited = exit_watch.wait_for(Option::is_some) => {
                let exit = exited.ok().and_then(|e| *e).unwrap_or(ProcessExit { code: None });
                let diagnostic = self.exit_diagnostic(exit, "core exited during startup");
                warn!(
                    exit_code = ?exit.code,
                    summary = %diagnostic.summary,
                    "Core exited within the startup window"
                );
                Err(LaunchError::EarlyExit { exit, diagnostic })
            }
        }
    }

    fn spawn_reader(&self, io: ProcessOutput) -> JoinHandle<()> {
        let logs = self.logs.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = pump_lines(io, |raw| {
                let line = LogLine::parse(&raw);
                if line.text.is_empty() {
                    return;
                }
                if let Some(kind) = classify_runtime(&line) {
                    events.emit(StatusEvent::RuntimeDiagnostic {
                        kind,
                        line: line.text.clone(),
                    });
                }
                logs.push(line.clone());
                events.emit(StatusEvent::Log(line));
            })
            .await;
            if let Err(e) = result {
                debug!(error = %e, "Core output reader stopped");
            }
        })
    }

    fn on_exit(&mut self, generation: u64, exit: ProcessExit) {
        let Some(tracked) = self.tracked.take_if(|t| t.generation == generation) else {
            debug!(generation, "Ignoring exit of a process that is no longer tracked");
            return;
        };

        let diagnostic = self.exit_diagnostic(exit, "core exited unexpectedly");
        if exit.success() {
            info!(pid = ?tracked.pid, "Core process exited cleanly");
        } else {
            warn!(
                pid = ?tracked.pid,
                exit_code = ?exit.code,
                summary = %diagnostic.summary,
                "Core process crashed"
            );
        }
        self.handle_crash(FailureKind::RuntimeCrash, exit, diagnostic, tracked.config);
    }

    /// Apply the crash-retry policy to an unrequested exit
    fn handle_crash(
        &mut self,
        kind: FailureKind,
        exit: ProcessExit,
        diagnostic: Diagnostic,
        config: PathBuf,
    ) {
        if exit.success() {
            self.set_status(CoreStatus::Stopped);
            return;
        }

        self.set_status(CoreStatus::Crashed);
        let retry = self.retry_count + 1;
        match self.crash_policy.delay_for(retry) {
            Some(delay) => {
                self.retry_count = retry;
                warn!(
                    retry,
                    max_retries = self.crash_policy.max_retries(),
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling core restart"
                );
                self.report(kind, diagnostic, false);
                self.schedule_retry(delay, config);
            }
            None => {
                error!(
                    retries = self.retry_count,
                    "Core keeps crashing, giving up until the next manual start"
                );
                self.report(kind, diagnostic, true);
                self.set_status(CoreStatus::Stopped);
            }
        }
    }

    fn schedule_retry(&self, delay: Duration, config: PathBuf) {
        let epoch = self.retry_epoch;
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(mailbox) = mailbox.upgrade() {
                let _ = mailbox.send(LifecycleCommand::RetryStart { epoch, config });
            }
        });
    }

    async fn stop(&mut self, suppress_events: bool) {
        self.retry_epoch += 1;

        let Some(tracked) = self.tracked.take() else {
            if !suppress_events {
                self.set_status(CoreStatus::Stopped);
            }
            return;
        };

        if !tracked.has_exited() {
            if !suppress_events {
                self.set_status(CoreStatus::Stopping);
            }
            if let Some(pid) = tracked.pid {
                let result = self.manager.terminate_gracefully(pid).await;
                debug!(pid, result = ?result, "Requested graceful termination");
                self.arm_hard_kill(&tracked, pid);
            }

            let mut exit = tracked.exit.clone();
            let waited =
                tokio::time::timeout(self.settings.stop_timeout(), exit.wait_for(Option::is_some))
                    .await
                    .is_ok();
            if waited {
                info!(pid = ?tracked.pid, "Core process stopped");
            } else {
                warn!(
                    pid = ?tracked.pid,
                    timeout_ms = self.settings.stop_timeout_ms,
                    "Core did not exit in time, continuing"
                );
            }
        }

        if !suppress_events {
            self.set_status(CoreStatus::Stopped);
        }
    }

    /// Kill the stopped process tree after the grace delay unless it has exited.
    /// The pid and exit watch belong to this generation only, so a process
    /// started in the meantime is never touched.
    fn arm_hard_kill(&self, tracked: &TrackedProcess, pid: ProcessId) {
        let generation = tracked.generation;
        let exit = tracked.exit.clone();
        let manager = self.manager.clone();
        let delay = self.settings.hard_kill_delay();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if exit.borrow().is_some() {
                debug!(pid, generation, "Core exited before the hard kill");
                return;
            }
            warn!(pid, generation, "Core ignored graceful termination, killing it");
            let result = manager.force_kill(pid).await;
            debug!(pid, result = ?result, "Hard kill finished");
        });
    }
}
