#![allow(dead_code)]

use async_trait::async_trait;
use corewarden::{
    ConfigValidator, EventBus, ExistingBinary, ProcessId, ProcessLifecycle, ProcessManager,
    ProcessNode, ProcessTermination, ProcessTreeProvider, RetryConfig, StatusEvent, Supervisor,
    SupervisorSettings, TerminationResult,
};
use corewarden_unix::{UnixProcessHandle, UnixProcessManager};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Run bodies for the fake core
pub const RUNS_FOREVER: &str = "exec sleep 30";
pub const IGNORES_SIGTERM: &str = "trap '' TERM\nwhile true; do sleep 1; done";
pub const CRASHES: &str = "echo 'FATAL[0000] start service: bind: address already in use' >&2\nexit 1";
pub const EXITS_CLEANLY: &str = "echo 'nothing to do'\nexit 0";
pub const CRASHES_LATER: &str =
    "echo 'INFO[0000] sing-box started'\nsleep 0.5\necho 'FATAL[0001] inbound/tun[tun-in]: connection lost' >&2\nexit 1";

/// Shell script standing in for the core binary; every invocation appends
/// its verb and pid to `calls.log` next to it
pub struct FakeCore {
    pub dir: TempDir,
    pub binary: PathBuf,
    pub config: PathBuf,
}

impl FakeCore {
    pub fn new(run_body: &str) -> Self {
        Self::with_check(run_body, "exit 0")
    }

    pub fn with_check(run_body: &str, check_body: &str) -> Self {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("fake-core");
        let log = dir.path().join("calls.log");
        let script = format!(
            "#!/bin/sh\necho \"$1 $$\" >> '{}'\nif [ \"$1\" = check ]; then\n{check_body}\nfi\n{run_body}\n",
            log.display()
        );
        std::fs::write(&binary, script).unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = dir.path().join("config.json");
        std::fs::write(&config, "{}").unwrap();
        Self {
            dir,
            binary,
            config,
        }
    }

    fn pids(&self, verb: &str) -> Vec<ProcessId> {
        std::fs::read_to_string(self.dir.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .filter_map(|line| line.split_once(' '))
            .filter(|(logged, _)| *logged == verb)
            .filter_map(|(_, pid)| pid.parse().ok())
            .collect()
    }

    /// Pids of every `run` invocation, oldest first
    pub fn run_pids(&self) -> Vec<ProcessId> {
        self.pids("run")
    }

    pub fn run_count(&self) -> usize {
        self.pids("run").len()
    }

    pub fn check_count(&self) -> usize {
        self.pids("check").len()
    }
}

/// Fast timings so lifecycle tests finish in a few seconds
pub fn fast_settings() -> SupervisorSettings {
    SupervisorSettings {
        startup_grace_ms: 300,
        stop_timeout_ms: 3_000,
        hard_kill_delay_ms: 400,
        crash_retry: RetryConfig {
            max_retries: 3,
            delay_ms: 50,
            backoff: corewarden::BackoffKind::Fixed,
        },
        env: HashMap::new(),
        ..Default::default()
    }
}

pub fn supervisor<M: ProcessManager>(
    manager: Arc<M>,
    core: &FakeCore,
    settings: SupervisorSettings,
    events: EventBus,
) -> Supervisor<M> {
    let validator = Arc::new(ConfigValidator::new(manager.clone(), HashMap::new()));
    Supervisor::spawn(
        manager,
        Arc::new(ExistingBinary(core.binary.clone())),
        validator,
        settings,
        events,
    )
}

/// Observer keeping every event for later assertions
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<StatusEvent>>>,
}

impl Recorder {
    pub fn attach(events: &EventBus) -> Self {
        let recorder = Self::default();
        let sink = recorder.events.clone();
        events.subscribe(Arc::new(move |event: &StatusEvent| {
            sink.lock().unwrap().push(event.clone());
        }));
        recorder
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&StatusEvent) -> bool) -> usize {
        self.events().iter().filter(|event| predicate(event)).count()
    }

    /// Poll until an event matches or the timeout elapses
    pub async fn wait_for(
        &self,
        predicate: impl Fn(&StatusEvent) -> bool,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.events().iter().any(&predicate) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

/// Unix manager that records hard kill targets
#[derive(Default)]
pub struct CountingManager {
    inner: UnixProcessManager,
    pub force_kills: AtomicUsize,
    killed: Mutex<Vec<ProcessId>>,
}

impl CountingManager {
    pub fn force_kills(&self) -> usize {
        self.force_kills.load(Ordering::SeqCst)
    }

    pub fn killed_pids(&self) -> Vec<ProcessId> {
        self.killed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessLifecycle for CountingManager {
    type Handle = UnixProcessHandle;

    async fn spawn_process(
        &self,
        command: &Path,
        args: &[String],
        working_dir: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> std::io::Result<Self::Handle> {
        self.inner
            .spawn_process(command, args, working_dir, env)
            .await
    }
}

#[async_trait]
impl ProcessTermination for CountingManager {
    async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult {
        self.inner.terminate_gracefully(pid).await
    }

    async fn force_kill(&self, pid: ProcessId) -> TerminationResult {
        self.force_kills.fetch_add(1, Ordering::SeqCst);
        self.killed.lock().unwrap().push(pid);
        self.inner.force_kill(pid).await
    }
}

#[async_trait]
impl ProcessTreeProvider for CountingManager {
    async fn snapshot(&self) -> anyhow::Result<Vec<ProcessNode>> {
        self.inner.snapshot().await
    }
}

impl ProcessManager for CountingManager {
    fn new() -> Self {
        Self::default()
    }
}
