use crate::error::{InstallError, MonitorError, RuleError, SupervisorError};
use crate::factory::{PlatformProcessManager, create_process_manager};
use crate::installer::{Installer, ReleaseFeed};
use crate::monitor::ProcessTreeMonitor;
use crate::rules::{RuleUpdateCoordinator, RuleUpdateOutcome};
use crate::supervisor::Supervisor;
use crate::validator::ConfigValidator;
use anyhow::Result;
use corewarden_core::{
    CoreStatus, EventBus, LogLine, ProcessManager, StatusObserver, Ticket, WardenConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// One supervised core together with its installer, rule coordinator and
/// process-tree monitor.
///
/// Construction spawns the supervisor and rule workers, so it must happen
/// inside a tokio runtime.
pub struct CoreWarden<M: ProcessManager = PlatformProcessManager> {
    config: WardenConfig,
    events: EventBus,
    installer: Installer,
    validator: Arc<ConfigValidator<M>>,
    supervisor: Supervisor<M>,
    rules: RuleUpdateCoordinator,
    monitor: ProcessTreeMonitor,
}

impl CoreWarden<PlatformProcessManager> {
    /// Warden on the platform process manager, installing from the configured release feed
    pub fn new(config: WardenConfig) -> Result<Self> {
        Self::with_manager(config, create_process_manager())
    }
}

impl<M: ProcessManager> CoreWarden<M> {
    pub fn with_manager(config: WardenConfig, manager: Arc<M>) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new();
        let installer = Installer::new(config.installer.clone(), events.clone())?;
        Ok(Self::assemble(config, manager, events, installer))
    }

    pub fn with_feed(
        config: WardenConfig,
        manager: Arc<M>,
        feed: Arc<dyn ReleaseFeed>,
    ) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new();
        let installer = Installer::with_feed(config.installer.clone(), events.clone(), feed)?;
        Ok(Self::assemble(config, manager, events, installer))
    }

    fn assemble(
        config: WardenConfig,
        manager: Arc<M>,
        events: EventBus,
        installer: Installer,
    ) -> Self {
        let validator = Arc::new(ConfigValidator::new(
            manager.clone(),
            config.supervisor.env.clone(),
        ));
        let supervisor = Supervisor::spawn(
            manager.clone(),
            Arc::new(installer.clone()),
            validator.clone(),
            config.supervisor.clone(),
            events.clone(),
        );
        let rules = RuleUpdateCoordinator::spawn(
            supervisor.clone(),
            config.config_path.clone(),
            config.rules.clone(),
        );
        let monitor = ProcessTreeMonitor::new(
            manager,
            Arc::new(rules.clone()),
            events.clone(),
            config.monitor.poll_interval(),
        );

        info!(
            config = %config.config_path.display(),
            install_dir = %config.installer.install_dir.display(),
            "Core warden ready"
        );
        Self {
            config,
            events,
            installer,
            validator,
            supervisor,
            rules,
            monitor,
        }
    }

    /// Observers run synchronously on the emitting task
    pub fn subscribe(&self, observer: Arc<dyn StatusObserver>) {
        self.events.subscribe(observer);
    }

    pub async fn ensure_binary(&self) -> Result<PathBuf, InstallError> {
        self.installer.ensure_binary().await
    }

    /// Check the persisted configuration with the installed core
    pub async fn validate_config(&self) -> Result<(), SupervisorError> {
        let binary = self.installer.ensure_binary().await?;
        self.validator
            .validate(&binary, &self.config.config_path)
            .await?;
        Ok(())
    }

    pub fn start(&self) -> Ticket<(), SupervisorError> {
        self.supervisor.start(self.config.config_path.clone())
    }

    pub fn stop(&self) -> Ticket<(), SupervisorError> {
        self.supervisor.stop()
    }

    pub fn restart(&self) -> Ticket<(), SupervisorError> {
        self.supervisor.restart(self.config.config_path.clone())
    }

    pub fn status(&self) -> CoreStatus {
        self.supervisor.status()
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<CoreStatus> {
        self.supervisor.subscribe_status()
    }

    pub fn recent_logs(&self) -> Vec<LogLine> {
        self.supervisor.recent_logs()
    }

    pub fn update_process_names<I, S>(&self, names: I) -> Ticket<RuleUpdateOutcome, RuleError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.rules.update_process_names(names)
    }

    pub fn start_monitoring<I, S>(&self, session_id: &str, roots: I) -> Result<(), MonitorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.monitor.start_monitoring(session_id, roots)
    }

    pub fn stop_monitoring(&self) {
        self.monitor.stop_monitoring();
    }

    /// Stop monitoring and the core, then close the lifecycle queue
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.monitor.stop_monitoring();
        self.supervisor.shutdown().await
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn installer(&self) -> &Installer {
        &self.installer
    }

    pub fn supervisor(&self) -> &Supervisor<M> {
        &self.supervisor
    }

    pub fn monitor(&self) -> &ProcessTreeMonitor {
        &self.monitor
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::rules::SkipReason;

    fn config(dir: &std::path::Path) -> WardenConfig {
        WardenConfig::builder()
            .config_path(dir.join("config.json"))
            .install_dir(dir.join("core"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_rule_update_before_first_start_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let warden = CoreWarden::new(config(dir.path())).unwrap();

        let outcome = warden.update_process_names(["game.exe"]).await.unwrap();
        assert_eq!(outcome, RuleUpdateOutcome::Skipped(SkipReason::CoreNotRunning));
        assert_eq!(warden.status(), CoreStatus::Stopped);
        assert!(!dir.path().join("config.json").exists());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.monitor.poll_interval_ms = 0;
        assert!(CoreWarden::new(config).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_closes_lifecycle_queue() {
        let dir = tempfile::tempdir().unwrap();
        let warden = CoreWarden::new(config(dir.path())).unwrap();
        warden.start_monitoring("session", ["game.exe"]).unwrap();

        warden.shutdown().await.unwrap();
        assert!(!warden.monitor().is_monitoring());
        assert!(matches!(
            warden.stop().await,
            Err(SupervisorError::QueueClosed(_))
        ));
    }
}
