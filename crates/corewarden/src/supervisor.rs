//! Supervision of the single core process.
//!
//! [`Supervisor`] is a cloneable handle; all lifecycle work runs on one actor
//! task that drains a FIFO mailbox, so user calls, crash retries and
//! rule-triggered restarts never interleave.

mod actor;

use crate::error::SupervisorError;
use crate::installer::BinaryProvider;
use crate::validator::ConfigCheck;
use actor::{LifecycleCommand, SupervisorActor};
use corewarden_core::{
    CoreStatus, EventBus, LogLine, ProcessManager, Responder, SharedLogRing, SupervisorSettings,
    Ticket, ticket,
};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Handle to the supervisor actor
pub struct Supervisor<M: ProcessManager> {
    commands: mpsc::UnboundedSender<LifecycleCommand>,
    status: watch::Receiver<CoreStatus>,
    logs: SharedLogRing,
    _manager: PhantomData<fn() -> M>,
}

impl<M: ProcessManager> Clone for Supervisor<M> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            status: self.status.clone(),
            logs: self.logs.clone(),
            _manager: PhantomData,
        }
    }
}

impl<M: ProcessManager> Supervisor<M> {
    /// Spawn the actor on the current runtime and return its handle
    pub fn spawn(
        manager: Arc<M>,
        binaries: Arc<dyn BinaryProvider>,
        validator: Arc<dyn ConfigCheck>,
        settings: SupervisorSettings,
        events: EventBus,
    ) -> Self {
        let (commands, mailbox) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(CoreStatus::Stopped);
        let logs = SharedLogRing::new(settings.log_capacity);

        let actor = SupervisorActor::new(
            manager,
            binaries,
            validator,
            settings,
            events,
            status_tx,
            logs.clone(),
            commands.downgrade(),
        );
        tokio::spawn(actor.run(mailbox));

        Self {
            commands,
            status,
            logs,
            _manager: PhantomData,
        }
    }

    fn submit(
        &self,
        build: impl FnOnce(Responder<(), SupervisorError>) -> LifecycleCommand,
    ) -> Ticket<(), SupervisorError> {
        let (reply, ticket) = ticket();
        match self.commands.send(build(reply)) {
            Ok(()) => ticket,
            Err(_) => Ticket::closed(),
        }
    }

    /// Start the core with `config_path`; a no-op while it is already running
    pub fn start(&self, config_path: impl Into<PathBuf>) -> Ticket<(), SupervisorError> {
        let config = config_path.into();
        self.submit(|reply| LifecycleCommand::Start { config, reply })
    }

    /// Stop the core, escalating to a hard kill if it lingers
    pub fn stop(&self) -> Ticket<(), SupervisorError> {
        self.submit(|reply| LifecycleCommand::Stop {
            suppress_events: false,
            reply,
        })
    }

    /// Stop without publishing the stop transition, then start again, as one queued job
    pub fn restart(&self, config_path: impl Into<PathBuf>) -> Ticket<(), SupervisorError> {
        let config = config_path.into();
        self.submit(|reply| LifecycleCommand::Restart { config, reply })
    }

    /// Stop the core and end the actor; later calls resolve with `QueueClosed`
    pub fn shutdown(&self) -> Ticket<(), SupervisorError> {
        self.submit(|reply| LifecycleCommand::Shutdown { reply })
    }

    pub fn status(&self) -> CoreStatus {
        *self.status.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.status() == CoreStatus::Running
    }

    pub fn subscribe_status(&self) -> watch::Receiver<CoreStatus> {
        self.status.clone()
    }

    /// Recent output of the current (or last) core process, oldest first
    pub fn recent_logs(&self) -> Vec<LogLine> {
        self.logs.snapshot()
    }
}
