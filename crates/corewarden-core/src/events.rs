use crate::error::{Diagnostic, FailureKind};
use crate::logs::LogLine;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// Lifecycle status of the supervised core process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl CoreStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, CoreStatus::Starting | CoreStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallPhase {
    Checking,
    Ready,
    Missing,
    Resolving,
    Downloading,
    Extracting,
    Completed,
    Failed,
}

impl InstallPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstallPhase::Ready | InstallPhase::Completed | InstallPhase::Failed
        )
    }
}

/// Snapshot of one installation attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallerState {
    pub phase: InstallPhase,
    pub install_dir: PathBuf,
    pub binary_path: PathBuf,
    pub version: Option<String>,
    pub progress_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub percent: Option<u8>,
    pub error: Option<String>,
}

impl InstallerState {
    pub fn new(install_dir: PathBuf, binary_path: PathBuf) -> Self {
        Self {
            phase: InstallPhase::Checking,
            install_dir,
            binary_path,
            version: None,
            progress_bytes: None,
            total_bytes: None,
            percent: None,
            error: None,
        }
    }
}

/// Runtime output lines worth surfacing on their own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RuntimeDiagnosticKind {
    RuleSet,
    Download,
}

/// Everything the core reports to the surrounding application
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StatusEvent {
    Installer(InstallerState),
    Status {
        status: CoreStatus,
    },
    Log(LogLine),
    RuntimeDiagnostic {
        kind: RuntimeDiagnosticKind,
        line: String,
    },
    Error {
        kind: FailureKind,
        diagnostic: Diagnostic,
        /// No further automatic attempt will follow
        terminal: bool,
    },
    ChainProxyDetected {
        session_id: String,
        names: Vec<String>,
    },
}

/// Receives status events synchronously, in emission order
pub trait StatusObserver: Send + Sync {
    fn on_event(&self, event: &StatusEvent);
}

impl<F> StatusObserver for F
where
    F: Fn(&StatusEvent) + Send + Sync,
{
    fn on_event(&self, event: &StatusEvent) {
        self(event)
    }
}

/// Fan-out of status events to registered observers
#[derive(Clone, Default)]
pub struct EventBus {
    observers: Arc<RwLock<Vec<Arc<dyn StatusObserver>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn StatusObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observer);
    }

    /// Observers are invoked after the registry lock is released, so a callback
    /// may subscribe further observers.
    pub fn emit(&self, event: StatusEvent) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for observer in observers {
            observer.on_event(&event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .observers
            .read()
            .map(|observers| observers.len())
            .unwrap_or_default();
        f.debug_struct("EventBus").field("observers", &count).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_emit_reaches_every_observer_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            bus.subscribe(Arc::new(move |event: &StatusEvent| {
                if let StatusEvent::Status { status } = event {
                    seen.lock().unwrap().push((tag, *status));
                }
            }));
        }

        bus.emit(StatusEvent::Status {
            status: CoreStatus::Running,
        });

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("first", CoreStatus::Running), ("second", CoreStatus::Running)]
        );
    }

    #[test]
    fn test_observer_may_subscribe_during_emit() {
        let bus = EventBus::new();
        let inner_bus = bus.clone();
        bus.subscribe(Arc::new(move |_: &StatusEvent| {
            inner_bus.subscribe(Arc::new(|_: &StatusEvent| {}));
        }));

        bus.emit(StatusEvent::Status {
            status: CoreStatus::Stopped,
        });
        assert_eq!(format!("{bus:?}"), "EventBus { observers: 2 }");
    }

    #[test]
    fn test_status_activity() {
        assert!(CoreStatus::Running.is_active());
        assert!(CoreStatus::Starting.is_active());
        assert!(!CoreStatus::Crashed.is_active());
        assert!(!CoreStatus::Stopped.is_active());
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = StatusEvent::Status {
            status: CoreStatus::Stopping,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["status"], "stopping");
    }
}
