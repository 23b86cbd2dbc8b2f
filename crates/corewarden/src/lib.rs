//! Corewarden - supervision of an external proxy core for game acceleration.
//!
//! [`CoreWarden`] wires one installer, config validator, supervisor, rule
//! coordinator and process-tree monitor for an application session.

pub mod diagnostics;
pub mod error;
pub mod factory;
pub mod installer;
pub mod monitor;
pub mod rules;
pub mod supervisor;
pub mod validator;
mod warden;

pub use corewarden_core::*;
pub use error::{InstallError, MonitorError, RuleError, SupervisorError, ValidationError};
pub use factory::{PlatformProcessManager, PlatformProcessManagerFactory, create_process_manager};
pub use installer::{BinaryProvider, ExistingBinary, Installer, ReleaseFeed};
pub use monitor::{ProcessNameSet, ProcessTreeMonitor, detect_chain_proxy};
pub use rules::{ProcessNameSink, RuleUpdateCoordinator, RuleUpdateOutcome, SkipReason};
pub use supervisor::Supervisor;
pub use validator::{ConfigCheck, ConfigValidator};
pub use warden::CoreWarden;
