//! Corewarden Core - Platform-independent abstractions and configurations
//!
//! This crate provides the process traits, configuration, status events,
//! retry policy and log handling shared by the platform-specific process
//! managers and the orchestration crate.

mod config;
mod error;
mod events;
mod logs;
mod output;
mod process;
mod queue;
mod retry;

pub use config::*;
pub use error::*;
pub use events::*;
pub use logs::*;
pub use output::*;
pub use process::*;
pub use queue::*;
pub use retry::*;
