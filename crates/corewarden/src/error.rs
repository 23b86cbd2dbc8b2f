use corewarden_core::{Diagnostic, FailureKind, QueueClosed};
use std::path::PathBuf;
use thiserror::Error;

/// Failures while locating, downloading or unpacking the core binary.
///
/// Cloneable so every caller coalesced onto one attempt receives the same error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstallError {
    /// DNS failure, refused/reset connection, timeout or a body cut short
    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("redirect limit of {limit} exceeded")]
    RedirectLimit { limit: u32 },

    #[error("redirect from {url} has no usable Location header")]
    BadRedirect { url: String },

    #[error("release {version} has no asset named {expected}")]
    AssetNotFound { version: String, expected: String },

    #[error("unsupported platform {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("invalid release metadata: {0}")]
    InvalidRelease(String),

    #[error("archive extraction failed: {0}")]
    Extract(String),

    #[error("executable {name} not found after extraction")]
    ExecutableMissing { name: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("installation task ended unexpectedly")]
    Interrupted,
}

impl InstallError {
    /// Check if this error is worth another download attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, InstallError::Network(_))
    }
}

impl From<reqwest::Error> for InstallError {
    fn from(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            return InstallError::HttpStatus {
                status: status.as_u16(),
                url: error.url().map(|u| u.to_string()).unwrap_or_default(),
            };
        }
        if error.is_decode() {
            return InstallError::InvalidRelease(error.to_string());
        }
        if error.is_connect() || error.is_timeout() || error.is_body() || error.is_request() {
            return InstallError::Network(error.to_string());
        }
        InstallError::Io(error.to_string())
    }
}

impl From<std::io::Error> for InstallError {
    fn from(error: std::io::Error) -> Self {
        InstallError::Io(error.to_string())
    }
}

/// Failures of `<binary> check -c <config>`
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// The core rejected the configuration
    #[error("{0}")]
    Rejected(Diagnostic),

    /// The check itself could not be run
    #[error("failed to run configuration check: {0}")]
    Launch(String),
}

impl ValidationError {
    pub fn diagnostic(&self) -> Diagnostic {
        match self {
            ValidationError::Rejected(diagnostic) => diagnostic.clone(),
            ValidationError::Launch(message) => Diagnostic::new(message.clone()),
        }
    }
}

/// Failures reported to callers of the supervisor
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SupervisorError {
    #[error("core binary unavailable: {0}")]
    Install(#[from] InstallError),

    #[error("configuration rejected: {0}")]
    ConfigInvalid(Diagnostic),

    #[error("failed to spawn core: {0}")]
    Spawn(Diagnostic),

    #[error("core exited during startup: {0}")]
    EarlyExit(Diagnostic),

    #[error(transparent)]
    QueueClosed(#[from] QueueClosed),
}

impl SupervisorError {
    /// Failure category, None for errors that are not failures of the core
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            SupervisorError::Install(_) => Some(FailureKind::InstallFailure),
            SupervisorError::ConfigInvalid(_) => Some(FailureKind::ConfigInvalid),
            SupervisorError::Spawn(_) => Some(FailureKind::SpawnFailure),
            SupervisorError::EarlyExit(_) => Some(FailureKind::EarlyExit),
            SupervisorError::QueueClosed(_) => None,
        }
    }

    pub fn diagnostic(&self) -> Diagnostic {
        match self {
            SupervisorError::ConfigInvalid(d)
            | SupervisorError::Spawn(d)
            | SupervisorError::EarlyExit(d) => d.clone(),
            other => Diagnostic::new(other.to_string()),
        }
    }
}

impl From<ValidationError> for SupervisorError {
    fn from(error: ValidationError) -> Self {
        SupervisorError::ConfigInvalid(error.diagnostic())
    }
}

/// Failures while rewriting the managed rule fragment
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unexpected configuration shape at {0}")]
    Shape(&'static str),

    #[error(transparent)]
    QueueClosed(#[from] QueueClosed),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    #[error("session id must not be empty")]
    EmptySessionId,

    #[error("process tree snapshot failed: {0}")]
    Snapshot(String),
}
