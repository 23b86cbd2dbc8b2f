use crate::diagnostics::{clean_lines, diagnose};
use crate::error::ValidationError;
use async_trait::async_trait;
use corewarden_core::{CHECK_VERB, ProcessHandle, ProcessManager, ProcessOutput, pump_lines};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Seam between the supervisor and configuration checking
#[async_trait]
pub trait ConfigCheck: Send + Sync {
    async fn check(&self, binary: &Path, config: &Path) -> Result<(), ValidationError>;
}

/// Runs `<binary> check -c <config>` and turns a rejection into a diagnostic
pub struct ConfigValidator<M: ProcessManager> {
    manager: Arc<M>,
    env: HashMap<String, String>,
    timeout: Duration,
}

impl<M: ProcessManager> ConfigValidator<M> {
    pub fn new(manager: Arc<M>, env: HashMap<String, String>) -> Self {
        Self {
            manager,
            env,
            timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn validate(&self, binary: &Path, config: &Path) -> Result<(), ValidationError> {
        let args = vec![
            CHECK_VERB.to_string(),
            "-c".to_string(),
            config.to_string_lossy().into_owned(),
        ];
        debug!(binary = %binary.display(), config = %config.display(), "Checking core configuration");

        let mut handle = self
            .manager
            .spawn_process(binary, &args, binary.parent(), &self.env)
            .await
            .map_err(|e| ValidationError::Launch(format!("{}: {e}", binary.display())))?;
        let pid = handle.get_pid();
        let stdout = handle.take_stdout();
        let stderr = handle.take_stderr();
        let lines = Mutex::new(Vec::new());

        let finished = tokio::time::timeout(self.timeout, async {
            let (_, _, exit) = tokio::join!(
                collect(stdout, &lines),
                collect(stderr, &lines),
                handle.wait()
            );
            exit
        })
        .await;

        let exit = match finished {
            Ok(exit) => exit.map_err(|e| ValidationError::Launch(e.to_string()))?,
            Err(_) => {
                if let Some(pid) = pid {
                    self.manager.force_kill(pid).await;
                }
                return Err(ValidationError::Launch(format!(
                    "configuration check timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        if exit.success() {
            info!(config = %config.display(), "Core configuration is valid");
            return Ok(());
        }

        let raw = lines
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let output = clean_lines(raw.iter().map(String::as_str));
        let diagnostic = diagnose(exit.code, &output, "configuration check failed");
        warn!(
            exit_code = ?exit.code,
            summary = %diagnostic.summary,
            hints = diagnostic.hints.len(),
            "Core rejected configuration"
        );
        Err(ValidationError::Rejected(diagnostic))
    }
}

async fn collect(io: Option<ProcessOutput>, sink: &Mutex<Vec<String>>) {
    let Some(io) = io else {
        return;
    };
    let result = pump_lines(io, |line| {
        sink.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(line);
    })
    .await;
    if let Err(e) = result {
        debug!(error = %e, "Check output reader stopped early");
    }
}

#[async_trait]
impl<M: ProcessManager> ConfigCheck for ConfigValidator<M> {
    async fn check(&self, binary: &Path, config: &Path) -> Result<(), ValidationError> {
        self.validate(binary, config).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use corewarden_core::ProcessManager;
    use corewarden_unix::UnixProcessManager;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn fake_core(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-core");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn validator() -> ConfigValidator<UnixProcessManager> {
        let env = HashMap::from([("ENABLE_DEPRECATED_SPECIAL_OUTBOUNDS".to_string(), "true".to_string())]);
        ConfigValidator::new(Arc::new(UnixProcessManager::new()), env)
    }

    #[tokio::test]
    async fn test_valid_config_passes() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_core(
            dir.path(),
            r#"[ "$1" = "check" ] && [ "$2" = "-c" ] && [ -n "$3" ] || exit 9
[ "$ENABLE_DEPRECATED_SPECIAL_OUTBOUNDS" = "true" ] || exit 8
exit 0"#,
        );
        let result = validator().validate(&binary, &dir.path().join("config.json")).await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_rejection_produces_summary_and_hints() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_core(
            dir.path(),
            r#"echo "INFO[0000] loading"
printf '\033[31mFATAL\033[0m[0000] decode config: json: unknown field "tun_mtu"\n' >&2
exit 1"#,
        );

        let error = validator()
            .validate(&binary, &dir.path().join("config.json"))
            .await
            .unwrap_err();

        let ValidationError::Rejected(diagnostic) = error else {
            panic!("expected a rejection");
        };
        assert_eq!(diagnostic.exit_code, Some(1));
        assert_eq!(
            diagnostic.summary,
            r#"FATAL[0000] decode config: json: unknown field "tun_mtu""#
        );
        assert!(diagnostic.hints.iter().any(|h| h.contains("malformed")));
        assert_eq!(diagnostic.recent_logs.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let error = validator()
            .validate(&dir.path().join("absent"), &dir.path().join("config.json"))
            .await
            .unwrap_err();
        assert!(matches!(error, ValidationError::Launch(_)));
    }

    #[tokio::test]
    async fn test_hung_check_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_core(dir.path(), "exec sleep 30");
        let error = validator()
            .with_timeout(Duration::from_millis(200))
            .validate(&binary, &dir.path().join("config.json"))
            .await
            .unwrap_err();
        assert!(error.to_string().contains("timed out"));
    }
}
