use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Subcommand the core binary runs under for normal operation.
pub const RUN_VERB: &str = "run";

/// Subcommand the core binary runs under to check a configuration without starting.
pub const CHECK_VERB: &str = "check";

/// Shape of the delay between retry attempts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum BackoffKind {
    /// Same delay before every retry
    Fixed,
    /// Delay grows with the retry number (retry × delay)
    Linear,
}

/// Configuration for bounded retry logic used throughout the application
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (0 means a single attempt)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between attempts (in milliseconds)
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    #[serde(default = "default_backoff")]
    pub backoff: BackoffKind,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_ms: default_delay_ms(),
            backoff: default_backoff(),
        }
    }
}

impl RetryConfig {
    /// Crash-loop policy: three restarts, fixed two second pause
    pub fn crash_loop() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 2_000,
            backoff: BackoffKind::Fixed,
        }
    }

    /// Download policy: three attempts in total, one second per attempt number
    pub fn download() -> Self {
        Self {
            max_retries: 2,
            delay_ms: 1_000,
            backoff: BackoffKind::Linear,
        }
    }

    /// Create a RetryConfig with no retries (fail fast)
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            delay_ms: 0,
            backoff: BackoffKind::Fixed,
        }
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_retries > 10 {
            return Err(anyhow::anyhow!(
                "max_retries should not exceed 10 to avoid excessive retries"
            ));
        }

        if self.delay_ms > 60_000 {
            return Err(anyhow::anyhow!("delay_ms should not exceed 60 seconds"));
        }

        Ok(())
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Check if retries are enabled (more than 1 attempt)
    pub fn retries_enabled(&self) -> bool {
        self.max_retries > 0
    }
}

/// Settings for the supervised core process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SupervisorSettings {
    /// A process that survives this window is considered started
    pub startup_grace_ms: u64,
    /// Upper bound on waiting for exit during a stop
    pub stop_timeout_ms: u64,
    /// Delay after the terminate signal before the hard kill
    pub hard_kill_delay_ms: u64,
    /// Number of recent log lines kept for diagnostics
    pub log_capacity: usize,
    pub crash_retry: RetryConfig,
    /// Compatibility environment passed to every core invocation
    pub env: HashMap<String, String>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_grace_ms: 1_500,
            stop_timeout_ms: 5_000,
            hard_kill_delay_ms: 800,
            log_capacity: 80,
            crash_retry: RetryConfig::crash_loop(),
            env: default_compat_env(),
        }
    }
}

impl SupervisorSettings {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn hard_kill_delay(&self) -> Duration {
        Duration::from_millis(self.hard_kill_delay_ms)
    }
}

/// Settings for locating, downloading and unpacking the core binary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallerSettings {
    pub install_dir: PathBuf,
    /// Executable file name, including the platform extension
    pub binary_name: String,
    /// Archive names are `{asset_prefix}-{version}-{os}-{arch}.{ext}`
    pub asset_prefix: String,
    /// Endpoint returning the latest release metadata
    pub release_feed_url: String,
    pub user_agent: String,
    pub max_redirects: u32,
    /// Progress is reported each time the download crosses a multiple of this percentage
    pub progress_step_percent: u8,
    pub connect_timeout_ms: u64,
    /// Longest silence tolerated while waiting for response headers or body data
    pub read_timeout_ms: u64,
    pub download_retry: RetryConfig,
}

impl Default for InstallerSettings {
    fn default() -> Self {
        Self {
            install_dir: PathBuf::from("core"),
            binary_name: default_binary_name(),
            asset_prefix: "sing-box".to_string(),
            release_feed_url: "https://api.github.com/repos/SagerNet/sing-box/releases/latest"
                .to_string(),
            user_agent: concat!("corewarden/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 5,
            progress_step_percent: 10,
            connect_timeout_ms: 15_000,
            read_timeout_ms: 30_000,
            download_retry: RetryConfig::download(),
        }
    }
}

impl InstallerSettings {
    /// Canonical location of the core executable
    pub fn binary_path(&self) -> PathBuf {
        self.install_dir.join(&self.binary_name)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Settings for the managed process-name rule fragment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleSettings {
    /// Outbound tag of the managed routing rule
    pub proxy_outbound: String,
    /// Resolver tag of the managed DNS rule
    pub dns_server: String,
}

impl Default for RuleSettings {
    fn default() -> Self {
        Self {
            proxy_outbound: "proxy".to_string(),
            dns_server: "remote".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorSettings {
    pub poll_interval_ms: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3_000,
        }
    }
}

impl MonitorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Main configuration for one supervised core
#[derive(Default, Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into))]
#[serde(rename_all = "camelCase")]
pub struct WardenConfig {
    /// The persisted core configuration document
    pub config_path: PathBuf,
    #[builder(default)]
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[builder(default)]
    #[serde(default)]
    pub installer: InstallerSettings,
    #[builder(default)]
    #[serde(default)]
    pub rules: RuleSettings,
    #[builder(default)]
    #[serde(default)]
    pub monitor: MonitorSettings,
}

impl WardenConfig {
    pub fn builder() -> WardenConfigBuilder {
        WardenConfigBuilder::default()
    }

    /// Reject settings that cannot produce a working supervisor
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.config_path.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("config_path must not be empty"));
        }
        if self.installer.binary_name.trim().is_empty() {
            return Err(anyhow::anyhow!("installer.binary_name must not be empty"));
        }
        if self.installer.progress_step_percent == 0 || self.installer.progress_step_percent > 100
        {
            return Err(anyhow::anyhow!(
                "installer.progress_step_percent must be between 1 and 100"
            ));
        }
        if self.installer.read_timeout_ms == 0 {
            return Err(anyhow::anyhow!("installer.read_timeout_ms must be positive"));
        }
        if self.supervisor.log_capacity == 0 {
            return Err(anyhow::anyhow!("supervisor.log_capacity must be positive"));
        }
        if self.monitor.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("monitor.poll_interval_ms must be positive"));
        }
        self.supervisor.crash_retry.validate()?;
        self.installer.download_retry.validate()?;
        Ok(())
    }
}

impl WardenConfigBuilder {
    pub fn install_dir<P: Into<PathBuf>>(&mut self, dir: P) -> &mut Self {
        let installer = self.installer.get_or_insert_with(InstallerSettings::default);
        installer.install_dir = dir.into();
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let supervisor = self
            .supervisor
            .get_or_insert_with(SupervisorSettings::default);
        supervisor.env.insert(key.to_string(), value.to_string());
        self
    }
}

// Default value functions for serde
fn default_max_retries() -> u32 {
    3
}
fn default_delay_ms() -> u64 {
    1_000
}
fn default_backoff() -> BackoffKind {
    BackoffKind::Fixed
}

fn default_binary_name() -> String {
    if cfg!(windows) {
        "sing-box.exe".to_string()
    } else {
        "sing-box".to_string()
    }
}

fn default_compat_env() -> HashMap<String, String> {
    [
        "ENABLE_DEPRECATED_SPECIAL_OUTBOUNDS",
        "ENABLE_DEPRECATED_LEGACY_DNS_SERVERS",
        "ENABLE_DEPRECATED_MISSING_DOMAIN_RESOLVER",
        "ENABLE_DEPRECATED_OUTBOUND_DNS_RULE_ITEM",
    ]
    .into_iter()
    .map(|key| (key.to_string(), "true".to_string()))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RetryConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.retries_enabled());
    }

    #[test]
    fn test_crash_loop_config() {
        let config = RetryConfig::crash_loop();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.delay(), Duration::from_secs(2));
        assert_eq!(config.backoff, BackoffKind::Fixed);
    }

    #[test]
    fn test_download_config() {
        let config = RetryConfig::download();
        assert_eq!(config.max_retries + 1, 3);
        assert_eq!(config.backoff, BackoffKind::Linear);
    }

    #[test]
    fn test_no_retry_config() {
        let config = RetryConfig::no_retry();
        assert!(config.validate().is_ok());
        assert!(!config.retries_enabled());
    }

    #[test]
    fn test_invalid_retry_config() {
        let mut config = RetryConfig {
            max_retries: 11,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.max_retries = 3;
        config.delay_ms = 120_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_helpers() {
        let config = WardenConfig::builder()
            .config_path("/tmp/config.json")
            .install_dir("/opt/core")
            .env("EXTRA_FLAG", "1")
            .build()
            .unwrap();

        assert_eq!(config.installer.install_dir, PathBuf::from("/opt/core"));
        assert_eq!(config.supervisor.env.get("EXTRA_FLAG").unwrap(), "1");
        // the compatibility defaults survive the custom setter
        assert!(
            config
                .supervisor
                .env
                .contains_key("ENABLE_DEPRECATED_SPECIAL_OUTBOUNDS")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_config_path() {
        let config = WardenConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_settings() {
        let json = r#"{
            "configPath": "core.json",
            "supervisor": { "startupGraceMs": 250 },
            "monitor": { "pollIntervalMs": 1000 }
        }"#;
        let config: WardenConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.supervisor.startup_grace(), Duration::from_millis(250));
        assert_eq!(config.supervisor.hard_kill_delay_ms, 800);
        assert_eq!(config.monitor.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.installer.max_redirects, 5);
        assert_eq!(config.installer.read_timeout(), Duration::from_secs(30));
        assert_eq!(config.rules.proxy_outbound, "proxy");
    }
}
