//! Configuration schema definitions for flowshard.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── FlowshardConfig       - Ports and timeouts
//! ├── WorkspaceConfig       - Flow locations, sequence, platform
//! ├── DeviceToolConfig      - Device controller command templates
//! ├── SessionCommandConfig  - Flow runner command templates
//! ├── AppConfig             - App to install/launch before flows run
//! ├── CloudConfig           - Cloud status polling policy
//! └── ReportConfig          - Output and reporting settings
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use crate::plan::WorkspaceConfig;

/// Root configuration structure for flowshard.
///
/// Every section is optional; missing sections take their defaults.
/// `[session].run_command` is required for local runs and checked by
/// [`Config::validate`].
///
/// # Example
///
/// ```
/// use flowshard::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [flowshard]
///     port_range_start = 8000
///     port_range_end = 8010
///
///     [session]
///     run_command = "flow-runner --device {device} --port {port} {flow}"
/// "#).unwrap();
///
/// assert_eq!(config.flowshard.port_range_end, 8010);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Core settings.
    #[serde(default)]
    pub flowshard: FlowshardConfig,

    /// Which flows run, and in what order.
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Device controller command templates.
    #[serde(default)]
    pub device: DeviceToolConfig,

    /// Flow runner command templates.
    #[serde(default)]
    pub session: SessionCommandConfig,

    /// App preparation.
    #[serde(default)]
    pub app: AppConfig,

    /// Cloud status polling.
    #[serde(default)]
    pub cloud: CloudConfig,

    /// Report configuration for output generation.
    #[serde(default)]
    pub report: ReportConfig,
}

/// Errors found by [`Config::validate`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid port range {start}..={end}: start must not exceed end")]
    InvalidPortRange { start: u16, end: u16 },

    #[error("[session].run_command must be set")]
    MissingRunCommand,

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    #[error("cloud.wait_timeout_mins is too large: {0}")]
    WaitTimeoutTooLarge(u64),
}

impl Config {
    /// Checks values that deserialize fine but can't be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let core = &self.flowshard;
        if core.port_range_start > core.port_range_end {
            return Err(ConfigError::InvalidPortRange {
                start: core.port_range_start,
                end: core.port_range_end,
            });
        }
        if self.session.run_command.trim().is_empty() {
            return Err(ConfigError::MissingRunCommand);
        }
        if core.controller_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("flowshard.controller_timeout_secs"));
        }
        if core.flow_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("flowshard.flow_timeout_secs"));
        }
        self.cloud.validate()
    }
}

/// Core flowshard settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `port_range_start` | 7001 |
/// | `port_range_end` | 7128 |
/// | `driver_port` | None |
/// | `controller_timeout_secs` | 10 |
/// | `flow_timeout_secs` | 900 (15 minutes) |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlowshardConfig {
    /// First port of the driver port range.
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// Last port of the driver port range (inclusive).
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Pins every shard to this driver port. Only meaningful for single-shard runs.
    pub driver_port: Option<u16>,

    /// Timeout for each device controller call.
    #[serde(default = "default_controller_timeout")]
    pub controller_timeout_secs: u64,

    /// Timeout for a single flow.
    #[serde(default = "default_flow_timeout")]
    pub flow_timeout_secs: u64,
}

impl Default for FlowshardConfig {
    fn default() -> Self {
        Self {
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            driver_port: None,
            controller_timeout_secs: default_controller_timeout(),
            flow_timeout_secs: default_flow_timeout(),
        }
    }
}

impl FlowshardConfig {
    pub fn controller_timeout(&self) -> Duration {
        Duration::from_secs(self.controller_timeout_secs)
    }

    pub fn flow_timeout(&self) -> Duration {
        Duration::from_secs(self.flow_timeout_secs)
    }
}

fn default_port_range_start() -> u16 {
    crate::orchestrator::ports::DEFAULT_PORT_RANGE_START
}

fn default_port_range_end() -> u16 {
    crate::orchestrator::ports::DEFAULT_PORT_RANGE_END
}

fn default_controller_timeout() -> u64 {
    10
}

fn default_flow_timeout() -> u64 {
    900 // 15 minutes
}

/// Command templates for the device controller.
///
/// See [`CommandDeviceController`](crate::device::CommandDeviceController)
/// for placeholders and output formats.
///
/// # Example
///
/// ```toml
/// [device]
/// list_command = "my-device-tool list --json"
/// install_command = "adb -s {device} install -r {app}"
/// launch_command = "adb -s {device} shell monkey -p {bundle_id} 1"
/// process_list_command = "my-device-tool processes --device {device} --json"
/// terminate_command = "adb -s {device} shell kill {pid}"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DeviceToolConfig {
    /// Prints the connected devices as a JSON array.
    pub list_command: Option<String>,

    /// Installs `{app}` on `{device}`.
    pub install_command: Option<String>,

    /// Launches `{bundle_id}` on `{device}` with `{args}`.
    pub launch_command: Option<String>,

    /// Prints running processes on `{device}` as JSON.
    pub process_list_command: Option<String>,

    /// Terminates `{pid}` (or `{bundle_id}`) on `{device}`.
    pub terminate_command: Option<String>,
}

/// Command templates for flow runner sessions.
///
/// See [`CommandSessionFactory`](crate::session::CommandSessionFactory).
///
/// # Example
///
/// ```toml
/// [session]
/// open_command = "flow-runner start-driver --device {device} --port {port}"
/// run_command = "flow-runner test --device {device} --port {port} {flow}"
/// close_command = "flow-runner stop-driver --port {port}"
/// stream_output = true
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SessionCommandConfig {
    /// Prepares a session; its last stdout line, if any, becomes `{session}`.
    pub open_command: Option<String>,

    /// Runs one flow.
    #[serde(default)]
    pub run_command: String,

    /// Tears a session down.
    pub close_command: Option<String>,

    /// Print runner output as it happens, prefixed with the device id.
    #[serde(default)]
    pub stream_output: bool,
}

impl SessionCommandConfig {
    /// Config with only a run command.
    pub fn with_run_command(run_command: impl Into<String>) -> Self {
        Self {
            run_command: run_command.into(),
            ..Default::default()
        }
    }
}

/// The app under test.
///
/// When `path` is set the app is installed on every shard's device before
/// the session opens; with `launch = true` it is also launched. When
/// `bundle_id` is set the app is terminated after each shard finishes.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Path to the app bundle / apk. `~` and `$VARS` are expanded.
    pub path: Option<String>,

    /// Bundle identifier / package name.
    pub bundle_id: Option<String>,

    /// Launch the app before running flows.
    #[serde(default)]
    pub launch: bool,

    /// Extra launch arguments.
    #[serde(default)]
    pub launch_args: Vec<String>,
}

impl AppConfig {
    /// The expanded app path, if configured.
    pub fn expanded_path(&self) -> Option<PathBuf> {
        self.path.as_deref().map(|p| match shellexpand::full(p) {
            Ok(expanded) => PathBuf::from(expanded.as_ref()),
            Err(_) => PathBuf::from(p),
        })
    }
}

/// Cloud status polling policy.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `api_url` | `https://api.flowshard.dev` |
/// | `min_poll_interval_ms` | 10000 |
/// | `wait_timeout_mins` | 60 |
/// | `max_polling_retries` | 3 |
/// | `fail_on_timeout` | true |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudConfig {
    /// Base URL of the cloud API.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Baseline sleep between status fetches.
    #[serde(default = "default_min_poll_interval")]
    pub min_poll_interval_ms: u64,

    /// Give up waiting after this many minutes.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_mins: u64,

    /// Retries allowed for 500/502/404 responses.
    #[serde(default = "default_max_polling_retries")]
    pub max_polling_retries: u32,

    /// Exit non-zero when the wait times out.
    #[serde(default = "default_true")]
    pub fail_on_timeout: bool,
}

impl CloudConfig {
    /// Checks the polling settings on their own, for commands that only talk to the cloud.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_poll_interval_ms == 0 {
            return Err(ConfigError::ZeroValue("cloud.min_poll_interval_ms"));
        }
        if self.wait_timeout().is_none() {
            return Err(ConfigError::WaitTimeoutTooLarge(self.wait_timeout_mins));
        }
        Ok(())
    }

    /// The wait timeout, `None` if the minutes overflow.
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_mins.checked_mul(60).map(Duration::from_secs)
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            min_poll_interval_ms: default_min_poll_interval(),
            wait_timeout_mins: default_wait_timeout(),
            max_polling_retries: default_max_polling_retries(),
            fail_on_timeout: true,
        }
    }
}

fn default_api_url() -> String {
    "https://api.flowshard.dev".to_string()
}

fn default_min_poll_interval() -> u64 {
    10_000
}

fn default_wait_timeout() -> u64 {
    60
}

fn default_max_polling_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

/// Report configuration.
///
/// # Example
///
/// ```toml
/// [report]
/// output_dir = "test-results"
/// junit = true
/// junit_file = "junit.xml"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory for reports and launch logs.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Write a JUnit XML report of the merged summary.
    #[serde(default = "default_true")]
    pub junit: bool,

    /// JUnit file name, relative to `output_dir`.
    #[serde(default = "default_junit_file")]
    pub junit_file: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            junit: true,
            junit_file: default_junit_file(),
        }
    }
}

impl ReportConfig {
    /// Full path of the JUnit file.
    pub fn junit_path(&self) -> PathBuf {
        self.output_dir.join(&self.junit_file)
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.flowshard.port_range_start, 7001);
        assert_eq!(config.flowshard.port_range_end, 7128);
        assert_eq!(config.flowshard.controller_timeout(), Duration::from_secs(10));
        assert_eq!(config.cloud.min_poll_interval_ms, 10_000);
        assert!(config.cloud.fail_on_timeout);
        assert_eq!(config.report.junit_path(), PathBuf::from("test-results/junit.xml"));
        assert_eq!(config.validate(), Err(ConfigError::MissingRunCommand));
    }

    #[test]
    fn test_full_config() {
        let config: Config = toml::from_str(
            r#"
            [flowshard]
            driver_port = 7555
            flow_timeout_secs = 120

            [workspace]
            flows = ["flows"]
            sequence = ["login.yaml"]
            continue_on_failure = true
            platform = "ios"

            [device]
            list_command = "tool list"

            [session]
            run_command = "runner {flow}"
            stream_output = true

            [app]
            path = "build/App.app"
            bundle_id = "com.example.app"
            launch = true

            [cloud]
            max_polling_retries = 5
            fail_on_timeout = false
            "#,
        )
        .unwrap();

        assert_eq!(config.flowshard.driver_port, Some(7555));
        assert_eq!(config.workspace.sequence, vec!["login.yaml"]);
        assert_eq!(config.workspace.platform, Some(crate::device::Platform::Ios));
        assert!(config.session.stream_output);
        assert_eq!(config.app.expanded_path(), Some(PathBuf::from("build/App.app")));
        assert_eq!(config.cloud.max_polling_retries, 5);
        assert!(!config.cloud.fail_on_timeout);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_port_range() {
        let mut config = Config::default();
        config.session.run_command = "runner {flow}".to_string();
        config.flowshard.port_range_start = 8000;
        config.flowshard.port_range_end = 7000;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidPortRange { start: 8000, end: 7000 })
        );
    }

    #[test]
    fn test_cloud_settings_are_checked() {
        let mut cloud = CloudConfig::default();
        assert!(cloud.validate().is_ok());
        assert_eq!(cloud.wait_timeout(), Some(Duration::from_secs(3600)));

        cloud.min_poll_interval_ms = 0;
        assert_eq!(cloud.validate(), Err(ConfigError::ZeroValue("cloud.min_poll_interval_ms")));

        cloud.min_poll_interval_ms = 10_000;
        cloud.wait_timeout_mins = u64::MAX;
        assert_eq!(cloud.wait_timeout(), None);
        assert_eq!(cloud.validate(), Err(ConfigError::WaitTimeoutTooLarge(u64::MAX)));
    }
}
