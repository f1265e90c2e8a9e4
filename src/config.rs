//! Configuration loading and schema definitions for flowshard.
//!
//! This module provides types and functions for loading flowshard
//! configuration from TOML files or strings. See [`schema`] for every
//! section and its defaults.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads flowshard configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use flowshard::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("flowshard.toml"))?;
/// println!("Ports: {}-{}", config.flowshard.port_range_start, config.flowshard.port_range_end);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads flowshard configuration from a TOML string.
///
/// # Example
///
/// ```
/// use flowshard::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [cloud]
///     wait_timeout_mins = 30
/// "#)?;
///
/// assert_eq!(config.cloud.wait_timeout_mins, 30);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Starter configuration written by `flowshard init`.
pub const STARTER_CONFIG: &str = r#"[flowshard]
port_range_start = 7001
port_range_end = 7128
controller_timeout_secs = 10
flow_timeout_secs = 900

[workspace]
flows = ["flows"]
# sequence = ["login.yaml"]
# continue_on_failure = false
# platform = "android"

[device]
# Must print a JSON array: [{"id": "emulator-5554", "platform": "android"}]
list_command = "flow-runner devices --json"
# install_command = "adb -s {device} install -r {app}"
# launch_command = "adb -s {device} shell monkey -p {bundle_id} 1"
# process_list_command = "flow-runner processes --device {device} --json"
# terminate_command = "adb -s {device} shell kill {pid}"

[session]
run_command = "flow-runner test --device {device} --port {port} {flow}"

[app]
# path = "build/app.apk"
# bundle_id = "com.example.app"

[report]
output_dir = "test-results"
junit = true
"#;
