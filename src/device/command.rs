//! Device controller backed by shell command templates.
//!
//! Every operation maps to a command template from the `[device]` section of
//! the configuration. This keeps the orchestrator independent of any specific
//! device tool: the same controller drives `adb`, `xcrun simctl`,
//! `xcrun devicectl` or a custom wrapper script.
//!
//! # Placeholders
//!
//! | Template | Placeholders |
//! |----------|--------------|
//! | `list_command` | none; must print a JSON array of devices |
//! | `install_command` | `{device}`, `{app}` |
//! | `launch_command` | `{device}`, `{bundle_id}`, `{args}` |
//! | `process_list_command` | `{device}`; must print a JSON process listing |
//! | `terminate_command` | `{device}`, `{pid}`, `{bundle_id}` |
//!
//! # Process Listing Format
//!
//! `process_list_command` must print JSON shaped like `devicectl` output:
//!
//! ```json
//! {"result": {"runningProcesses": [
//!   {"processIdentifier": 412, "executable": "file:///.../Example.app/Example",
//!    "bundleIdentifier": "com.example.app"}
//! ]}}
//! ```
//!
//! A process matches when its `bundleIdentifier` equals the bundle id, or
//! when its `executable` path contains the bundle id.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{Device, DeviceController, DeviceError, DeviceResult, ProcessSpec};
use crate::config::DeviceToolConfig;
use crate::connector::{ConnectorError, ShellConnector, render_template};

/// A [`DeviceController`] that shells out to configured commands.
pub struct CommandDeviceController {
    config: DeviceToolConfig,
    connector: ShellConnector,
}

impl CommandDeviceController {
    /// Creates a controller whose calls are each bounded by `timeout`.
    pub fn new(config: DeviceToolConfig, timeout: Duration) -> Self {
        Self {
            config,
            connector: ShellConnector::new().with_timeout(timeout),
        }
    }

    /// Runs a tolerated operation: failures and timeouts are logged, never returned.
    async fn run_tolerated(&self, operation: &str, device_id: &str, shell_cmd: &str) {
        match self.connector.run(shell_cmd).await {
            Ok(result) if result.success() => {
                debug!("{} on {} succeeded", operation, device_id);
            }
            Ok(result) => {
                warn!(
                    "{} on {} failed with exit code {}: {}",
                    operation,
                    device_id,
                    result.exit_code,
                    result.stderr.trim()
                );
            }
            Err(ConnectorError::Timeout { secs, .. }) => {
                warn!(
                    "{} on {} timed out after {}s; process was terminated",
                    operation, device_id, secs
                );
            }
            Err(e) => {
                warn!("{} on {} failed: {}", operation, device_id, e);
            }
        }
    }

    /// Looks up the pid of the app, if it is running.
    async fn resolve_pid(&self, device_id: &str, bundle_id: &str) -> Option<u32> {
        let template = self.config.process_list_command.as_ref()?;
        let shell_cmd = render_template(template, &[("device", device_id)]);

        let result = match self.connector.run(&shell_cmd).await {
            Ok(result) if result.success() => result,
            Ok(result) => {
                warn!(
                    "Process listing on {} failed with exit code {}: {}",
                    device_id,
                    result.exit_code,
                    result.stderr.trim()
                );
                return None;
            }
            Err(e) => {
                warn!("Process listing on {} failed: {}", device_id, e);
                return None;
            }
        };

        match find_pid(&result.stdout, bundle_id) {
            Ok(pid) => pid,
            Err(e) => {
                warn!("Unreadable process listing from {}: {}", device_id, e);
                None
            }
        }
    }
}

#[async_trait]
impl DeviceController for CommandDeviceController {
    async fn list_connected(&self) -> DeviceResult<Vec<Device>> {
        let Some(template) = &self.config.list_command else {
            return Ok(Vec::new());
        };

        let result = self.connector.run(template).await.map_err(|e| match e {
            ConnectorError::Timeout { command, .. } => DeviceError::Timeout(command),
            other => DeviceError::ToolFailed(other.to_string()),
        })?;

        if !result.success() {
            return Err(DeviceError::ToolFailed(format!(
                "`{}` exited with code {}: {}",
                template,
                result.exit_code,
                result.stderr.trim()
            )));
        }

        serde_json::from_str(result.stdout.trim())
            .map_err(|e| DeviceError::ToolFailed(format!("Invalid device listing: {}", e)))
    }

    async fn install(&self, device_id: &str, app_path: &Path) -> DeviceResult<()> {
        let Some(template) = &self.config.install_command else {
            warn!("No install_command configured, skipping install on {}", device_id);
            return Ok(());
        };

        let app = app_path.to_string_lossy();
        let shell_cmd = render_template(template, &[("device", device_id), ("app", &app)]);
        info!("Installing {} on {}", app, device_id);
        self.run_tolerated("Install", device_id, &shell_cmd).await;
        Ok(())
    }

    async fn launch(&self, device_id: &str, spec: &ProcessSpec) -> DeviceResult<()> {
        let Some(template) = &self.config.launch_command else {
            warn!("No launch_command configured, skipping launch on {}", device_id);
            return Ok(());
        };

        let args = spec
            .args
            .iter()
            .map(|a| shell_words::quote(a).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        let shell_cmd = render_template(
            &template.replace("{args}", &args),
            &[("device", device_id), ("bundle_id", &spec.bundle_id)],
        );

        info!("Launching {} on {}", spec.bundle_id, device_id);
        if let Err(e) = self.connector.spawn_detached(&shell_cmd, &spec.log_path).await {
            warn!("Launch of {} on {} failed: {}", spec.bundle_id, device_id, e);
        }
        Ok(())
    }

    async fn terminate(&self, device_id: &str, bundle_id: &str) -> DeviceResult<()> {
        let Some(template) = &self.config.terminate_command else {
            debug!("No terminate_command configured, leaving {} running", bundle_id);
            return Ok(());
        };

        let pid = if template.contains("{pid}") {
            match self.resolve_pid(device_id, bundle_id).await {
                Some(pid) => Some(pid.to_string()),
                None => {
                    debug!("{} is not running on {}, nothing to terminate", bundle_id, device_id);
                    return Ok(());
                }
            }
        } else {
            None
        };

        let mut vars = vec![("device", device_id), ("bundle_id", bundle_id)];
        if let Some(pid) = pid.as_deref() {
            vars.push(("pid", pid));
        }
        let shell_cmd = render_template(template, &vars);

        info!("Terminating {} on {}", bundle_id, device_id);
        self.run_tolerated("Terminate", device_id, &shell_cmd).await;
        Ok(())
    }
}

#[derive(Deserialize)]
struct ProcessListing {
    result: ProcessListingResult,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessListingResult {
    #[serde(default)]
    running_processes: Vec<RunningProcess>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunningProcess {
    process_identifier: u32,
    executable: Option<String>,
    bundle_identifier: Option<String>,
}

/// Finds the pid of `bundle_id` in a JSON process listing.
fn find_pid(listing: &str, bundle_id: &str) -> Result<Option<u32>, serde_json::Error> {
    let listing: ProcessListing = serde_json::from_str(listing.trim())?;
    Ok(listing
        .result
        .running_processes
        .iter()
        .find(|p| {
            p.bundle_identifier.as_deref() == Some(bundle_id)
                || p.executable.as_deref().is_some_and(|e| e.contains(bundle_id))
        })
        .map(|p| p.process_identifier))
}
