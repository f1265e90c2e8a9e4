//! Sessions driven by shell command templates.
//!
//! This factory lets flowshard drive any flow runner that can be invoked
//! from a shell. It uses three templates from the `[session]` section:
//!
//! 1. **open_command** (optional): prepares the device/driver, may print a
//!    session id as its last stdout line
//! 2. **run_command**: runs one flow
//! 3. **close_command** (optional): tears the session down
//!
//! Placeholders: `{device}`, `{port}`, `{session}`, and `{flow}` (run only).
//!
//! # Flow Status
//!
//! The flow status comes from the exit code of `run_command` (0 is success,
//! anything else is an error, stderr becomes the failure text). A runner can
//! report richer results by printing a JSON line on stdout; the last such
//! line wins:
//!
//! ```json
//! {"status": "WARNING", "failure": "optional message"}
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{DeviceSession, SessionConfig, SessionError, SessionFactory, SessionResult};
use crate::config::SessionCommandConfig;
use crate::connector::{ConnectorError, OutputCallback, OutputLine, ShellConnector, render_template};
use crate::plan::FlowRef;
use crate::report::summary::{FlowResult, FlowStatus};

/// JSON status line a flow runner may print.
#[derive(Deserialize)]
struct JsonFlowStatus {
    status: FlowStatus,
    #[serde(default)]
    failure: Option<String>,
}

/// Creates [`CommandSession`]s from command templates.
pub struct CommandSessionFactory {
    config: SessionCommandConfig,
    working_dir: Option<PathBuf>,
}

impl CommandSessionFactory {
    /// Creates a factory from the `[session]` configuration.
    pub fn new(config: SessionCommandConfig) -> Self {
        Self {
            config,
            working_dir: None,
        }
    }

    /// Runs all session commands from `dir`.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl SessionFactory for CommandSessionFactory {
    type Session = CommandSession;

    async fn open_session(
        &self,
        device_id: &str,
        port: u16,
        config: &SessionConfig,
    ) -> SessionResult<CommandSession> {
        let mut connector = ShellConnector::new()
            .with_timeout(config.flow_timeout)
            .with_env(config.env.clone())
            .with_env([
                ("FLOWSHARD_DEVICE", device_id.to_string()),
                ("FLOWSHARD_PORT", port.to_string()),
                ("FLOWSHARD_SHARD", config.shard_index.to_string()),
            ]);
        if let Some(dir) = &self.working_dir {
            connector = connector.with_working_dir(dir);
        }

        let mut id = format!("flowshard-{}-{}", uuid::Uuid::new_v4(), config.shard_index);
        let port_str = port.to_string();

        if let Some(template) = &self.config.open_command {
            let shell_cmd = render_template(
                template,
                &[("device", device_id), ("port", &port_str), ("session", &id)],
            );
            info!("Opening session on {} (port {})", device_id, port);

            let open_failed = |message: String| SessionError::OpenFailed {
                device: device_id.to_string(),
                port,
                message,
            };
            let result = connector
                .run(&shell_cmd)
                .await
                .map_err(|e| open_failed(e.to_string()))?;

            if !result.success() {
                return Err(open_failed(format!(
                    "open command exited with code {}: {}",
                    result.exit_code,
                    result.stderr.trim()
                )));
            }

            // Last stdout line, if any, is the session id.
            if let Some(remote_id) = result.stdout.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
                id = remote_id.to_string();
            }
        }

        debug!("Session {} bound to {}:{}", id, device_id, port);

        let output_callback = self.config.stream_output.then(|| {
            let prefix = device_id.to_string();
            let callback: OutputCallback = Arc::new(move |line: &OutputLine| match line {
                OutputLine::Stdout(s) => println!("[{}] {}", prefix, s),
                OutputLine::Stderr(s) => eprintln!("[{}] {}", prefix, s),
            });
            callback
        });

        Ok(CommandSession {
            id,
            device_id: device_id.to_string(),
            port,
            connector,
            run_command: self.config.run_command.clone(),
            close_command: self.config.close_command.clone(),
            output_callback,
        })
    }
}

/// A session whose flows are run through `run_command`.
pub struct CommandSession {
    id: String,
    device_id: String,
    port: u16,
    connector: ShellConnector,
    run_command: String,
    close_command: Option<String>,
    output_callback: Option<OutputCallback>,
}

impl CommandSession {
    fn render(&self, template: &str, flow: Option<&FlowRef>) -> String {
        let port = self.port.to_string();
        let flow_path = flow.map(|f| f.path.to_string_lossy().into_owned());
        let mut vars = vec![
            ("device", self.device_id.as_str()),
            ("port", port.as_str()),
            ("session", self.id.as_str()),
        ];
        if let Some(path) = flow_path.as_deref() {
            vars.push(("flow", path));
        }
        render_template(template, &vars)
    }
}

#[async_trait]
impl DeviceSession for CommandSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn port(&self) -> u16 {
        self.port
    }

    async fn run_flow(&self, flow: &FlowRef) -> SessionResult<FlowResult> {
        let shell_cmd = self.render(&self.run_command, Some(flow));
        debug!("Running {} on {}: {}", flow.name, self.device_id, shell_cmd);

        let result = match self
            .connector
            .run_streaming(&shell_cmd, self.output_callback.as_ref())
            .await
        {
            Ok(result) => result,
            Err(ConnectorError::Timeout { secs, .. }) => {
                warn!("Flow {} timed out on {} after {}s", flow.name, self.device_id, secs);
                return Ok(FlowResult::error(
                    flow,
                    format!("Flow timed out after {}s", secs),
                    self.connector.timeout(),
                ));
            }
            Err(e) => {
                return Err(SessionError::RunFailed {
                    flow: flow.name.clone(),
                    message: e.to_string(),
                });
            }
        };

        if let Some(json) = result
            .stdout
            .lines()
            .rev()
            .map(str::trim)
            .filter(|l| l.starts_with('{'))
            .find_map(|l| serde_json::from_str::<JsonFlowStatus>(l).ok())
        {
            let mut flow_result = FlowResult::new(flow, json.status, result.duration);
            flow_result.failure = json.failure;
            return Ok(flow_result);
        }

        if result.success() {
            Ok(FlowResult::new(flow, FlowStatus::Success, result.duration))
        } else {
            let stderr = result.stderr.trim();
            let failure = if stderr.is_empty() {
                format!("Flow runner exited with code {}", result.exit_code)
            } else {
                stderr.to_string()
            };
            Ok(FlowResult::error(flow, failure, result.duration))
        }
    }

    async fn close(&self) -> SessionResult<()> {
        let Some(template) = &self.close_command else {
            return Ok(());
        };

        let shell_cmd = self.render(template, None);
        info!("Closing session {} on {}", self.id, self.device_id);

        let result = self
            .connector
            .run(&shell_cmd)
            .await
            .map_err(|e| SessionError::CloseFailed(format!("{}: {}", self.id, e)))?;

        if !result.success() {
            return Err(SessionError::CloseFailed(format!(
                "{}: close command exited with code {}: {}",
                self.id,
                result.exit_code,
                result.stderr.trim()
            )));
        }
        Ok(())
    }
}
