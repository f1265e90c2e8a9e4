//! Shell command execution for out-of-process collaborators.
//!
//! Device tools (`adb`, `simctl`, `devicectl`, ...) and flow runners are
//! driven through user-configured command templates. The [`ShellConnector`]
//! runs a rendered template through `sh -c` with a hard timeout: child
//! processes are spawned with `kill_on_drop`, so an expired timeout
//! force-terminates the process instead of leaving it running.
//!
//! # Templates
//!
//! Templates use `{name}` placeholders. Values are shell-quoted before
//! substitution:
//!
//! ```
//! use flowshard::connector::render_template;
//!
//! let cmd = render_template(
//!     "runner --device {device} {flow}",
//!     &[("device", "emulator-5554"), ("flow", "flows/log in.yaml")],
//! );
//! assert_eq!(cmd, "runner --device emulator-5554 'flows/log in.yaml'");
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

/// Errors from running a shell command.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// The process could not be started.
    #[error("Failed to spawn `{command}`: {message}")]
    Spawn { command: String, message: String },

    /// The process didn't finish within the timeout and was killed.
    #[error("Command timed out after {secs}s: {command}")]
    Timeout { command: String, secs: u64 },

    /// I/O error while talking to the process.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a finished command.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code of the command, `-1` if killed by a signal.
    pub exit_code: i32,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,

    /// Wall-clock time the command took.
    pub duration: Duration,
}

impl ExecResult {
    /// Returns `true` if the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A single line of output from a streaming command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    /// A line from standard output.
    Stdout(String),
    /// A line from standard error.
    Stderr(String),
}

/// Callback invoked for each output line of a streaming command.
pub type OutputCallback = Arc<dyn Fn(&OutputLine) + Send + Sync>;

/// Runs shell commands with a timeout.
#[derive(Debug, Clone)]
pub struct ShellConnector {
    shell: String,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    timeout: Duration,
}

impl Default for ShellConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellConnector {
    /// Creates a connector using `/bin/sh` and a one hour timeout.
    pub fn new() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            working_dir: None,
            env: Vec::new(),
            timeout: Duration::from_secs(3600),
        }
    }

    /// Sets the per-command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the working directory for spawned commands.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds environment variables for spawned commands.
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Returns the configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn command(&self, shell_cmd: &str) -> tokio::process::Command {
        let mut process = tokio::process::Command::new(&self.shell);
        process.arg("-c").arg(shell_cmd);
        if let Some(dir) = &self.working_dir {
            process.current_dir(dir);
        }
        for (key, value) in &self.env {
            process.env(key, value);
        }
        process.kill_on_drop(true);
        process
    }

    fn timeout_error(&self, shell_cmd: &str) -> ConnectorError {
        ConnectorError::Timeout {
            command: shell_cmd.to_string(),
            secs: self.timeout.as_secs(),
        }
    }

    /// Runs a command to completion and captures its output.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Timeout`] if the command outlives the
    /// timeout (the process is killed), or [`ConnectorError::Spawn`] if it
    /// can't be started. A non-zero exit code is not an error.
    pub async fn run(&self, shell_cmd: &str) -> Result<ExecResult, ConnectorError> {
        debug!("Running: {}", shell_cmd);
        let start = Instant::now();

        let mut process = self.command(shell_cmd);
        process.stdout(Stdio::piped()).stderr(Stdio::piped());

        let child = process.spawn().map_err(|e| ConnectorError::Spawn {
            command: shell_cmd.to_string(),
            message: e.to_string(),
        })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| self.timeout_error(shell_cmd))??;

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        })
    }

    /// Runs a command, passing each output line to `callback` as it arrives.
    ///
    /// Output is also collected and returned in the [`ExecResult`].
    pub async fn run_streaming(
        &self,
        shell_cmd: &str,
        callback: Option<&OutputCallback>,
    ) -> Result<ExecResult, ConnectorError> {
        debug!("Streaming: {}", shell_cmd);
        let start = Instant::now();

        let mut process = self.command(shell_cmd);
        process.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = process.spawn().map_err(|e| ConnectorError::Spawn {
            command: shell_cmd.to_string(),
            message: e.to_string(),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| ConnectorError::Spawn {
            command: shell_cmd.to_string(),
            message: "stdout was not captured".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ConnectorError::Spawn {
            command: shell_cmd.to_string(),
            message: "stderr was not captured".to_string(),
        })?;

        let stdout_stream = tokio_stream::wrappers::LinesStream::new(BufReader::new(stdout).lines())
            .map(|line| OutputLine::Stdout(line.unwrap_or_default()));
        let stderr_stream = tokio_stream::wrappers::LinesStream::new(BufReader::new(stderr).lines())
            .map(|line| OutputLine::Stderr(line.unwrap_or_default()));
        let mut combined = stream::select(stdout_stream, stderr_stream);

        let collect = async {
            let mut out = String::new();
            let mut err = String::new();
            while let Some(line) = combined.next().await {
                if let Some(callback) = callback {
                    callback(&line);
                }
                match line {
                    OutputLine::Stdout(s) => {
                        out.push_str(&s);
                        out.push('\n');
                    }
                    OutputLine::Stderr(s) => {
                        err.push_str(&s);
                        err.push('\n');
                    }
                }
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out, err))
        };

        let (status, stdout, stderr) = tokio::time::timeout(self.timeout, collect)
            .await
            .map_err(|_| self.timeout_error(shell_cmd))??;

        Ok(ExecResult {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
            duration: start.elapsed(),
        })
    }

    /// Starts a command without waiting for it, redirecting its output to `log_path`.
    ///
    /// The spawned process outlives this call; it is not killed when the
    /// connector is dropped.
    pub async fn spawn_detached(&self, shell_cmd: &str, log_path: &Path) -> Result<(), ConnectorError> {
        debug!("Spawning detached: {} (log: {})", shell_cmd, log_path.display());

        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let log = std::fs::File::create(log_path)?;
        let log_err = log.try_clone()?;

        let mut process = self.command(shell_cmd);
        process
            .kill_on_drop(false)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        process.spawn().map_err(|e| ConnectorError::Spawn {
            command: shell_cmd.to_string(),
            message: e.to_string(),
        })?;

        Ok(())
    }
}

/// Substitutes `{name}` placeholders in `template` with shell-quoted values.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{}}}", name), &shell_words::quote(value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_render_template_quotes_values() {
        let rendered = render_template(
            "tool install {device} {app}",
            &[("device", "ABC-123"), ("app", "/tmp/My App.app")],
        );
        assert_eq!(rendered, "tool install ABC-123 '/tmp/My App.app'");
    }

    #[test]
    fn test_render_template_leaves_unknown_placeholders() {
        let rendered = render_template("tool {device} {other}", &[("device", "d1")]);
        assert_eq!(rendered, "tool d1 {other}");
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let connector = ShellConnector::new();
        let result = connector.run("echo hello; echo oops 1>&2; exit 3").await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.stderr.trim(), "oops");
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let connector = ShellConnector::new().with_timeout(Duration::from_millis(100));
        let err = connector.run("sleep 5").await.unwrap_err();
        assert!(matches!(err, ConnectorError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_run_streaming_invokes_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: OutputCallback = Arc::new(move |line: &OutputLine| {
            sink.lock().unwrap().push(line.clone());
        });

        let connector = ShellConnector::new();
        let result = connector
            .run_streaming("echo one; echo two", Some(&callback))
            .await
            .unwrap();

        assert!(result.success());
        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                OutputLine::Stdout("one".to_string()),
                OutputLine::Stdout("two".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let connector = ShellConnector::new().with_env([("FLOWSHARD_TEST_VAR", "42")]);
        let result = connector.run("echo $FLOWSHARD_TEST_VAR").await.unwrap();
        assert_eq!(result.stdout.trim(), "42");
    }
}
