//! Device sessions: the scoped resource a shard runs its flows through.
//!
//! A session binds one device and one driver port for the lifetime of a
//! shard. Sessions are created by a [`SessionFactory`] and must be closed on
//! every exit path of the owning shard; the coordinator guarantees this.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     SessionFactory                          │
//! │                                                             │
//! │  open_session(device, port, config) ──────► DeviceSession   │
//! └────────────────────────────────────────────┼────────────────┘
//!                                              │
//!                                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      DeviceSession                          │
//! │                                                             │
//! │  run_flow(FlowRef) ───► FlowResult                          │
//! │  close()                                                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Factories
//!
//! | Factory | Module | Description |
//! |---------|--------|-------------|
//! | Command | [`command`] | Drives a flow runner through shell command templates |

pub mod command;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::plan::FlowRef;
use crate::report::summary::FlowResult;

pub use command::CommandSessionFactory;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur while opening, using or closing a session.
///
/// A flow that runs and fails is not an error: it is reported as a
/// [`FlowResult`] with an error status. These variants mean the session
/// itself is unusable.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session couldn't be established.
    #[error("Failed to open session on {device} (port {port}): {message}")]
    OpenFailed {
        device: String,
        port: u16,
        message: String,
    },

    /// A flow couldn't be started or its runner died unexpectedly.
    #[error("Failed to run flow {flow}: {message}")]
    RunFailed { flow: String, message: String },

    /// Tearing down the session failed.
    #[error("Failed to close session {0}")]
    CloseFailed(String),

    /// Provider-specific error not covered by other variants.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Per-shard session parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Shard the session belongs to.
    pub shard_index: usize,

    /// Environment passed to the flow runner.
    pub env: BTreeMap<String, String>,

    /// Upper bound for a single flow.
    pub flow_timeout: Duration,
}

impl SessionConfig {
    /// Creates a session config with no extra environment.
    pub fn new(shard_index: usize, flow_timeout: Duration) -> Self {
        Self {
            shard_index,
            env: BTreeMap::new(),
            flow_timeout,
        }
    }

    /// Adds environment variables.
    pub fn with_env(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

/// An open session on one device and port.
#[async_trait]
pub trait DeviceSession: Send + Sync {
    /// Session identifier, unique within the run.
    fn id(&self) -> &str;

    /// Device the session is bound to.
    fn device_id(&self) -> &str;

    /// Port the session's driver listens on.
    fn port(&self) -> u16;

    /// Runs one flow to completion.
    ///
    /// A failing flow is returned as a [`FlowResult`] with an error status;
    /// `Err` means the runner itself couldn't be driven.
    async fn run_flow(&self, flow: &FlowRef) -> SessionResult<FlowResult>;

    /// Releases the session. Called exactly once per opened session.
    async fn close(&self) -> SessionResult<()>;
}

/// Creates sessions.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// The session type this factory creates.
    type Session: DeviceSession;

    /// Opens a session bound to `device_id` and `port`.
    async fn open_session(&self, device_id: &str, port: u16, config: &SessionConfig)
    -> SessionResult<Self::Session>;
}
