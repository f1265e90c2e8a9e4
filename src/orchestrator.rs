//! Sharded execution: planning, resource binding and the fan-out/fan-in run.
//!
//! # Architecture
//!
//! ```text
//!  ExecutionPlan            DeviceController
//!       │                          │ list_connected()
//!       │                          ▼
//!       │                   DeviceSelector ──► device_ids[0..n]
//!       │                          │
//!       ▼                          ▼
//!  ShardPartitioner ──────► Partition { effective_shards, chunks }
//!                                  │
//!             ┌────────────────────┼────────────────────┐
//!             ▼                    ▼                    ▼
//!        shard 0              shard 1              shard k-1      (join_all)
//!   PortAllocator.acquire  PortAllocator.acquire      ...
//!   open_session(dev, port)       ...
//!   ShardRunner.run(chunk)
//!   session.close()
//!             │                    │                    │
//!             └────────────────────┼────────────────────┘
//!                                  ▼
//!                      Vec<ShardOutcome> (shard order)
//!                                  │
//!                                  ▼
//!                          ResultAggregator ──► exit code + merged summary
//! ```
//!
//! # Failure Semantics
//!
//! Configuration and resource errors (conflicting modes, not enough
//! devices, ...) are raised before any shard starts. Once shards run, a
//! failing flow only counts against the tally. An error escaping a shard
//! (session can't open, runner crashes, panic) doesn't cancel its siblings;
//! the first such error by shard index is returned after every shard joined.
//!
//! # Example
//!
//! ```no_run
//! use flowshard::config::load_config;
//! use flowshard::device::CommandDeviceController;
//! use flowshard::orchestrator::{Orchestrator, RunOptions};
//! use flowshard::plan;
//! use flowshard::report::ConsoleReporter;
//! use flowshard::session::CommandSessionFactory;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("flowshard.toml"))?;
//!     let discovered = plan::discover(&config.workspace.flows, &config.workspace)?;
//!
//!     let controller =
//!         CommandDeviceController::new(config.device.clone(), config.flowshard.controller_timeout());
//!     let factory = CommandSessionFactory::new(config.session.clone());
//!     let orchestrator =
//!         Orchestrator::new(config, factory, controller, ConsoleReporter::new(false));
//!
//!     let result = orchestrator.run(&discovered.plan, &RunOptions::default()).await?;
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod partition;
pub mod ports;
pub mod runner;

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures::FutureExt;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::device::{DeviceController, DeviceError, DeviceSelector, Platform, ProcessSpec, WEB_DEVICE_ID};
use crate::plan::ExecutionPlan;
use crate::report::Reporter;
use crate::report::summary::{AggregateResult, ResultAggregator, ShardOutcome};
use crate::session::{DeviceSession, SessionConfig, SessionFactory};

pub use partition::{Partition, ShardMode, ShardPartitioner};
pub use ports::PortAllocator;
pub use runner::{ExecutionMode, FailureKind, ShardRunner};

/// Errors from planning or running a sharded run.
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    /// `--shard-split` and `--shard-all` were both given.
    #[error("Options --shard-split and --shard-all are mutually exclusive")]
    ConflictingShardModes,

    /// A shard count of zero was requested.
    #[error("Number of shards must be at least 1")]
    ZeroShards,

    /// Sharding was requested for a plan with sequential flows.
    #[error("Cannot run sharded tests with sequential execution")]
    ShardedSequence,

    /// Continuous mode needs exactly one flow.
    #[error("Continuous mode runs a single flow, but {0} flows were given")]
    ContinuousWithMultipleFlows(usize),

    /// The plan contains no flows.
    #[error("No flows to run")]
    NoFlows,

    /// More shards requested than devices connected.
    #[error("Not enough devices connected ({connected}) to run the requested number of shards ({requested})")]
    NotEnoughDevices { connected: usize, requested: usize },

    /// Every port in the range is already claimed.
    #[error("No free port left in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    /// Devices couldn't be selected.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// An error escaped a shard.
    #[error("Shard {shard} failed while running {mode}: {source:#}")]
    ShardFailed {
        shard: usize,
        mode: FailureKind,
        #[source]
        source: anyhow::Error,
    },
}

/// Per-run options, usually from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub mode: ShardMode,
    pub requested_shards: usize,
    /// Explicitly requested device ids; empty means "all connected".
    pub device_ids: Vec<String>,
    pub platform: Option<Platform>,
    pub continuous: bool,
    /// The input was one flow file rather than a directory.
    pub single_file_input: bool,
    pub pinned_port: Option<u16>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: ShardMode::None,
            requested_shards: 1,
            device_ids: Vec::new(),
            platform: None,
            continuous: false,
            single_file_input: false,
            pinned_port: None,
        }
    }
}

/// Result of a sharded run.
///
/// | Exit code | Meaning |
/// |-----------|---------|
/// | 0 | Every flow on every shard passed |
/// | 1 | At least one flow failed |
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Number of shards that ran.
    pub effective_shards: usize,

    /// Device bound to each shard.
    pub device_ids: Vec<String>,

    /// Non-fatal planning warnings.
    pub warnings: Vec<String>,

    /// One outcome per shard, in shard order.
    pub outcomes: Vec<ShardOutcome>,

    /// Merged counts and summary.
    pub aggregate: AggregateResult,

    /// Wall-clock duration of the run.
    pub duration: Duration,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.aggregate.success()
    }

    pub fn exit_code(&self) -> i32 {
        self.aggregate.exit_code()
    }
}

/// Coordinates a sharded run.
///
/// # Type Parameters
///
/// - `F`: session factory
/// - `C`: device controller
/// - `R`: reporter
pub struct Orchestrator<F, C, R> {
    config: Config,
    factory: F,
    controller: C,
    reporter: R,
    cancel: CancellationToken,
}

impl<F, C, R> Orchestrator<F, C, R>
where
    F: SessionFactory,
    C: DeviceController,
    R: Reporter,
{
    pub fn new(config: Config, factory: F, controller: C, reporter: R) -> Self {
        Self {
            config,
            factory,
            controller,
            reporter,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the token that stops the run (Ctrl-C).
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Plans, binds and runs `plan`, then aggregates and reports.
    ///
    /// # Errors
    ///
    /// Planning and device errors are returned before any shard starts.
    /// [`ShardError::ShardFailed`] is returned after all shards joined.
    pub async fn run(&self, plan: &ExecutionPlan, options: &RunOptions) -> Result<RunResult, ShardError> {
        let start = Instant::now();

        // Configuration errors come before any device interaction.
        ShardPartitioner::validate(plan, options.requested_shards)?;
        if options.continuous && plan.flow_count() != 1 {
            return Err(ShardError::ContinuousWithMultipleFlows(plan.flow_count()));
        }

        let web_only = plan.is_web_only() || options.platform == Some(Platform::Web);
        let connected = if web_only {
            Vec::new()
        } else {
            self.controller.list_connected().await?
        };
        let device_ids = DeviceSelector::select(plan, &options.device_ids, options.platform, &connected)?;

        let partition = ShardPartitioner::plan(plan, options.requested_shards, options.mode, device_ids.len())?;
        if options.pinned_port.is_some() && partition.effective_shards > 1 {
            warn!(
                "A fixed driver port is configured but {} shards will run; they will share it",
                partition.effective_shards
            );
        }

        info!(
            "Running {} flow(s) on {} shard(s)",
            plan.flow_count(),
            partition.effective_shards
        );
        self.reporter.on_plan(&partition, &device_ids).await;

        let outcomes = self
            .run_shards(partition.effective_shards, &device_ids, &partition.chunks, options)
            .await?;
        let aggregate = ResultAggregator::merge(&outcomes);

        let result = RunResult {
            effective_shards: partition.effective_shards,
            device_ids: device_ids[..partition.effective_shards].to_vec(),
            warnings: partition.warnings,
            outcomes,
            aggregate,
            duration: start.elapsed(),
        };
        self.reporter.on_run_complete(&result).await;
        Ok(result)
    }

    /// Runs one task per shard concurrently and returns outcomes in shard order.
    ///
    /// Shard `i` runs `chunk_plans[i]` on `device_ids[i]`.
    pub async fn run_shards(
        &self,
        effective_shards: usize,
        device_ids: &[String],
        chunk_plans: &[ExecutionPlan],
        options: &RunOptions,
    ) -> Result<Vec<ShardOutcome>, ShardError> {
        if device_ids.len() < effective_shards {
            return Err(ShardError::NotEnoughDevices {
                connected: device_ids.len(),
                requested: effective_shards,
            });
        }

        let modes = chunk_plans
            .iter()
            .take(effective_shards)
            .map(|chunk| ExecutionMode::select(chunk, options.continuous, options.single_file_input))
            .collect::<Result<Vec<_>, _>>()?;

        let ports = PortAllocator::new(self.config.flowshard.port_range_start..=self.config.flowshard.port_range_end);

        let shards = modes.iter().enumerate().map(|(shard, mode)| {
            let ports = &ports;
            async move {
                self.run_shard(shard, effective_shards, &device_ids[shard], &chunk_plans[shard], *mode, ports, options.pinned_port)
                    .await
                    .map_err(|source| ShardError::ShardFailed {
                        shard,
                        mode: mode.failure_kind(),
                        source,
                    })
            }
        });

        let results = join_all(shards).await;

        let mut outcomes = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!("{}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_shard(
        &self,
        shard: usize,
        effective_shards: usize,
        device_id: &str,
        chunk: &ExecutionPlan,
        mode: ExecutionMode,
        ports: &PortAllocator,
        pinned_port: Option<u16>,
    ) -> anyhow::Result<ShardOutcome> {
        let port = ports.acquire(effective_shards, pinned_port)?;
        self.reporter.on_shard_start(shard, device_id, port).await;

        self.prepare_app(shard, device_id).await;

        let session_config =
            SessionConfig::new(shard, self.config.flowshard.flow_timeout()).with_env(&chunk.workspace().env);
        let session = match self.factory.open_session(device_id, port, &session_config).await {
            Ok(session) => session,
            Err(e) => {
                self.terminate_app(device_id).await;
                return Err(e).with_context(|| format!("could not open a session on {} (port {})", device_id, port));
            }
        };

        let runner = ShardRunner::new(shard, &session, &self.reporter).with_cancellation_token(self.cancel.clone());
        let result = AssertUnwindSafe(runner.run(chunk, mode)).catch_unwind().await;

        if let Err(e) = session.close().await {
            warn!(shard, "Failed to close session {}: {}", session.id(), e);
        }
        self.terminate_app(device_id).await;

        match result {
            Ok(outcome) => outcome,
            Err(panic) => Err(anyhow::anyhow!("shard panicked: {}", panic_message(&*panic))),
        }
    }

    /// Installs and optionally launches the app. Failures are tolerated.
    async fn prepare_app(&self, shard: usize, device_id: &str) {
        if device_id == WEB_DEVICE_ID {
            return;
        }
        let app = &self.config.app;

        if let Some(path) = app.expanded_path()
            && let Err(e) = self.controller.install(device_id, &path).await
        {
            warn!(shard, "Install on {} failed: {}", device_id, e);
        }

        if app.launch
            && let Some(bundle_id) = &app.bundle_id
        {
            let log_path = self
                .config
                .report
                .output_dir
                .join("logs")
                .join(format!("shard-{}-launch.log", shard));
            let spec = app
                .launch_args
                .iter()
                .fold(ProcessSpec::new(bundle_id, log_path), |spec, arg| spec.arg(arg));
            if let Err(e) = self.controller.launch(device_id, &spec).await {
                warn!(shard, "Launch on {} failed: {}", device_id, e);
            }
        }
    }

    async fn terminate_app(&self, device_id: &str) {
        if device_id == WEB_DEVICE_ID {
            return;
        }
        if let Some(bundle_id) = &self.config.app.bundle_id
            && let Err(e) = self.controller.terminate(device_id, bundle_id).await
        {
            warn!("Terminate of {} on {} failed: {}", bundle_id, device_id, e);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
