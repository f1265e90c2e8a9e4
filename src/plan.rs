//! Execution plans: which flows run, and in what order.
//!
//! An [`ExecutionPlan`] is the immutable input to the orchestrator. It splits
//! flows into two disjoint groups:
//!
//! - **flows to run**: independent flows that may be distributed across shards
//! - **sequence**: flows that must run one after another, in order, on a
//!   single device
//!
//! Plans are normally produced by [`discover`] from paths on disk plus the
//! `[workspace]` section of the configuration, but they can also be built
//! directly with [`ExecutionPlan::new`].
//!
//! # Example
//!
//! ```
//! use flowshard::plan::{ExecutionPlan, FlowRef, FlowSequence, WorkspaceConfig};
//!
//! let plan = ExecutionPlan::new(
//!     vec![FlowRef::new("flows/search.yaml"), FlowRef::new("flows/cart.yaml")],
//!     FlowSequence::default(),
//!     WorkspaceConfig::default(),
//! );
//!
//! assert_eq!(plan.flow_count(), 2);
//! assert!(!plan.is_sequence_only());
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::device::Platform;

/// A reference to a single flow file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowRef {
    /// Path to the flow file.
    pub path: PathBuf,

    /// Display name, derived from the file stem.
    pub name: String,

    /// Platform the flow targets, when known.
    pub platform: Option<Platform>,
}

impl FlowRef {
    /// Creates a flow reference for the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        Self {
            path,
            name,
            platform: None,
        }
    }

    /// Tags the flow with a target platform.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Returns the file name (with extension) of the flow.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.name.clone())
    }
}

/// Flows that must run strictly in order on one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSequence {
    /// Flows in execution order.
    pub flows: Vec<FlowRef>,

    /// Keep running the remaining sequence after a failure.
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl FlowSequence {
    /// Creates a sequence that stops at the first failure.
    pub fn new(flows: Vec<FlowRef>) -> Self {
        Self {
            flows,
            continue_on_failure: false,
        }
    }

    /// Sets whether the sequence continues after a failed flow.
    pub fn continue_on_failure(mut self, value: bool) -> Self {
        self.continue_on_failure = value;
        self
    }
}

/// Workspace-level settings shared by every flow in a plan.
///
/// Loaded from the `[workspace]` section of `flowshard.toml`.
///
/// # Example
///
/// ```toml
/// [workspace]
/// flows = ["flows"]
/// sequence = ["onboarding.yaml", "login.yaml"]
/// continue_on_failure = false
/// platform = "android"
///
/// [workspace.env]
/// USERNAME = "qa@example.com"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Default paths searched for flows when none are given on the command line.
    #[serde(default)]
    pub flows: Vec<PathBuf>,

    /// File names of flows that run as an ordered sequence.
    #[serde(default)]
    pub sequence: Vec<String>,

    /// Keep running the sequence after a failed flow.
    #[serde(default)]
    pub continue_on_failure: bool,

    /// Platform every flow in the workspace targets, if fixed.
    pub platform: Option<Platform>,

    /// Environment passed to every flow execution.
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
}

/// An immutable description of the flows to execute.
///
/// Chunking a plan for sharding never mutates it; it produces new plans via
/// [`with_flows`](Self::with_flows).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    flows_to_run: Vec<FlowRef>,
    sequence: FlowSequence,
    workspace: WorkspaceConfig,
}

impl ExecutionPlan {
    /// Creates a plan from its parts.
    pub fn new(flows_to_run: Vec<FlowRef>, sequence: FlowSequence, workspace: WorkspaceConfig) -> Self {
        Self {
            flows_to_run,
            sequence,
            workspace,
        }
    }

    /// Independent flows that may be distributed across shards.
    pub fn flows_to_run(&self) -> &[FlowRef] {
        &self.flows_to_run
    }

    /// Flows that must run in order.
    pub fn sequence(&self) -> &FlowSequence {
        &self.sequence
    }

    /// Workspace configuration the plan was produced with.
    pub fn workspace(&self) -> &WorkspaceConfig {
        &self.workspace
    }

    /// Total number of flows, sequential and independent.
    pub fn flow_count(&self) -> usize {
        self.flows_to_run.len() + self.sequence.flows.len()
    }

    /// Returns `true` if the plan contains no flows at all.
    pub fn is_empty(&self) -> bool {
        self.flow_count() == 0
    }

    /// A plan with only sequential flows must run as exactly one shard.
    pub fn is_sequence_only(&self) -> bool {
        !self.sequence.flows.is_empty() && self.flows_to_run.is_empty()
    }

    /// Returns `true` if every flow targets the web platform.
    pub fn is_web_only(&self) -> bool {
        if self.workspace.platform == Some(Platform::Web) {
            return true;
        }
        !self.is_empty()
            && self
                .all_flows()
                .all(|flow| flow.platform == Some(Platform::Web))
    }

    /// Iterates sequence flows first, then independent flows.
    pub fn all_flows(&self) -> impl Iterator<Item = &FlowRef> {
        self.sequence.flows.iter().chain(self.flows_to_run.iter())
    }

    /// Returns a new plan with the same sequence and workspace but a different
    /// set of independent flows.
    pub fn with_flows(&self, flows_to_run: Vec<FlowRef>) -> Self {
        Self {
            flows_to_run,
            sequence: self.sequence.clone(),
            workspace: self.workspace.clone(),
        }
    }
}

/// Errors raised while building a plan from disk.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// A path given on the command line or in config doesn't exist.
    #[error("Flow path does not exist: {0}")]
    MissingPath(PathBuf),

    /// A flow named in `workspace.sequence` wasn't found among the discovered flows.
    #[error("Sequence flow '{0}' was not found among the discovered flows")]
    MissingSequenceFlow(String),

    /// Walking a flow directory failed.
    #[error("Failed to walk flow directory: {0}")]
    Walk(#[from] walkdir::Error),
}

/// A plan together with how it was requested.
#[derive(Debug, Clone)]
pub struct DiscoveredPlan {
    /// The plan itself.
    pub plan: ExecutionPlan,

    /// `true` when the input was exactly one flow file rather than a directory.
    pub single_file_input: bool,
}

/// Builds an execution plan from files and directories.
///
/// Files are taken as flows directly. Directories are searched recursively
/// for `.yaml` / `.yml` files, sorted by path. Flows whose file name appears
/// in `workspace.sequence` are moved into the sequence, in the configured
/// order; everything else runs independently.
///
/// # Errors
///
/// Returns [`PlanError::MissingPath`] for nonexistent paths and
/// [`PlanError::MissingSequenceFlow`] when a configured sequence flow can't
/// be found.
pub fn discover(paths: &[PathBuf], workspace: &WorkspaceConfig) -> Result<DiscoveredPlan, PlanError> {
    let mut flows = Vec::new();
    for path in paths {
        if !path.exists() {
            return Err(PlanError::MissingPath(path.clone()));
        }
        if path.is_dir() {
            collect_flow_files(path, &mut flows)?;
        } else {
            flows.push(path.clone());
        }
    }
    flows.sort();
    flows.dedup();

    let single_file_input = paths.len() == 1 && paths[0].is_file();

    let mut refs: Vec<FlowRef> = flows
        .into_iter()
        .map(|path| {
            let flow = FlowRef::new(path);
            match workspace.platform {
                Some(platform) => flow.with_platform(platform),
                None => flow,
            }
        })
        .collect();

    let mut sequence = Vec::with_capacity(workspace.sequence.len());
    for name in &workspace.sequence {
        let position = refs
            .iter()
            .position(|f| &f.file_name() == name || &f.name == name)
            .ok_or_else(|| PlanError::MissingSequenceFlow(name.clone()))?;
        sequence.push(refs.remove(position));
    }

    let plan = ExecutionPlan::new(
        refs,
        FlowSequence::new(sequence).continue_on_failure(workspace.continue_on_failure),
        workspace.clone(),
    );

    Ok(DiscoveredPlan {
        plan,
        single_file_input,
    })
}

fn collect_flow_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), walkdir::Error> {
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() && is_flow_file(entry.path()) {
            out.push(entry.into_path());
        }
    }
    Ok(())
}

fn is_flow_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}
