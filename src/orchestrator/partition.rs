//! Shard planning: how many shards run, and what each one executes.
//!
//! # Modes
//!
//! | Mode | Effective shards | Chunk contents |
//! |------|------------------|----------------|
//! | [`Split`](ShardMode::Split) | `min(requested, flows)` | flow `j` goes to chunk `j % effective` |
//! | [`All`](ShardMode::All) | `min(requested, devices)` | every chunk gets every flow |
//! | [`None`](ShardMode::None) | like `Split`, requested defaults to 1 | |
//!
//! Plans with only sequential flows always run as one shard, whatever was
//! requested.
//!
//! # Example
//!
//! ```
//! use flowshard::orchestrator::{ShardMode, ShardPartitioner};
//! use flowshard::plan::{ExecutionPlan, FlowRef, FlowSequence, WorkspaceConfig};
//!
//! let flows = (0..10).map(|i| FlowRef::new(format!("flows/f{}.yaml", i))).collect();
//! let plan = ExecutionPlan::new(flows, FlowSequence::default(), WorkspaceConfig::default());
//!
//! let (mode, requested) = ShardMode::from_flags(Some(3), None).unwrap();
//! let partition = ShardPartitioner::plan(&plan, requested, mode, 3).unwrap();
//!
//! assert_eq!(partition.effective_shards, 3);
//! let sizes: Vec<_> = partition.chunks.iter().map(|c| c.flows_to_run().len()).collect();
//! assert_eq!(sizes, vec![4, 3, 3]);
//! ```

use std::fmt;

use tracing::{debug, warn};

use super::ShardError;
use crate::plan::{ExecutionPlan, FlowRef};

/// How flows are distributed across shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardMode {
    /// Partition flows across shards.
    Split,
    /// Replicate every flow on every shard.
    All,
    /// No sharding flag given.
    #[default]
    None,
}

impl ShardMode {
    /// Builds the mode and requested shard count from the two CLI flags.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError::ConflictingShardModes`] if both flags are set
    /// and [`ShardError::ZeroShards`] for a count of zero.
    pub fn from_flags(shard_split: Option<usize>, shard_all: Option<usize>) -> Result<(Self, usize), ShardError> {
        match (shard_split, shard_all) {
            (Some(_), Some(_)) => Err(ShardError::ConflictingShardModes),
            (Some(0), None) | (None, Some(0)) => Err(ShardError::ZeroShards),
            (Some(n), None) => Ok((ShardMode::Split, n)),
            (None, Some(n)) => Ok((ShardMode::All, n)),
            (None, None) => Ok((ShardMode::None, 1)),
        }
    }
}

impl fmt::Display for ShardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardMode::Split => write!(f, "split"),
            ShardMode::All => write!(f, "all"),
            ShardMode::None => write!(f, "none"),
        }
    }
}

/// The result of planning a sharded run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Number of shards that will actually run.
    pub effective_shards: usize,

    /// One chunk plan per shard, indexed by shard.
    pub chunks: Vec<ExecutionPlan>,

    /// Non-fatal warnings produced while planning.
    pub warnings: Vec<String>,
}

impl Partition {
    fn single(plan: &ExecutionPlan) -> Self {
        Self {
            effective_shards: 1,
            chunks: vec![plan.clone()],
            warnings: Vec::new(),
        }
    }
}

/// Computes effective shard counts and chunk plans.
pub struct ShardPartitioner;

impl ShardPartitioner {
    /// Plans a run of `plan` over `requested_shards` shards.
    ///
    /// # Errors
    ///
    /// - [`ShardError::ZeroShards`] if `requested_shards` is 0
    /// - [`ShardError::NoFlows`] if the plan is empty
    /// - [`ShardError::ShardedSequence`] if sharding is requested for a plan
    ///   that mixes sequential and independent flows
    /// - [`ShardError::NotEnoughDevices`] if more shards are requested than
    ///   devices are connected
    pub fn plan(
        plan: &ExecutionPlan,
        requested_shards: usize,
        mode: ShardMode,
        device_count: usize,
    ) -> Result<Partition, ShardError> {
        Self::validate(plan, requested_shards)?;
        if plan.is_sequence_only() {
            debug!("Sequence-only plan, running as a single shard");
            return Ok(Partition::single(plan));
        }
        if requested_shards > device_count {
            return Err(ShardError::NotEnoughDevices {
                connected: device_count,
                requested: requested_shards,
            });
        }

        let partition = match mode {
            ShardMode::All => {
                let effective = requested_shards.min(device_count);
                Partition {
                    effective_shards: effective,
                    chunks: vec![plan.clone(); effective],
                    warnings: Vec::new(),
                }
            }
            ShardMode::Split | ShardMode::None => Self::split(plan, requested_shards),
        };

        debug!(
            "Planned {} shard(s) in {} mode for {} flow(s)",
            partition.effective_shards,
            mode,
            plan.flow_count()
        );
        Ok(partition)
    }

    /// The checks of [`plan`](Self::plan) that don't depend on devices.
    ///
    /// # Errors
    ///
    /// [`ShardError::ZeroShards`], [`ShardError::NoFlows`] or
    /// [`ShardError::ShardedSequence`].
    pub fn validate(plan: &ExecutionPlan, requested_shards: usize) -> Result<(), ShardError> {
        if requested_shards == 0 {
            return Err(ShardError::ZeroShards);
        }
        if plan.is_empty() {
            return Err(ShardError::NoFlows);
        }
        if requested_shards > 1 && !plan.is_sequence_only() && !plan.sequence().flows.is_empty() {
            return Err(ShardError::ShardedSequence);
        }
        Ok(())
    }

    fn split(plan: &ExecutionPlan, requested_shards: usize) -> Partition {
        let flows = plan.flows_to_run();
        let effective = requested_shards.min(flows.len());

        let mut warnings = Vec::new();
        if requested_shards > effective {
            let message = format!(
                "Requested {} shards, but cannot use more than {} shards. Running with {} shards.",
                requested_shards, effective, effective
            );
            warn!("{}", message);
            warnings.push(message);
        }

        let mut buckets: Vec<Vec<FlowRef>> = vec![Vec::new(); effective];
        for (j, flow) in flows.iter().enumerate() {
            buckets[j % effective].push(flow.clone());
        }

        Partition {
            effective_shards: effective,
            chunks: buckets.into_iter().map(|b| plan.with_flows(b)).collect(),
            warnings,
        }
    }
}
