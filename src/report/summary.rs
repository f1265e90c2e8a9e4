//! Flow results, per-shard outcomes and their aggregation.
//!
//! Every shard produces exactly one [`ShardOutcome`]. The
//! [`ResultAggregator`] folds outcomes, in shard index order, into one
//! [`AggregateResult`] that decides the process exit code and carries the
//! merged [`TestExecutionSummary`] handed to reporters.
//!
//! ```text
//!  shard 0 ─► ShardOutcome { passed: 4, total: 4, summary: S0 } ─┐
//!  shard 1 ─► ShardOutcome { passed: 2, total: 3, summary: S1 } ─┼─► AggregateResult
//!  shard 2 ─► ShardOutcome { passed: 3, total: 3, summary: S2 } ─┘   { passed: 9, total: 10,
//!                                                                       summary: S0+S1+S2 }
//! ```
//!
//! Merging is associative: folding outcomes one at a time with
//! [`AggregateResult::absorb`] gives the same result as merging them all at
//! once.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::plan::FlowRef;

/// Final status of a single flow run on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlowStatus {
    /// Every step passed.
    Success,
    /// A step failed or the flow couldn't run.
    Error,
    /// Passed, but with non-fatal warnings.
    Warning,
    /// Canceled before completion.
    Canceled,
    /// Stopped by the user or the runner.
    Stopped,
}

impl FlowStatus {
    /// Returns `true` for statuses that count as a pass.
    pub fn is_passing(self) -> bool {
        matches!(self, FlowStatus::Success | FlowStatus::Warning)
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FlowStatus::Success => "SUCCESS",
            FlowStatus::Error => "ERROR",
            FlowStatus::Warning => "WARNING",
            FlowStatus::Canceled => "CANCELED",
            FlowStatus::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// Result of running one flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowResult {
    /// Flow name (file stem).
    pub name: String,

    /// Path of the flow file.
    pub file: PathBuf,

    /// Final status.
    pub status: FlowStatus,

    /// Failure description, if the flow didn't pass.
    pub failure: Option<String>,

    /// Wall-clock duration of the flow.
    pub duration: Duration,
}

impl FlowResult {
    /// Creates a result for `flow` with the given status and no failure text.
    pub fn new(flow: &FlowRef, status: FlowStatus, duration: Duration) -> Self {
        Self {
            name: flow.name.clone(),
            file: flow.path.clone(),
            status,
            failure: None,
            duration,
        }
    }

    /// Creates an [`FlowStatus::Error`] result carrying `failure`.
    pub fn error(flow: &FlowRef, failure: impl Into<String>, duration: Duration) -> Self {
        Self {
            failure: Some(failure.into()),
            ..Self::new(flow, FlowStatus::Error, duration)
        }
    }

    /// Attaches a failure description.
    pub fn with_failure(mut self, failure: impl Into<String>) -> Self {
        self.failure = Some(failure.into());
        self
    }

    /// Returns `true` if the flow passed.
    pub fn passed(&self) -> bool {
        self.status.is_passing()
    }
}

/// All flows one shard ran, on one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteResult {
    /// `true` if every flow passed.
    pub passed: bool,

    /// Individual flow results, in execution order.
    pub flows: Vec<FlowResult>,

    /// Wall-clock duration of the suite.
    pub duration: Duration,

    /// Device the suite ran on.
    pub device_id: String,

    /// Shard that produced the suite.
    pub shard_index: usize,
}

impl SuiteResult {
    /// Builds a suite result, deriving `passed` from the flows.
    pub fn new(shard_index: usize, device_id: impl Into<String>, flows: Vec<FlowResult>, duration: Duration) -> Self {
        Self {
            passed: flows.iter().all(FlowResult::passed),
            flows,
            duration,
            device_id: device_id.into(),
            shard_index,
        }
    }

    /// Number of passing flows.
    pub fn passed_count(&self) -> usize {
        self.flows.iter().filter(|f| f.passed()).count()
    }
}

/// Structured summary of one or more suites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestExecutionSummary {
    /// `true` if every suite passed.
    pub passed: bool,

    /// Suites, one per shard, in shard index order.
    pub suites: Vec<SuiteResult>,

    /// Number of passing flows across all suites.
    pub passed_count: usize,

    /// Number of flows across all suites.
    pub total_tests: usize,
}

impl TestExecutionSummary {
    /// Builds a summary from suites, computing the counts.
    pub fn from_suites(suites: Vec<SuiteResult>) -> Self {
        let passed_count = suites.iter().map(SuiteResult::passed_count).sum();
        let total_tests = suites.iter().map(|s| s.flows.len()).sum();
        Self {
            passed: suites.iter().all(|s| s.passed),
            suites,
            passed_count,
            total_tests,
        }
    }

    /// Merges another summary into this one: suites are concatenated,
    /// `passed` is AND-ed and counts are recomputed.
    pub fn merge(mut self, other: &TestExecutionSummary) -> Self {
        let passed = self.passed && other.passed;
        self.suites.extend(other.suites.iter().cloned());
        Self {
            passed,
            ..Self::from_suites(self.suites)
        }
    }

    /// Iterates all flow results across suites.
    pub fn flows(&self) -> impl Iterator<Item = &FlowResult> {
        self.suites.iter().flat_map(|s| s.flows.iter())
    }
}

/// What a single shard produced.
///
/// `None` counts and summary mark the continuous (watch) path; single-flow
/// runs carry counts but no summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardOutcome {
    pub passed_count: Option<usize>,
    pub total_count: Option<usize>,
    pub summary: Option<TestExecutionSummary>,
}

impl ShardOutcome {
    /// Outcome of a suite run, counts taken from the summary.
    pub fn from_summary(summary: TestExecutionSummary) -> Self {
        Self {
            passed_count: Some(summary.passed_count),
            total_count: Some(summary.total_tests),
            summary: Some(summary),
        }
    }

    /// Outcome of a single flow: pass/fail folded into counts, no summary.
    pub fn single_flow(passed: bool) -> Self {
        Self {
            passed_count: Some(usize::from(passed)),
            total_count: Some(1),
            summary: None,
        }
    }
}

/// Merged result of a sharded run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateResult {
    /// Number of passing flows across shards.
    pub passed: usize,

    /// Number of flows across shards.
    pub total: usize,

    /// Merged summary; `None` if no shard produced one.
    pub summary: Option<TestExecutionSummary>,
}

impl AggregateResult {
    /// Folds one more shard outcome into this result.
    pub fn absorb(mut self, outcome: &ShardOutcome) -> Self {
        self.passed += outcome.passed_count.unwrap_or(0);
        self.total += outcome.total_count.unwrap_or(0);
        self.summary = match (self.summary, &outcome.summary) {
            (Some(acc), Some(next)) => Some(acc.merge(next)),
            (None, Some(next)) => Some(next.clone()),
            (acc, None) => acc,
        };
        self
    }

    /// `true` when every flow in every shard passed.
    pub fn success(&self) -> bool {
        self.passed == self.total
    }

    /// Process exit code: `0` iff every flow passed.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// Merges shard outcomes into one result.
pub struct ResultAggregator;

impl ResultAggregator {
    /// Merges outcomes in the given (shard index) order.
    pub fn merge(outcomes: &[ShardOutcome]) -> AggregateResult {
        outcomes
            .iter()
            .fold(AggregateResult::default(), AggregateResult::absorb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(name: &str, status: FlowStatus) -> FlowResult {
        FlowResult::new(&FlowRef::new(format!("flows/{}.yaml", name)), status, Duration::from_secs(1))
    }

    fn outcome(shard: usize, statuses: &[FlowStatus]) -> ShardOutcome {
        let flows = statuses
            .iter()
            .enumerate()
            .map(|(i, s)| flow(&format!("s{}f{}", shard, i), *s))
            .collect();
        let suite = SuiteResult::new(shard, format!("device-{}", shard), flows, Duration::from_secs(3));
        ShardOutcome::from_summary(TestExecutionSummary::from_suites(vec![suite]))
    }

    #[test]
    fn test_merge_sums_counts() {
        let outcomes = vec![
            outcome(0, &[FlowStatus::Success, FlowStatus::Success]),
            outcome(1, &[FlowStatus::Success, FlowStatus::Error]),
        ];
        let merged = ResultAggregator::merge(&outcomes);
        assert_eq!(merged.passed, 3);
        assert_eq!(merged.total, 4);
        assert_eq!(merged.exit_code(), 1);

        let summary = merged.summary.unwrap();
        assert!(!summary.passed);
        assert_eq!(summary.suites.len(), 2);
        assert_eq!(summary.passed_count, 3);
        assert_eq!(summary.total_tests, 4);
        assert_eq!(summary.suites[1].shard_index, 1);
    }

    #[test]
    fn test_merge_all_passing_exits_zero() {
        let merged = ResultAggregator::merge(&[
            outcome(0, &[FlowStatus::Success]),
            outcome(1, &[FlowStatus::Warning]),
        ]);
        assert!(merged.success());
        assert_eq!(merged.exit_code(), 0);
        assert!(merged.summary.unwrap().passed);
    }

    #[test]
    fn test_merge_empty_has_no_summary() {
        let merged = ResultAggregator::merge(&[]);
        assert_eq!(merged, AggregateResult::default());
        assert!(merged.summary.is_none());
        assert_eq!(merged.exit_code(), 0);
    }

    #[test]
    fn test_merge_is_associative() {
        let a = outcome(0, &[FlowStatus::Success, FlowStatus::Error]);
        let b = ShardOutcome::single_flow(true);
        let c = outcome(2, &[FlowStatus::Success, FlowStatus::Canceled, FlowStatus::Success]);

        let folded = ResultAggregator::merge(&[a.clone(), b.clone()]).absorb(&c);
        let direct = ResultAggregator::merge(&[a, b, c]);

        assert_eq!(folded.passed, direct.passed);
        assert_eq!(folded.total, direct.total);
        assert_eq!(folded, direct);
    }

    #[test]
    fn test_single_flow_outcomes_fold_without_summary() {
        let merged = ResultAggregator::merge(&[ShardOutcome::single_flow(false)]);
        assert_eq!((merged.passed, merged.total), (0, 1));
        assert!(merged.summary.is_none());
        assert_eq!(merged.exit_code(), 1);
    }

    #[test]
    fn test_continuous_outcome_counts_nothing() {
        let merged = ResultAggregator::merge(&[ShardOutcome::default(), outcome(1, &[FlowStatus::Success])]);
        assert_eq!((merged.passed, merged.total), (1, 1));
    }

    #[test]
    fn test_flow_status_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&FlowStatus::Canceled).unwrap(), "\"CANCELED\"");
        assert!(!FlowStatus::Stopped.is_passing());
    }
}
