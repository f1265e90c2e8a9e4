//! Runs one shard's chunk plan through an open session.
//!
//! The [`ShardRunner`] owns nothing: it borrows the shard's session and the
//! run-wide reporter, executes the chunk in one of three [`ExecutionMode`]s
//! and returns the shard's [`ShardOutcome`]. Opening and closing the session
//! is the coordinator's job.
//!
//! # Execution Modes
//!
//! | Mode | Runs | Outcome |
//! |------|------|---------|
//! | [`Continuous`](ExecutionMode::Continuous) | one flow, again on every change, until cancelled | no counts, no summary |
//! | [`Suite`](ExecutionMode::Suite) | sequence flows, then independent flows | counts + summary |
//! | [`SingleFlow`](ExecutionMode::SingleFlow) | exactly one flow | counts only |

use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ShardError;
use crate::plan::{ExecutionPlan, FlowRef};
use crate::report::Reporter;
use crate::report::summary::{FlowResult, FlowStatus, ShardOutcome, SuiteResult, TestExecutionSummary};
use crate::session::DeviceSession;

/// How often continuous mode checks the flow file for changes.
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_millis(500);

/// How a shard executes its chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Watch one flow and re-run it whenever it changes.
    Continuous,
    /// Run every flow in the chunk and produce a summary.
    Suite,
    /// Run exactly one flow and fold pass/fail into counts.
    SingleFlow,
}

impl ExecutionMode {
    /// Picks the mode for a chunk.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError::ContinuousWithMultipleFlows`] if continuous
    /// mode is requested for anything but exactly one flow.
    pub fn select(chunk: &ExecutionPlan, continuous: bool, single_file_input: bool) -> Result<Self, ShardError> {
        if continuous {
            if chunk.flow_count() != 1 {
                return Err(ShardError::ContinuousWithMultipleFlows(chunk.flow_count()));
            }
            return Ok(ExecutionMode::Continuous);
        }
        if single_file_input && chunk.flow_count() == 1 {
            return Ok(ExecutionMode::SingleFlow);
        }
        Ok(ExecutionMode::Suite)
    }

    /// Failure classification reported when a shard in this mode fails.
    pub fn failure_kind(self) -> FailureKind {
        match self {
            ExecutionMode::Suite => FailureKind::MultiFlow,
            ExecutionMode::Continuous | ExecutionMode::SingleFlow => FailureKind::SingleFlow,
        }
    }
}

/// Whether a failed shard was running one flow or many.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    SingleFlow,
    MultiFlow,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::SingleFlow => write!(f, "single flow"),
            FailureKind::MultiFlow => write!(f, "multiple flows"),
        }
    }
}

/// Executes a chunk plan on one shard.
pub struct ShardRunner<'a, S, R> {
    shard_index: usize,
    session: &'a S,
    reporter: &'a R,
    cancel: CancellationToken,
    watch_interval: Duration,
}

impl<'a, S: DeviceSession, R: Reporter> ShardRunner<'a, S, R> {
    /// Creates a runner for `shard_index` over an open session.
    pub fn new(shard_index: usize, session: &'a S, reporter: &'a R) -> Self {
        Self {
            shard_index,
            session,
            reporter,
            cancel: CancellationToken::new(),
            watch_interval: DEFAULT_WATCH_INTERVAL,
        }
    }

    /// Sets the token that stops continuous mode and skips pending flows.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Sets how often continuous mode polls the flow file.
    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }

    /// Runs `chunk` in `mode`.
    ///
    /// Failing flows are counted in the outcome. `Err` means the session
    /// itself failed and the shard couldn't finish.
    pub async fn run(&self, chunk: &ExecutionPlan, mode: ExecutionMode) -> Result<ShardOutcome> {
        match mode {
            ExecutionMode::Continuous => self.run_continuous(first_flow(chunk)?).await,
            ExecutionMode::SingleFlow => {
                let flow = first_flow(chunk)?;
                let result = if self.cancel.is_cancelled() {
                    self.skip(flow).await
                } else {
                    self.run_one(flow).await?
                };
                Ok(ShardOutcome::single_flow(result.passed()))
            }
            ExecutionMode::Suite => self.run_suite(chunk).await,
        }
    }

    async fn run_one(&self, flow: &FlowRef) -> Result<FlowResult> {
        debug!(shard = self.shard_index, flow = %flow.name, "Running flow");
        let result = self
            .session
            .run_flow(flow)
            .await
            .with_context(|| format!("shard {} could not run {}", self.shard_index, flow.name))?;
        self.reporter.on_flow_complete(self.shard_index, &result).await;
        Ok(result)
    }

    async fn run_suite(&self, chunk: &ExecutionPlan) -> Result<ShardOutcome> {
        let start = Instant::now();
        let mut results = Vec::with_capacity(chunk.flow_count());

        let sequence = chunk.sequence();
        let mut sequence_failed = false;
        for flow in &sequence.flows {
            if self.cancel.is_cancelled() {
                results.push(self.skip(flow).await);
                continue;
            }
            let result = self.run_one(flow).await?;
            let passed = result.passed();
            results.push(result);
            if !passed && !sequence.continue_on_failure {
                warn!(
                    shard = self.shard_index,
                    "Sequential flow {} failed, skipping the remaining flows", flow.name
                );
                sequence_failed = true;
                break;
            }
        }

        if !sequence_failed {
            for flow in chunk.flows_to_run() {
                if self.cancel.is_cancelled() {
                    results.push(self.skip(flow).await);
                    continue;
                }
                results.push(self.run_one(flow).await?);
            }
        }

        let skipped = results.iter().filter(|r| r.status == FlowStatus::Canceled).count();
        if skipped > 0 {
            info!(shard = self.shard_index, skipped, "Run cancelled, remaining flows marked canceled");
        }

        let suite = SuiteResult::new(self.shard_index, self.session.device_id(), results, start.elapsed());
        Ok(ShardOutcome::from_summary(TestExecutionSummary::from_suites(vec![suite])))
    }

    /// Records a flow that never ran because the run was cancelled.
    async fn skip(&self, flow: &FlowRef) -> FlowResult {
        let result = FlowResult::new(flow, FlowStatus::Canceled, Duration::ZERO);
        self.reporter.on_flow_complete(self.shard_index, &result).await;
        result
    }

    async fn run_continuous(&self, flow: &FlowRef) -> Result<ShardOutcome> {
        info!("Watching {} for changes (Ctrl-C to stop)", flow.path.display());
        let mut last_hash = content_hash(&flow.path).await;

        loop {
            self.run_one(flow).await?;

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        debug!(shard = self.shard_index, "Continuous mode stopped");
                        return Ok(ShardOutcome::default());
                    }
                    _ = tokio::time::sleep(self.watch_interval) => {}
                }

                let hash = content_hash(&flow.path).await;
                if hash != last_hash {
                    info!("{} changed, re-running", flow.name);
                    last_hash = hash;
                    break;
                }
            }
        }
    }
}

fn first_flow(chunk: &ExecutionPlan) -> Result<&FlowRef> {
    chunk
        .all_flows()
        .next()
        .context("chunk plan contains no flows")
}

/// SHA-256 of the file's contents, `None` if it can't be read.
async fn content_hash(path: &Path) -> Option<Vec<u8>> {
    let bytes = tokio::fs::read(path).await.ok()?;
    Some(Sha256::digest(&bytes).to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{FlowSequence, WorkspaceConfig};
    use crate::report::NullReporter;
    use crate::session::{SessionError, SessionResult};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Fails every flow whose name starts with `bad`; errors on `broken`.
    struct ScriptedSession {
        ran: Mutex<Vec<String>>,
    }

    impl ScriptedSession {
        fn new() -> Self {
            Self { ran: Mutex::new(Vec::new()) }
        }

        fn ran(&self) -> Vec<String> {
            self.ran.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeviceSession for ScriptedSession {
        fn id(&self) -> &str {
            "scripted"
        }

        fn device_id(&self) -> &str {
            "emulator-5554"
        }

        fn port(&self) -> u16 {
            7001
        }

        async fn run_flow(&self, flow: &FlowRef) -> SessionResult<FlowResult> {
            self.ran.lock().unwrap().push(flow.name.clone());
            if flow.name == "broken" {
                return Err(SessionError::RunFailed {
                    flow: flow.name.clone(),
                    message: "driver crashed".to_string(),
                });
            }
            let status = if flow.name.starts_with("bad") {
                FlowStatus::Error
            } else {
                FlowStatus::Success
            };
            Ok(FlowResult::new(flow, status, Duration::from_millis(10)))
        }

        async fn close(&self) -> SessionResult<()> {
            Ok(())
        }
    }

    fn refs(names: &[&str]) -> Vec<FlowRef> {
        names.iter().map(|n| FlowRef::new(format!("flows/{}.yaml", n))).collect()
    }

    fn plan(sequence: &[&str], flows: &[&str], continue_on_failure: bool) -> ExecutionPlan {
        ExecutionPlan::new(
            refs(flows),
            FlowSequence::new(refs(sequence)).continue_on_failure(continue_on_failure),
            WorkspaceConfig::default(),
        )
    }

    #[test]
    fn test_select_mode() {
        let one = plan(&[], &["a"], false);
        let two = plan(&[], &["a", "b"], false);

        assert_eq!(ExecutionMode::select(&one, true, false).unwrap(), ExecutionMode::Continuous);
        assert_eq!(ExecutionMode::select(&one, false, true).unwrap(), ExecutionMode::SingleFlow);
        assert_eq!(ExecutionMode::select(&one, false, false).unwrap(), ExecutionMode::Suite);
        assert_eq!(ExecutionMode::select(&two, false, true).unwrap(), ExecutionMode::Suite);
        assert!(matches!(
            ExecutionMode::select(&two, true, false),
            Err(ShardError::ContinuousWithMultipleFlows(2))
        ));
    }

    #[tokio::test]
    async fn test_suite_runs_sequence_first() {
        let session = ScriptedSession::new();
        let runner = ShardRunner::new(2, &session, &NullReporter);

        let outcome = runner
            .run(&plan(&["login"], &["search", "bad_cart"], false), ExecutionMode::Suite)
            .await
            .unwrap();

        assert_eq!(session.ran(), vec!["login", "search", "bad_cart"]);
        assert_eq!(outcome.passed_count, Some(2));
        assert_eq!(outcome.total_count, Some(3));

        let summary = outcome.summary.unwrap();
        assert!(!summary.passed);
        assert_eq!(summary.suites[0].shard_index, 2);
        assert_eq!(summary.suites[0].device_id, "emulator-5554");
    }

    #[tokio::test]
    async fn test_sequence_failure_stops_suite() {
        let session = ScriptedSession::new();
        let runner = ShardRunner::new(0, &session, &NullReporter);

        let outcome = runner
            .run(&plan(&["bad_login", "profile"], &["search"], false), ExecutionMode::Suite)
            .await
            .unwrap();

        assert_eq!(session.ran(), vec!["bad_login"]);
        assert_eq!((outcome.passed_count, outcome.total_count), (Some(0), Some(1)));
    }

    #[tokio::test]
    async fn test_sequence_continue_on_failure() {
        let session = ScriptedSession::new();
        let runner = ShardRunner::new(0, &session, &NullReporter);

        let outcome = runner
            .run(&plan(&["bad_login", "profile"], &[], true), ExecutionMode::Suite)
            .await
            .unwrap();

        assert_eq!(session.ran(), vec!["bad_login", "profile"]);
        assert_eq!((outcome.passed_count, outcome.total_count), (Some(1), Some(2)));
    }

    #[tokio::test]
    async fn test_single_flow_has_no_summary() {
        let session = ScriptedSession::new();
        let runner = ShardRunner::new(0, &session, &NullReporter);

        let outcome = runner
            .run(&plan(&[], &["bad_checkout"], false), ExecutionMode::SingleFlow)
            .await
            .unwrap();

        assert_eq!(outcome, ShardOutcome::single_flow(false));
    }

    #[tokio::test]
    async fn test_session_error_escapes() {
        let session = ScriptedSession::new();
        let runner = ShardRunner::new(1, &session, &NullReporter);

        let err = runner
            .run(&plan(&[], &["a", "broken", "c"], false), ExecutionMode::Suite)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("shard 1"));
        assert_eq!(session.ran(), vec!["a", "broken"]);
    }

    #[tokio::test]
    async fn test_cancelled_suite_marks_pending_flows_canceled() {
        let session = ScriptedSession::new();
        let token = CancellationToken::new();
        token.cancel();
        let runner = ShardRunner::new(0, &session, &NullReporter).with_cancellation_token(token);

        let outcome = runner
            .run(&plan(&["login"], &["a", "b"], false), ExecutionMode::Suite)
            .await
            .unwrap();

        assert!(session.ran().is_empty());
        assert_eq!((outcome.passed_count, outcome.total_count), (Some(0), Some(3)));
        let summary = outcome.summary.unwrap();
        assert!(!summary.passed);
        assert!(summary.flows().all(|f| f.status == FlowStatus::Canceled));
    }

    #[tokio::test]
    async fn test_continuous_reruns_on_change_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watched.yaml");
        std::fs::write(&path, "appId: one").unwrap();
        let chunk = ExecutionPlan::new(
            vec![FlowRef::new(&path)],
            FlowSequence::default(),
            WorkspaceConfig::default(),
        );

        let session = ScriptedSession::new();
        let token = CancellationToken::new();
        let runner = ShardRunner::new(0, &session, &NullReporter)
            .with_cancellation_token(token.clone())
            .with_watch_interval(Duration::from_millis(20));

        let edit = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            std::fs::write(&path, "appId: two").unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        };

        let (outcome, ()) = tokio::join!(runner.run(&chunk, ExecutionMode::Continuous), edit);

        assert_eq!(outcome.unwrap(), ShardOutcome::default());
        assert_eq!(session.ran(), vec!["watched", "watched"]);
    }
}
