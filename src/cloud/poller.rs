//! Upload status polling.
//!
//! [`CloudUploadPoller::wait`] drives one upload to completion as an explicit
//! state machine:
//!
//! ```text
//!            ok, not completed (sleep interval)
//!          +-------------------+
//!          v                   |
//!   --> Polling ---------------+---- ok, completed ----> Terminal
//!        |  ^  ^
//!   429  |  |  | sleep interval          elapsed >= wait_timeout
//!        v  |  |                            |
//!     Backoff  Retrying <-- 500/502/404     v
//!   (x1.25)    (bounded)                 TimedOut -- one final fetch --> return
//! ```
//!
//! Every other HTTP status, and any transport or decode failure, is fatal.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{CloudError, CloudFlowResult, CloudStatus, RunningFlow, StatusClient, UploadStatus};
use crate::config::CloudConfig;

const BACKOFF_MULTIPLIER: f64 = 1.25;

/// Callback receiving each terminal flow exactly once.
pub type FlowCallback = Box<dyn Fn(&CloudFlowResult) + Send + Sync>;

/// Timing and retry limits for one wait.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub min_poll_interval: Duration,
    pub wait_timeout: Duration,
    pub max_polling_retries: u32,
    pub fail_on_timeout: bool,
}

impl PollPolicy {
    pub fn from_config(config: &CloudConfig) -> Self {
        Self {
            min_poll_interval: Duration::from_millis(config.min_poll_interval_ms),
            wait_timeout: config.wait_timeout().unwrap_or(Duration::MAX),
            max_polling_retries: config.max_polling_retries,
            fail_on_timeout: config.fail_on_timeout,
        }
    }
}

/// States of the poll loop.
#[derive(Debug, Clone, PartialEq)]
pub enum PollState {
    Polling,
    Backoff,
    Retrying { status_code: u16 },
    TimedOut,
    Terminal(UploadStatus),
}

/// Counters for one wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub fetches: u32,
    pub backoffs: u32,
    pub retries: u32,
}

/// Interval and retry bookkeeping, separate from I/O.
#[derive(Debug, Clone)]
pub struct PollMachine {
    interval_ms: f64,
    retry_counter: u32,
    max_retries: u32,
    stats: PollStats,
}

impl PollMachine {
    pub fn new(policy: &PollPolicy) -> Self {
        Self {
            interval_ms: policy.min_poll_interval.as_secs_f64() * 1000.0,
            retry_counter: 0,
            max_retries: policy.max_polling_retries,
            stats: PollStats::default(),
        }
    }

    /// Current sleep between fetches.
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_ms / 1000.0)
    }

    pub fn retry_counter(&self) -> u32 {
        self.retry_counter
    }

    pub fn stats(&self) -> PollStats {
        self.stats
    }

    fn record_fetch(&mut self) {
        self.stats.fetches += 1;
    }

    /// Maps a failed fetch to the next state. Fatal errors pass through.
    pub fn classify(&self, err: CloudError) -> Result<PollState, CloudError> {
        match err {
            CloudError::Http { status: 429, .. } => Ok(PollState::Backoff),
            CloudError::Http {
                status: status @ (500 | 502 | 404),
                ..
            } => Ok(PollState::Retrying { status_code: status }),
            other => Err(other),
        }
    }

    /// Grows the interval and returns it. The growth is never reset.
    pub fn back_off(&mut self) -> Duration {
        self.interval_ms *= BACKOFF_MULTIPLIER;
        self.stats.backoffs += 1;
        self.interval()
    }

    /// Counts a retry and returns the (unchanged) interval to sleep, or the
    /// terminal error once the budget is spent.
    pub fn retry(&mut self, upload_id: &str, status_code: u16) -> Result<Duration, CloudError> {
        self.retry_counter += 1;
        if self.retry_counter > self.max_retries {
            return Err(CloudError::StatusFetchFailed {
                upload_id: upload_id.to_string(),
                status_code,
            });
        }
        self.stats.retries += 1;
        Ok(self.interval())
    }
}

/// Result of a completed or timed-out wait.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub status: UploadStatus,
    pub running_flows: Vec<RunningFlow>,
    pub timed_out: bool,
    pub fail_on_timeout: bool,
    pub stats: PollStats,
}

impl PollOutcome {
    pub fn exit_code(&self) -> i32 {
        if self.timed_out {
            return if self.fail_on_timeout { 1 } else { 0 };
        }
        if self.status.status == CloudStatus::Success { 0 } else { 1 }
    }
}

/// Polls one upload until it completes or the wait times out.
pub struct CloudUploadPoller<C> {
    client: C,
    auth_token: String,
    policy: PollPolicy,
    on_flow: Option<FlowCallback>,
}

impl<C: StatusClient> CloudUploadPoller<C> {
    pub fn new(client: C, auth_token: impl Into<String>, policy: PollPolicy) -> Self {
        Self {
            client,
            auth_token: auth_token.into(),
            policy,
            on_flow: None,
        }
    }

    pub fn with_flow_callback(mut self, callback: FlowCallback) -> Self {
        self.on_flow = Some(callback);
        self
    }

    /// Waits for `upload_id` to complete.
    ///
    /// A timeout is not an error: the outcome carries `timed_out` and the
    /// result of one final best-effort fetch.
    pub async fn wait(&self, upload_id: &str, project_id: &str) -> Result<PollOutcome, CloudError> {
        let started = Instant::now();
        let mut machine = PollMachine::new(&self.policy);
        let mut reported: HashSet<CloudFlowResult> = HashSet::new();
        let mut running: Vec<RunningFlow> = Vec::new();
        let mut state = PollState::Polling;
        let mut first_poll = true;

        loop {
            state = match state {
                PollState::Polling => {
                    if !first_poll && started.elapsed() >= self.policy.wait_timeout {
                        PollState::TimedOut
                    } else {
                        first_poll = false;
                        machine.record_fetch();
                        match self.client.fetch_status(&self.auth_token, upload_id, project_id).await {
                            Ok(status) => {
                                self.observe(&status, &mut reported, &mut running);
                                if status.completed {
                                    PollState::Terminal(status)
                                } else {
                                    debug!(upload_id, status = %status.status, "Upload still running");
                                    tokio::time::sleep(machine.interval()).await;
                                    PollState::Polling
                                }
                            }
                            Err(e) => machine.classify(e)?,
                        }
                    }
                }
                PollState::Backoff => {
                    let interval = machine.back_off();
                    warn!(upload_id, interval_ms = interval.as_millis() as u64, "Rate limited, backing off");
                    tokio::time::sleep(interval).await;
                    PollState::Polling
                }
                PollState::Retrying { status_code } => {
                    let interval = machine.retry(upload_id, status_code)?;
                    warn!(
                        upload_id,
                        status_code,
                        attempt = machine.retry_counter(),
                        "Status fetch failed, retrying"
                    );
                    tokio::time::sleep(interval).await;
                    PollState::Polling
                }
                PollState::TimedOut => {
                    warn!(upload_id, timeout_secs = self.policy.wait_timeout.as_secs(), "Timed out waiting for upload");
                    machine.record_fetch();
                    let status = match self.client.fetch_status(&self.auth_token, upload_id, project_id).await {
                        Ok(status) => {
                            self.observe(&status, &mut reported, &mut running);
                            status
                        }
                        Err(e) => {
                            warn!(upload_id, error = %e, "Final status fetch failed");
                            UploadStatus::unknown(upload_id)
                        }
                    };
                    return Ok(self.outcome(status, running, true, &machine));
                }
                PollState::Terminal(status) => {
                    info!(upload_id, status = %status.status, "Upload completed");
                    return Ok(self.outcome(status, running, false, &machine));
                }
            };
        }
    }

    /// Emits newly terminal flows and refreshes the running view.
    fn observe(&self, status: &UploadStatus, reported: &mut HashSet<CloudFlowResult>, running: &mut Vec<RunningFlow>) {
        for flow in &status.flows {
            if flow.status.is_terminal() && !reported.contains(flow) {
                info!(flow = %flow.name, status = %flow.status, "Flow finished");
                if let Some(callback) = &self.on_flow {
                    callback(flow);
                }
                reported.insert(flow.clone());
            }

            let view = RunningFlow::from(flow);
            match running.iter_mut().find(|r| r.name == flow.name) {
                Some(existing) => *existing = view,
                None => running.push(view),
            }
        }
    }

    fn outcome(&self, status: UploadStatus, running_flows: Vec<RunningFlow>, timed_out: bool, machine: &PollMachine) -> PollOutcome {
        PollOutcome {
            status,
            running_flows,
            timed_out,
            fail_on_timeout: self.policy.fail_on_timeout,
            stats: machine.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Replays scripted responses, then fails with a transport error.
    struct ScriptedClient {
        responses: Mutex<VecDeque<Result<UploadStatus, CloudError>>>,
        calls: Arc<Mutex<Vec<Instant>>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<UploadStatus, CloudError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl StatusClient for ScriptedClient {
        async fn fetch_status(&self, token: &str, _upload_id: &str, _project_id: &str) -> Result<UploadStatus, CloudError> {
            assert_eq!(token, "secret");
            self.calls.lock().unwrap().push(Instant::now());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(CloudError::Transport("connection refused".into())))
        }
    }

    fn policy() -> PollPolicy {
        PollPolicy {
            min_poll_interval: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(60),
            max_polling_retries: 3,
            fail_on_timeout: true,
        }
    }

    fn flow(name: &str, status: CloudStatus) -> CloudFlowResult {
        CloudFlowResult {
            name: name.into(),
            status,
            errors: vec![],
            total_time: Some(1000),
            start_time: None,
        }
    }

    fn upload(status: CloudStatus, completed: bool, flows: Vec<CloudFlowResult>) -> Result<UploadStatus, CloudError> {
        Ok(UploadStatus {
            upload_id: "up-1".into(),
            status,
            completed,
            flows,
            total_time: None,
            start_time: None,
        })
    }

    fn http(status: u16) -> Result<UploadStatus, CloudError> {
        Err(CloudError::Http {
            status,
            body: String::new(),
        })
    }

    fn recording_poller(client: ScriptedClient, policy: PollPolicy) -> (CloudUploadPoller<ScriptedClient>, Arc<Mutex<Vec<String>>>) {
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = emitted.clone();
        let poller = CloudUploadPoller::new(client, "secret", policy)
            .with_flow_callback(Box::new(move |f: &CloudFlowResult| sink.lock().unwrap().push(f.name.clone())));
        (poller, emitted)
    }

    #[test]
    fn test_backoff_grows_geometrically() {
        let mut machine = PollMachine::new(&PollPolicy {
            min_poll_interval: Duration::from_millis(1000),
            ..policy()
        });

        let mut expected = 1000.0_f64;
        for _ in 0..5 {
            expected *= 1.25;
            let interval = machine.back_off();
            assert!((interval.as_secs_f64() * 1000.0 - expected).abs() < 1e-6);
        }
        // 1000 * 1.25^5
        assert_eq!(machine.interval(), Duration::from_secs_f64(3.0517578125));
        assert_eq!(machine.stats().backoffs, 5);
    }

    #[test]
    fn test_retry_keeps_interval_and_is_bounded() {
        let mut machine = PollMachine::new(&policy());

        for attempt in 1..=3 {
            assert_eq!(machine.retry("up-1", 502).unwrap(), Duration::from_secs(10));
            assert_eq!(machine.retry_counter(), attempt);
        }
        let err = machine.retry("up-1", 502).unwrap_err();
        assert!(matches!(err, CloudError::StatusFetchFailed { status_code: 502, .. }));
    }

    #[test]
    fn test_classify() {
        let machine = PollMachine::new(&policy());
        assert_eq!(machine.classify(CloudError::Http { status: 429, body: String::new() }).unwrap(), PollState::Backoff);
        for code in [500, 502, 404] {
            assert_eq!(
                machine.classify(CloudError::Http { status: code, body: String::new() }).unwrap(),
                PollState::Retrying { status_code: code }
            );
        }
        assert!(machine.classify(CloudError::Http { status: 401, body: String::new() }).is_err());
        assert!(machine.classify(CloudError::Decode("bad".into())).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_once_then_success() {
        let client = ScriptedClient::new(vec![
            http(429),
            upload(CloudStatus::Success, true, vec![flow("login", CloudStatus::Success)]),
        ]);
        let calls = client.calls.clone();
        let (poller, emitted) = recording_poller(client, policy());

        let outcome = poller.wait("up-1", "proj-1").await.unwrap();

        assert_eq!(outcome.status.status, CloudStatus::Success);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(outcome.stats, PollStats { fetches: 2, backoffs: 1, retries: 0 });
        assert_eq!(*emitted.lock().unwrap(), vec!["login".to_string()]);

        let calls = calls.lock().unwrap();
        assert_eq!(calls[1] - calls[0], Duration::from_millis(12_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_backoffs_before_next_poll() {
        let client = ScriptedClient::new(vec![
            http(429),
            http(429),
            http(429),
            upload(CloudStatus::Success, true, vec![]),
        ]);
        let calls = client.calls.clone();
        let (poller, _) = recording_poller(
            client,
            PollPolicy {
                min_poll_interval: Duration::from_millis(1600),
                ..policy()
            },
        );

        poller.wait("up-1", "proj-1").await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls[1] - calls[0], Duration::from_millis(2000));
        assert_eq!(calls[2] - calls[1], Duration::from_millis(2500));
        assert_eq!(calls[3] - calls[2], Duration::from_millis(3125));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_flows_emitted_once() {
        let client = ScriptedClient::new(vec![
            upload(
                CloudStatus::Running,
                false,
                vec![flow("login", CloudStatus::Success), flow("checkout", CloudStatus::Running)],
            ),
            upload(
                CloudStatus::Running,
                false,
                vec![flow("login", CloudStatus::Success), flow("checkout", CloudStatus::Success)],
            ),
            upload(
                CloudStatus::Success,
                true,
                vec![flow("login", CloudStatus::Success), flow("checkout", CloudStatus::Success)],
            ),
        ]);
        let (poller, emitted) = recording_poller(client, policy());

        let outcome = poller.wait("up-1", "proj-1").await.unwrap();

        assert_eq!(*emitted.lock().unwrap(), vec!["login".to_string(), "checkout".to_string()]);
        assert_eq!(outcome.running_flows.len(), 2);
        assert_eq!(outcome.running_flows[1].status, CloudStatus::Success);
        assert_eq!(outcome.running_flows[1].duration, Some(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_makes_one_final_fetch() {
        let running = || upload(CloudStatus::Running, false, vec![flow("login", CloudStatus::Running)]);
        // Six polls fit in the 60s window; the final fetch then hits an empty
        // script and fails.
        let client = ScriptedClient::new((0..6).map(|_| running()).collect());
        let calls = client.calls.clone();
        let (poller, emitted) = recording_poller(client, policy());

        let outcome = poller.wait("up-1", "proj-1").await.unwrap();

        assert!(outcome.timed_out);
        assert_eq!(outcome.status.status, CloudStatus::Error);
        assert!(!outcome.status.completed);
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(outcome.stats.fetches, 7);
        assert_eq!(calls.lock().unwrap().len(), 7);
        assert!(emitted.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_fail_on_timeout_exits_zero() {
        let client = ScriptedClient::new(vec![
            upload(CloudStatus::Running, false, vec![]),
            upload(CloudStatus::Running, false, vec![flow("login", CloudStatus::Success)]),
        ]);
        let (poller, emitted) = recording_poller(
            client,
            PollPolicy {
                wait_timeout: Duration::from_secs(5),
                fail_on_timeout: false,
                ..policy()
            },
        );

        let outcome = poller.wait("up-1", "proj-1").await.unwrap();

        assert!(outcome.timed_out);
        assert_eq!(outcome.status.status, CloudStatus::Running);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(*emitted.lock().unwrap(), vec!["login".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let client = ScriptedClient::new(vec![http(500), http(500), http(500), http(500)]);
        let (poller, _) = recording_poller(client, policy());

        let err = poller.wait("up-1", "proj-1").await.unwrap_err();

        match err {
            CloudError::StatusFetchFailed { upload_id, status_code } => {
                assert_eq!(upload_id, "up-1");
                assert_eq!(status_code, 500);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_then_success() {
        let client = ScriptedClient::new(vec![
            http(502),
            http(404),
            upload(CloudStatus::Error, true, vec![flow("login", CloudStatus::Error)]),
        ]);
        let (poller, emitted) = recording_poller(client, policy());

        let outcome = poller.wait("up-1", "proj-1").await.unwrap();

        assert_eq!(outcome.stats.retries, 2);
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(*emitted.lock().unwrap(), vec!["login".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_is_fatal() {
        let client = ScriptedClient::new(vec![http(401)]);
        let calls = client.calls.clone();
        let (poller, _) = recording_poller(client, policy());

        let err = poller.wait("up-1", "proj-1").await.unwrap_err();

        assert!(matches!(err, CloudError::Http { status: 401, .. }));
        assert_eq!(calls.lock().unwrap().len(), 1);
    }
}
