//! Cloud-delegated runs: upload status types, the status client seam and the
//! upload poller.

pub mod client;
pub mod poller;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plan::FlowRef;
use crate::report::summary::{FlowResult, FlowStatus, SuiteResult, TestExecutionSummary};

pub use client::HttpStatusClient;
pub use poller::{CloudUploadPoller, PollMachine, PollOutcome, PollPolicy, PollState, PollStats};

/// Errors talking to the cloud status endpoint.
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Failed to decode upload status: {0}")]
    Decode(String),

    #[error("Failed to fetch status for upload {upload_id} (HTTP {status_code}), retries exhausted")]
    StatusFetchFailed { upload_id: String, status_code: u16 },
}

/// Status of an upload or of a single flow within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CloudStatus {
    Pending,
    Running,
    Canceled,
    Stopped,
    Success,
    Error,
}

impl CloudStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Canceled | Self::Stopped | Self::Success | Self::Error)
    }
}

impl std::fmt::Display for CloudStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Canceled => "CANCELED",
            Self::Stopped => "STOPPED",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// One flow as reported by the status endpoint.
///
/// Compared by full value: a flow whose errors or timing change between
/// polls counts as a different result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudFlowResult {
    pub name: String,
    pub status: CloudStatus,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Milliseconds.
    #[serde(default)]
    pub total_time: Option<u64>,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub start_time: Option<i64>,
}

/// Response body of the upload status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub upload_id: String,
    pub status: CloudStatus,
    pub completed: bool,
    #[serde(default)]
    pub flows: Vec<CloudFlowResult>,
    #[serde(default)]
    pub total_time: Option<u64>,
    #[serde(default)]
    pub start_time: Option<i64>,
}

impl UploadStatus {
    /// Status used when the final fetch after a timeout fails.
    pub fn unknown(upload_id: impl Into<String>) -> Self {
        Self {
            upload_id: upload_id.into(),
            status: CloudStatus::Error,
            completed: false,
            flows: Vec::new(),
            total_time: None,
            start_time: None,
        }
    }
}

/// Locally tracked view of a flow, kept up to date across polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningFlow {
    pub name: String,
    pub status: CloudStatus,
    pub duration: Option<Duration>,
    pub start_time: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
}

impl From<&CloudFlowResult> for RunningFlow {
    fn from(flow: &CloudFlowResult) -> Self {
        Self {
            name: flow.name.clone(),
            status: flow.status,
            duration: flow.total_time.map(Duration::from_millis),
            start_time: flow.start_time.and_then(DateTime::<Utc>::from_timestamp_millis),
            errors: flow.errors.clone(),
        }
    }
}

/// Builds a one-suite summary from the running-flow view, for JUnit output.
///
/// Flows that never reached a terminal status are reported as canceled.
pub fn running_flows_summary(upload_id: &str, flows: &[RunningFlow]) -> TestExecutionSummary {
    let results: Vec<FlowResult> = flows
        .iter()
        .map(|flow| {
            let status = match flow.status {
                CloudStatus::Success => FlowStatus::Success,
                CloudStatus::Error => FlowStatus::Error,
                CloudStatus::Stopped => FlowStatus::Stopped,
                CloudStatus::Canceled | CloudStatus::Pending | CloudStatus::Running => FlowStatus::Canceled,
            };
            let flow_ref = FlowRef {
                name: flow.name.clone(),
                ..FlowRef::new(&flow.name)
            };
            let result = FlowResult::new(&flow_ref, status, flow.duration.unwrap_or_default());
            if flow.errors.is_empty() {
                result
            } else {
                result.with_failure(flow.errors.join("\n"))
            }
        })
        .collect();

    let duration = results.iter().map(|r| r.duration).sum();
    TestExecutionSummary::from_suites(vec![SuiteResult::new(0, upload_id, results, duration)])
}

/// Fetches the status of an upload.
#[async_trait]
pub trait StatusClient: Send + Sync {
    async fn fetch_status(&self, auth_token: &str, upload_id: &str, project_id: &str)
    -> Result<UploadStatus, CloudError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_status_deserializes() {
        let json = r#"{
            "uploadId": "up-1",
            "status": "RUNNING",
            "completed": false,
            "flows": [
                {"name": "login", "status": "SUCCESS", "totalTime": 3200, "startTime": 1700000000000},
                {"name": "checkout", "status": "ERROR", "errors": ["Element not found"]},
                {"name": "search", "status": "PENDING"}
            ]
        }"#;

        let status: UploadStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status.status, CloudStatus::Running);
        assert!(!status.completed);
        assert_eq!(status.flows.len(), 3);
        assert_eq!(status.flows[0].total_time, Some(3200));
        assert_eq!(status.flows[1].errors, vec!["Element not found".to_string()]);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(CloudStatus::Canceled.is_terminal());
        assert!(CloudStatus::Stopped.is_terminal());
        assert!(CloudStatus::Success.is_terminal());
        assert!(CloudStatus::Error.is_terminal());
        assert!(!CloudStatus::Running.is_terminal());
        assert!(!CloudStatus::Pending.is_terminal());
    }

    #[test]
    fn test_running_flows_summary() {
        let flows = vec![
            RunningFlow::from(&CloudFlowResult {
                name: "login".into(),
                status: CloudStatus::Success,
                errors: vec![],
                total_time: Some(1500),
                start_time: Some(1_700_000_000_000),
            }),
            RunningFlow::from(&CloudFlowResult {
                name: "checkout".into(),
                status: CloudStatus::Error,
                errors: vec!["boom".into()],
                total_time: Some(500),
                start_time: None,
            }),
            RunningFlow::from(&CloudFlowResult {
                name: "search".into(),
                status: CloudStatus::Running,
                errors: vec![],
                total_time: None,
                start_time: None,
            }),
        ];

        let summary = running_flows_summary("up-1", &flows);
        assert_eq!(summary.total_tests, 3);
        assert_eq!(summary.passed_count, 1);
        assert!(!summary.passed);
        assert_eq!(summary.suites[0].device_id, "up-1");
        assert_eq!(summary.suites[0].duration, Duration::from_millis(2000));
        assert_eq!(summary.suites[0].flows[1].failure.as_deref(), Some("boom"));
        assert_eq!(summary.suites[0].flows[2].status, FlowStatus::Canceled);
        assert!(flows[0].start_time.is_some());
    }
}
