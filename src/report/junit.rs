//! JUnit XML report generation.
//!
//! Writes the merged [`TestExecutionSummary`] as JUnit XML, the de facto
//! standard consumed by Jenkins, GitLab CI, GitHub Actions and friends. Each
//! shard's suite becomes one `<testsuite>`, named after its device, and each
//! flow one `<testcase>`.
//!
//! # Format
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites name="flowshard" tests="3" failures="1" time="12.400">
//!   <testsuite name="emulator-5554" tests="2" failures="1" skipped="0" time="8.100">
//!     <testcase classname="flows" name="login" time="3.000"/>
//!     <testcase classname="flows" name="checkout" time="5.100">
//!       <failure message="Element not found: Pay">Element not found: Pay</failure>
//!     </testcase>
//!   </testsuite>
//!   <testsuite name="emulator-5556" tests="1" failures="0" skipped="0" time="4.300">
//!     <testcase classname="flows" name="search" time="4.300"/>
//!   </testsuite>
//! </testsuites>
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use tracing::{error, info};

use super::Reporter;
use super::summary::{FlowResult, FlowStatus, SuiteResult, TestExecutionSummary};
use crate::orchestrator::{Partition, RunResult};

/// Reporter that writes the merged summary as JUnit XML when the run completes.
///
/// Nothing is written for runs without a summary (single-flow and
/// continuous runs). Parent directories are created as needed.
pub struct JUnitReporter {
    output_path: PathBuf,
    testsuites_name: String,
}

impl JUnitReporter {
    /// Creates a reporter that writes to `output_path`.
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            testsuites_name: "flowshard".to_string(),
        }
    }

    /// Sets the `name` attribute of the root `<testsuites>` element.
    pub fn with_testsuites_name(mut self, name: impl Into<String>) -> Self {
        self.testsuites_name = name.into();
        self
    }

    /// Writes `summary` to the configured path.
    pub fn write(&self, summary: &TestExecutionSummary) -> anyhow::Result<()> {
        write_junit(summary, &self.testsuites_name, &self.output_path)
    }
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_plan(&self, _partition: &Partition, _device_ids: &[String]) {}

    async fn on_shard_start(&self, _shard: usize, _device_id: &str, _port: u16) {}

    async fn on_flow_complete(&self, _shard: usize, _result: &FlowResult) {}

    async fn on_run_complete(&self, result: &RunResult) {
        let Some(summary) = &result.aggregate.summary else {
            return;
        };
        match self.write(summary) {
            Ok(()) => info!("JUnit XML written to: {}", self.output_path.display()),
            Err(e) => error!("Failed to write JUnit XML: {:#}", e),
        }
    }
}

/// Renders `summary` and writes it to `path`.
pub fn write_junit(summary: &TestExecutionSummary, name: &str, path: &Path) -> anyhow::Result<()> {
    let xml = generate_xml(summary, name)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, xml)?;
    Ok(())
}

/// Renders `summary` as a JUnit XML document.
pub fn generate_xml(summary: &TestExecutionSummary, name: &str) -> anyhow::Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let failures = summary.flows().filter(|f| f.status == FlowStatus::Error).count();
    let time: f64 = summary.suites.iter().map(|s| s.duration.as_secs_f64()).sum();

    let mut testsuites = BytesStart::new("testsuites");
    testsuites.push_attribute(("name", name));
    testsuites.push_attribute(("tests", summary.total_tests.to_string().as_str()));
    testsuites.push_attribute(("failures", failures.to_string().as_str()));
    testsuites.push_attribute(("time", format!("{:.3}", time).as_str()));
    writer.write_event(Event::Start(testsuites))?;

    for suite in &summary.suites {
        write_testsuite(&mut writer, suite)?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;
    Ok(String::from_utf8(writer.into_inner())?)
}

fn write_testsuite<W: std::io::Write>(writer: &mut Writer<W>, suite: &SuiteResult) -> anyhow::Result<()> {
    let failures = suite.flows.iter().filter(|f| f.status == FlowStatus::Error).count();
    let skipped = suite
        .flows
        .iter()
        .filter(|f| matches!(f.status, FlowStatus::Canceled | FlowStatus::Stopped))
        .count();

    let mut testsuite = BytesStart::new("testsuite");
    testsuite.push_attribute(("name", suite.device_id.as_str()));
    testsuite.push_attribute(("tests", suite.flows.len().to_string().as_str()));
    testsuite.push_attribute(("failures", failures.to_string().as_str()));
    testsuite.push_attribute(("skipped", skipped.to_string().as_str()));
    testsuite.push_attribute(("time", format!("{:.3}", suite.duration.as_secs_f64()).as_str()));
    writer.write_event(Event::Start(testsuite))?;

    for flow in &suite.flows {
        write_testcase(writer, flow)?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    Ok(())
}

fn write_testcase<W: std::io::Write>(writer: &mut Writer<W>, flow: &FlowResult) -> anyhow::Result<()> {
    let classname = flow
        .file
        .parent()
        .map(|p| p.to_string_lossy().replace('/', "."))
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "flows".to_string());

    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", classname.as_str()));
    testcase.push_attribute(("name", flow.name.as_str()));
    testcase.push_attribute(("time", format!("{:.3}", flow.duration.as_secs_f64()).as_str()));

    let message = flow.failure.as_deref().map(strip_invalid_xml_chars);
    match flow.status {
        FlowStatus::Success => {
            writer.write_event(Event::Empty(testcase))?;
        }
        FlowStatus::Warning => {
            writer.write_event(Event::Start(testcase))?;
            if let Some(msg) = &message {
                writer.write_event(Event::Start(BytesStart::new("system-out")))?;
                writer.write_event(Event::Text(BytesText::new(msg)))?;
                writer.write_event(Event::End(BytesEnd::new("system-out")))?;
            }
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
        FlowStatus::Error => {
            writer.write_event(Event::Start(testcase))?;
            let msg = message.unwrap_or_else(|| "Flow failed".to_string());
            let first_line = msg.lines().next().unwrap_or_default();
            let mut failure = BytesStart::new("failure");
            failure.push_attribute(("message", first_line));
            writer.write_event(Event::Start(failure))?;
            writer.write_event(Event::Text(BytesText::new(&msg)))?;
            writer.write_event(Event::End(BytesEnd::new("failure")))?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
        FlowStatus::Canceled | FlowStatus::Stopped => {
            writer.write_event(Event::Start(testcase))?;
            let mut skipped = BytesStart::new("skipped");
            skipped.push_attribute(("message", flow.status.to_string().as_str()));
            writer.write_event(Event::Empty(skipped))?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
    }
    Ok(())
}

/// Removes characters XML 1.0 can't represent. Escaping is left to the writer.
fn strip_invalid_xml_chars(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}
