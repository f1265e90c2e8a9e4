//! Run reporting: progress events, console output and the merged summary.

pub mod junit;
pub mod summary;

use std::sync::Mutex;

use async_trait::async_trait;

use crate::orchestrator::{Partition, RunResult};
use summary::FlowResult;

pub use junit::JUnitReporter;

/// A reporter receives events during a sharded run.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once the run is planned and devices are bound.
    async fn on_plan(&self, partition: &Partition, device_ids: &[String]);

    /// Called when a shard acquired its port and is about to open its session.
    async fn on_shard_start(&self, shard: usize, device_id: &str, port: u16);

    /// Called when a flow completes on a shard.
    async fn on_flow_complete(&self, shard: usize, result: &FlowResult);

    /// Called when all shards have joined.
    async fn on_run_complete(&self, result: &RunResult);
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_plan(&self, _partition: &Partition, _device_ids: &[String]) {}
    async fn on_shard_start(&self, _shard: usize, _device_id: &str, _port: u16) {}
    async fn on_flow_complete(&self, _shard: usize, _result: &FlowResult) {}
    async fn on_run_complete(&self, _result: &RunResult) {}
}

/// A reporter that combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    /// Create a new multi-reporter.
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    /// Add a reporter to the multi-reporter.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_plan(&self, partition: &Partition, device_ids: &[String]) {
        for reporter in &self.reporters {
            reporter.on_plan(partition, device_ids).await;
        }
    }

    async fn on_shard_start(&self, shard: usize, device_id: &str, port: u16) {
        for reporter in &self.reporters {
            reporter.on_shard_start(shard, device_id, port).await;
        }
    }

    async fn on_flow_complete(&self, shard: usize, result: &FlowResult) {
        for reporter in &self.reporters {
            reporter.on_flow_complete(shard, result).await;
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        for reporter in &self.reporters {
            reporter.on_run_complete(result).await;
        }
    }
}

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    /// Create a new console reporter.
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn println(&self, line: String) {
        match self.progress.lock().ok().as_deref() {
            Some(Some(pb)) => pb.println(line),
            _ => println!("{}", line),
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_plan(&self, partition: &Partition, device_ids: &[String]) {
        for warning in &partition.warnings {
            println!("{} {}", console::style("warning:").yellow().bold(), warning);
        }

        let flows: usize = partition.chunks.iter().map(|c| c.flow_count()).sum();
        println!(
            "Running {} flow(s) on {} shard(s): {}",
            flows,
            partition.effective_shards,
            device_ids[..partition.effective_shards.min(device_ids.len())].join(", ")
        );

        let pb = indicatif::ProgressBar::new(flows as u64);
        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        if let Ok(mut progress) = self.progress.lock() {
            *progress = Some(pb);
        }
    }

    async fn on_shard_start(&self, shard: usize, device_id: &str, port: u16) {
        if self.verbose {
            self.println(format!("[shard {}] {} on port {}", shard + 1, device_id, port));
        }
    }

    async fn on_flow_complete(&self, shard: usize, result: &FlowResult) {
        if let Ok(progress) = self.progress.lock()
            && let Some(pb) = progress.as_ref()
        {
            pb.inc(1);
        }

        if self.verbose || !result.passed() {
            let status = if result.passed() {
                console::style("PASS").green()
            } else {
                console::style("FAIL").red()
            };
            self.println(format!("{} [shard {}] {}", status, shard + 1, result.name));
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        if let Ok(mut progress) = self.progress.lock()
            && let Some(pb) = progress.take()
        {
            pb.finish_and_clear();
        }
        print_summary(result);
    }
}

/// Prints a summary of the run to the console.
///
/// Displays pass/fail counts with colored output, lists failed flows and
/// ends with the verdict.
pub fn print_summary(result: &RunResult) {
    let aggregate = &result.aggregate;

    println!();
    println!("Flow Results:");
    println!("  Shards:   {}", result.effective_shards);
    println!("  Total:    {}", aggregate.total);
    println!("  Passed:   {}", console::style(aggregate.passed).green());
    println!(
        "  Failed:   {}",
        console::style(aggregate.total - aggregate.passed).red()
    );
    println!("  Duration: {:?}", result.duration);

    if let Some(summary) = &aggregate.summary {
        let failed: Vec<_> = summary
            .suites
            .iter()
            .flat_map(|s| s.flows.iter().map(move |f| (s, f)))
            .filter(|(_, f)| !f.passed())
            .collect();

        if !failed.is_empty() {
            println!();
            println!("Failed flows:");
            for (suite, flow) in failed {
                println!("  - {} ({}, {})", flow.name, suite.device_id, flow.status);
                if let Some(msg) = &flow.failure {
                    for line in msg.lines() {
                        println!("    {}", console::style(line).dim());
                    }
                }
            }
        }
    }

    println!();
    if result.success() {
        println!("{}", console::style("All flows passed!").green().bold());
    } else {
        println!("{}", console::style("Some flows failed.").red().bold());
    }
}
