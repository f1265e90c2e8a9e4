//! flowshard: a sharded UI test orchestrator for mobile and web flows.
//!
//! This crate partitions a set of declarative test flows into shards, binds
//! each shard to an exclusive device and driver port, runs the shards
//! concurrently and merges their results into a single verdict. It also
//! follows cloud-delegated runs by polling an upload's status to completion.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Plan**: Discover flows and the ordered sequence into an execution plan
//! - **Orchestrator**: Partition, allocate ports, run shards and aggregate
//! - **Device**: List connected devices and drive the app lifecycle
//! - **Session**: Run flows on one device through an external flow runner
//! - **Cloud**: Poll a cloud upload under rate limits and transient failures
//! - **Report**: Console progress, merged summaries and JUnit XML
//!
//! # Example
//!
//! ```no_run
//! use flowshard::config::load_config;
//! use flowshard::plan::discover;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("flowshard.toml"))?;
//!     let discovered = discover(&config.workspace.flows, &config.workspace)?;
//!     // ... set up a controller, session factory and reporter ...
//!     Ok(())
//! }
//! ```

pub mod cloud;
pub mod config;
pub mod connector;
pub mod device;
pub mod orchestrator;
pub mod plan;
pub mod report;
pub mod session;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use device::{Device, DeviceController, Platform};
pub use orchestrator::{Orchestrator, RunOptions, RunResult};
pub use plan::{ExecutionPlan, FlowRef};
pub use report::Reporter;
pub use session::{DeviceSession, SessionFactory};
