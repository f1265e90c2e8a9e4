//! flowshard CLI - Sharded UI test orchestrator.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use flowshard::cloud::{
    CloudFlowResult, CloudStatus, CloudUploadPoller, HttpStatusClient, PollPolicy, running_flows_summary,
};
use flowshard::config::{self, Config, STARTER_CONFIG};
use flowshard::device::{CommandDeviceController, DeviceController, Platform};
use flowshard::orchestrator::{Orchestrator, RunOptions, ShardMode};
use flowshard::plan;
use flowshard::report::junit::write_junit;
use flowshard::report::{ConsoleReporter, JUnitReporter, MultiReporter};
use flowshard::session::CommandSessionFactory;

#[derive(Parser)]
#[command(name = "flowshard")]
#[command(about = "Sharded UI test orchestrator for mobile and web flows", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "flowshard.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run flows on connected devices
    Test {
        /// Flow files or directories (defaults to [workspace].flows)
        paths: Vec<PathBuf>,

        /// Split the flows across N devices
        #[arg(long, value_name = "N")]
        shard_split: Option<usize>,

        /// Run every flow on each of N devices
        #[arg(long, value_name = "N")]
        shard_all: Option<usize>,

        /// Device to run on (repeatable)
        #[arg(long = "device", value_name = "ID")]
        devices: Vec<String>,

        /// Only use devices of this platform (android, ios, web)
        #[arg(long)]
        platform: Option<Platform>,

        /// Re-run the flow whenever its file changes
        #[arg(long)]
        continuous: bool,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// Wait for a cloud upload to finish
    CloudStatus {
        /// Upload to follow
        #[arg(long)]
        upload_id: String,

        /// Project the upload belongs to
        #[arg(long)]
        project_id: String,

        /// API key
        #[arg(long, env = "FLOWSHARD_API_KEY", hide_env_values = true)]
        api_key: String,

        /// Override [cloud].wait_timeout_mins
        #[arg(long)]
        timeout_mins: Option<u64>,

        /// Exit with 0 when the wait times out
        #[arg(long)]
        no_fail_on_timeout: bool,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// List connected devices
    Devices,

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Test {
            paths,
            shard_split,
            shard_all,
            devices,
            platform,
            continuous,
            junit,
        } => {
            let args = TestArgs {
                paths,
                shard_split,
                shard_all,
                devices,
                platform,
                continuous,
                junit,
            };
            run_flows(&cli.config, args, cli.verbose).await
        }
        Commands::CloudStatus {
            upload_id,
            project_id,
            api_key,
            timeout_mins,
            no_fail_on_timeout,
            junit,
        } => {
            let args = CloudArgs {
                upload_id,
                project_id,
                api_key,
                timeout_mins,
                no_fail_on_timeout,
                junit,
            };
            cloud_status(&cli.config, args).await
        }
        Commands::Devices => list_devices(&cli.config).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(&cli.config),
    }
}

struct TestArgs {
    paths: Vec<PathBuf>,
    shard_split: Option<usize>,
    shard_all: Option<usize>,
    devices: Vec<String>,
    platform: Option<Platform>,
    continuous: bool,
    junit: Option<PathBuf>,
}

struct CloudArgs {
    upload_id: String,
    project_id: String,
    api_key: String,
    timeout_mins: Option<u64>,
    no_fail_on_timeout: bool,
    junit: Option<PathBuf>,
}

async fn run_flows(config_path: &Path, args: TestArgs, verbose: bool) -> Result<()> {
    // Shard flags are checked before anything touches the config or devices.
    let (mode, requested_shards) = ShardMode::from_flags(args.shard_split, args.shard_all)?;

    let config = load_valid_config(config_path)?;
    info!("Loaded configuration from {}", config_path.display());

    let paths = if args.paths.is_empty() {
        config.workspace.flows.clone()
    } else {
        args.paths
    };
    let discovered = plan::discover(&paths, &config.workspace).context("Failed to discover flows")?;

    let options = RunOptions {
        mode,
        requested_shards,
        device_ids: args.devices,
        platform: args.platform.or(config.workspace.platform),
        continuous: args.continuous,
        single_file_input: discovered.single_file_input,
        pinned_port: config.flowshard.driver_port,
    };

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current flow");
            signal_token.cancel();
        }
    });

    let reporter = create_reporter(&config, args.junit, verbose);
    let controller = CommandDeviceController::new(config.device.clone(), config.flowshard.controller_timeout());
    let factory = CommandSessionFactory::new(config.session.clone());
    let orchestrator = Orchestrator::new(config, factory, controller, reporter).with_cancellation_token(cancel);

    let result = orchestrator.run(&discovered.plan, &options).await?;
    std::process::exit(result.exit_code());
}

async fn cloud_status(config_path: &Path, args: CloudArgs) -> Result<()> {
    let mut config = load_config_or_default(config_path)?;
    if let Some(mins) = args.timeout_mins {
        config.cloud.wait_timeout_mins = mins;
    }
    if args.no_fail_on_timeout {
        config.cloud.fail_on_timeout = false;
    }
    config.cloud.validate().context("Invalid [cloud] settings")?;

    let client = HttpStatusClient::new(config.cloud.api_url.clone())?;
    let poller = CloudUploadPoller::new(client, args.api_key, PollPolicy::from_config(&config.cloud))
        .with_flow_callback(Box::new(print_cloud_flow));

    info!("Waiting for upload {}", args.upload_id);
    let outcome = poller.wait(&args.upload_id, &args.project_id).await?;

    println!();
    if outcome.timed_out {
        println!(
            "{} upload {} did not complete within {} minute(s)",
            console::style("Timed out:").yellow().bold(),
            args.upload_id,
            config.cloud.wait_timeout_mins
        );
    } else {
        println!("Upload {} finished: {}", args.upload_id, outcome.status.status);
    }

    let junit_path = args
        .junit
        .or_else(|| config.report.junit.then(|| config.report.junit_path()));
    if let Some(path) = junit_path {
        let summary = running_flows_summary(&args.upload_id, &outcome.running_flows);
        write_junit(&summary, "flowshard", &path)?;
        info!("JUnit XML written to: {}", path.display());
    }

    std::process::exit(outcome.exit_code());
}

fn print_cloud_flow(flow: &CloudFlowResult) {
    let status = match flow.status {
        CloudStatus::Success => console::style(flow.status.to_string()).green(),
        CloudStatus::Error => console::style(flow.status.to_string()).red(),
        _ => console::style(flow.status.to_string()).yellow(),
    };
    println!("{} {}", status, flow.name);
    for error in &flow.errors {
        println!("    {}", console::style(error).dim());
    }
}

async fn list_devices(config_path: &Path) -> Result<()> {
    let config = load_config_or_default(config_path)?;
    let controller = CommandDeviceController::new(config.device.clone(), config.flowshard.controller_timeout());

    let devices = controller.list_connected().await?;
    if devices.is_empty() {
        println!("No devices connected");
        return Ok(());
    }

    println!("Connected devices:");
    for device in &devices {
        if device.description.is_empty() {
            println!("  {} ({})", device.id, device.platform);
        } else {
            println!("  {} ({}) {}", device.id, device.platform, device.description);
        }
    }
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match load_valid_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!(
                "  Port range: {}-{}",
                config.flowshard.port_range_start, config.flowshard.port_range_end
            );
            println!("  Controller timeout: {}s", config.flowshard.controller_timeout_secs);
            println!("  Flow timeout: {}s", config.flowshard.flow_timeout_secs);
            println!("  Cloud API: {}", config.cloud.api_url);

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        eprintln!("{} already exists. Remove it first or edit manually.", path.display());
        std::process::exit(1);
    }

    std::fs::write(path, STARTER_CONFIG).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  flowshard test");

    Ok(())
}

fn load_valid_config(path: &Path) -> Result<Config> {
    let config =
        config::load_config(path).with_context(|| format!("Failed to load config from {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Cloud and device listing work without a config file.
fn load_config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        Ok(Config::default())
    }
}

fn create_reporter(config: &Config, junit_override: Option<PathBuf>, verbose: bool) -> MultiReporter {
    let mut multi = MultiReporter::new();

    // Add console reporter
    multi = multi.with_reporter(ConsoleReporter::new(verbose));

    // Add JUnit reporter if enabled
    if config.report.junit || junit_override.is_some() {
        let junit_path = junit_override.unwrap_or_else(|| config.report.junit_path());
        multi = multi.with_reporter(JUnitReporter::new(junit_path));
    }

    multi
}
