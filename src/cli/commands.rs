//! CLI command definitions for xtraplatform-jobs.
//!
//! This module provides operator commands for inspecting and maintaining a
//! job queue: status reports, pushing jobs, clearing the failed list, running
//! a sweep, and printing metrics.

use crate::config::{BackendKind, JobsConfig};
use crate::metrics::{export_metrics, init_metrics, MetricsCollector};
use crate::scheduler::job::now_epoch;
use crate::scheduler::health::{overall_state, ComponentHealth};
use crate::scheduler::{HealthState, Job, JobQueue, JobRunner, QueueSnapshot, SimpleRegistry};
use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

/// Operator tooling for the xtraplatform job queue.
#[derive(Parser)]
#[command(name = "xtraplatform-jobs")]
#[command(about = "Inspect and maintain the xtraplatform job queue")]
#[command(version)]
#[command(
    long_about = "xtraplatform-jobs inspects and maintains a job queue backed by process memory or Redis.\n\nConfiguration is read from JOBS_* environment variables; flags override them.\n\nExample usage:\n  xtraplatform-jobs --backend redis --redis-url redis://localhost:6379 status --json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Queue backend (local, redis).
    #[arg(short, long, global = true)]
    pub backend: Option<BackendKind>,

    /// Redis connection URL.
    #[arg(long, global = true)]
    pub redis_url: Option<String>,

    /// Prefix of all Redis keys.
    #[arg(long, global = true)]
    pub key_prefix: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Show open lanes, taken and failed jobs, and job sets.
    #[command(alias = "st")]
    Status(StatusArgs),

    /// Push a job onto the queue.
    Push(PushArgs),

    /// Remove all jobs from the failed list.
    ClearFailed,

    /// Recover orphaned jobs and remove expired done sets once.
    Sweep(SweepArgs),

    /// Print queue metrics in Prometheus text format.
    Metrics,
}

/// Arguments for `xtraplatform-jobs status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Return the full snapshot as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `xtraplatform-jobs push`.
#[derive(Parser, Debug)]
pub struct PushArgs {
    /// Job type.
    pub job_type: String,

    /// Job details as JSON.
    #[arg(short = 'd', long, default_value = "{}")]
    pub details: String,

    /// Priority lane; higher runs first.
    #[arg(short = 'p', long, default_value_t = crate::scheduler::DEFAULT_PRIORITY)]
    pub priority: i32,

    /// Explicit job id (generated if omitted).
    #[arg(long)]
    pub id: Option<String>,

    /// Id of the job set this job belongs to.
    #[arg(long)]
    pub part_of: Option<String>,

    /// Work units of the job.
    #[arg(long)]
    pub total: Option<i64>,
}

/// Arguments for `xtraplatform-jobs sweep`.
#[derive(Parser, Debug)]
pub struct SweepArgs {
    /// Idle seconds after which a taken job counts as orphaned.
    #[arg(long)]
    pub orphan_timeout: Option<u64>,

    /// Seconds to keep done job sets.
    #[arg(long)]
    pub retention: Option<u64>,

    /// Return the result as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = build_config(&cli)?;
    let queue = JobQueue::from_config(&config).await?;

    match cli.command {
        Commands::Status(args) => run_status_command(&queue, args).await,
        Commands::Push(args) => run_push_command(&queue, args).await,
        Commands::ClearFailed => run_clear_failed_command(&queue).await,
        Commands::Sweep(args) => run_sweep_command(queue, &config, args).await,
        Commands::Metrics => run_metrics_command(&queue).await,
    }
}

/// Reads the configuration from the environment and applies flag overrides.
fn build_config(cli: &Cli) -> anyhow::Result<JobsConfig> {
    let mut config = JobsConfig::from_env()?;

    if let Some(backend) = cli.backend {
        config = config.with_backend(backend);
    }
    if let Some(url) = &cli.redis_url {
        config = config.with_redis_url(url.clone());
    }
    if let Some(prefix) = &cli.key_prefix {
        config = config.with_key_prefix(prefix.clone());
    }

    config.validate()?;
    Ok(config)
}

// ============================================================================
// Command Implementations
// ============================================================================

/// JSON output of `status`.
#[derive(Serialize)]
struct StatusOutput {
    health: HealthState,
    components: Vec<ComponentHealth>,
    #[serde(flatten)]
    snapshot: QueueSnapshot,
}

async fn status_output(queue: &JobQueue) -> anyhow::Result<StatusOutput> {
    let registry = SimpleRegistry::new();
    queue.register_health(&registry).await;
    let components = registry.report().await;

    Ok(StatusOutput {
        health: overall_state(&components),
        components,
        snapshot: queue.snapshot().await?,
    })
}

async fn run_status_command(queue: &JobQueue, args: StatusArgs) -> anyhow::Result<()> {
    let output = status_output(queue).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    print_status(&output);
    Ok(())
}

fn print_components(components: &[ComponentHealth], depth: usize) {
    for component in components {
        println!("{:indent$}{}: {}", "", component.name, component.state, indent = depth * 2);
        print_components(&component.components, depth + 1);
    }
}

fn print_status(output: &StatusOutput) {
    let snapshot = &output.snapshot;
    println!("Health: {}", output.health);
    print_components(&output.components, 1);

    println!("\nBackend: {} ({})", snapshot.backend, snapshot.state);

    println!("\nOpen:");
    if snapshot.open.is_empty() {
        println!("  (none)");
    }
    for lane in &snapshot.open {
        println!(
            "  {:<24} priority {:>4}  {} job(s)",
            lane.job_type,
            lane.priority,
            lane.jobs.len()
        );
    }

    println!("\nTaken: {}", snapshot.taken.len());
    for job in &snapshot.taken {
        println!(
            "  {}  {:<24} {:>3}%  executor {}",
            job.id,
            job.job_type,
            job.percent(),
            job.executor.as_deref().unwrap_or("-")
        );
    }

    println!("\nFailed: {}", snapshot.failed.len());
    for job in &snapshot.failed {
        println!(
            "  {}  {:<24} {}",
            job.id,
            job.job_type,
            job.error.as_deref().unwrap_or("")
        );
    }

    println!("\nSets: {}", snapshot.sets.len());
    for set in &snapshot.sets {
        println!(
            "  {}  {:<24} {:>3}%  {}/{}  {}",
            set.id,
            set.label,
            set.percent(),
            set.current,
            set.total,
            if set.is_done() { "done" } else { "open" }
        );
    }
}

async fn run_push_command(queue: &JobQueue, args: PushArgs) -> anyhow::Result<()> {
    let job = job_from_args(args)?;
    let job_id = job.id.clone();
    let job_type = job.job_type.clone();

    queue.push(job).await?;
    info!(job_id = %job_id, job_type = %job_type, "Job pushed");
    println!("{}", job_id);
    Ok(())
}

fn job_from_args(args: PushArgs) -> anyhow::Result<Job> {
    let details: Value = serde_json::from_str(&args.details)
        .map_err(|e| anyhow::anyhow!("Invalid job details JSON: {}", e))?;

    let mut job = Job::new(args.job_type, details).with_priority(args.priority);
    if let Some(id) = args.id {
        job = job.with_id(id);
    }
    if let Some(set_id) = args.part_of {
        job = job.with_part_of(set_id);
    }
    if let Some(total) = args.total {
        job = job.with_total(total);
    }
    Ok(job)
}

async fn run_clear_failed_command(queue: &JobQueue) -> anyhow::Result<()> {
    let removed = queue.clear_failed().await?;
    info!(removed = removed, "Cleared failed jobs");
    println!("Removed {} failed job(s)", removed);
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
struct SweepOutput {
    orphans_recovered: usize,
    sets_removed: usize,
}

async fn run_sweep_command(
    queue: JobQueue,
    config: &JobsConfig,
    args: SweepArgs,
) -> anyhow::Result<()> {
    let mut runner_config = config.runner.clone();
    if let Some(secs) = args.orphan_timeout {
        runner_config = runner_config.with_orphan_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = args.retention {
        runner_config = runner_config.with_done_set_retention(Duration::from_secs(secs));
    }

    let runner = JobRunner::new(runner_config, queue, Vec::new());
    let now = now_epoch();
    let output = SweepOutput {
        orphans_recovered: runner.sweep_orphans_at(now).await?,
        sets_removed: runner.cleanup_done_sets_at(now).await?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!(
            "Recovered {} orphaned job(s), removed {} done set(s)",
            output.orphans_recovered, output.sets_removed
        );
    }
    Ok(())
}

async fn run_metrics_command(queue: &JobQueue) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    let snapshot = queue.snapshot().await?;
    MetricsCollector::new().update_from_snapshot(&snapshot);
    print!("{}", export_metrics());
    Ok(())
}
