//! CLI command definitions for shard-launch.
//!
//! Plans a sharded workload from a launch config, submits it as a single
//! cluster job, and watches jobs through to completion.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{BackendConfig, LaunchConfig};
use crate::error::MonitorError;
use crate::metrics;
use crate::monitor::{CompletionMonitor, MonitorState, Outcome, WatchOptions};
use crate::planner::ShardPipeline;
use crate::scheduler::{ClusterBackend, HttpBackend, JobHandle, JobSubmitter};

/// Process exit code for a watch that hit its deadline.
const EXIT_TIMEOUT: u8 = 124;

/// Process exit code for a watch interrupted with Ctrl-C.
const EXIT_INTERRUPTED: u8 = 130;

/// Shard a workload, submit it as one cluster job, and watch it finish.
#[derive(Parser)]
#[command(name = "shard-launch")]
#[command(about = "Submit sharded multi-stage jobs to a compute cluster and watch them complete")]
#[command(version)]
#[command(
    long_about = "shard-launch splits a workload into contiguous shards, renders a chained command \
pipeline for each shard, submits every shard as one cluster job, and streams its logs until it \
succeeds, fails, or times out.\n\nExample usage:\n  shard-launch submit -c launch.yaml --watch"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Write Prometheus metrics to this file before exiting.
    #[arg(long, global = true)]
    pub metrics_file: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Render the shard pipelines without submitting anything.
    Plan(PlanArgs),

    /// Plan and submit a job, optionally watching it to completion.
    Submit(SubmitArgs),

    /// Watch an existing job until it succeeds, fails, or times out.
    Watch(WatchArgs),

    /// Ask the backend to cancel a job.
    Cancel(CancelArgs),
}

/// Shard geometry overrides shared by `plan` and `submit`.
#[derive(clap::Args, Debug)]
pub struct ShardArgs {
    /// Launch config file (YAML).
    #[arg(short = 'c', long)]
    pub config: PathBuf,

    /// Override shards.total_items.
    #[arg(long)]
    pub total_items: Option<u64>,

    /// Override shards.count.
    #[arg(short = 'n', long)]
    pub shards: Option<u64>,
}

/// Arguments for `shard-launch plan`.
#[derive(Parser, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub shard: ShardArgs,

    /// Output the pipelines as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `shard-launch submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub shard: ShardArgs,

    /// Print the submission request instead of sending it.
    #[arg(long)]
    pub dry_run: bool,

    /// Watch the job after submitting it.
    #[arg(short = 'w', long)]
    pub watch: bool,

    /// Append job logs to this file instead of stdout (with --watch).
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Output a JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Where to find the backend for `watch` and `cancel`.
#[derive(clap::Args, Debug)]
pub struct BackendArgs {
    /// Launch config file naming the backend.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Base URL of the cluster API (used when no config is given).
    #[arg(long, env = "SHARD_LAUNCH_API_BASE")]
    pub api_base: Option<String>,

    /// Bearer token for the cluster API.
    #[arg(long, env = "SHARD_LAUNCH_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,
}

/// Arguments for `shard-launch watch`.
#[derive(Parser, Debug)]
pub struct WatchArgs {
    /// Job handle returned by `submit`.
    pub handle: String,

    #[command(flatten)]
    pub backend: BackendArgs,

    /// Seconds between status queries (overrides the config).
    #[arg(long)]
    pub poll_interval: Option<u64>,

    /// Seconds before giving up (overrides the config).
    #[arg(long)]
    pub max_wait: Option<u64>,

    /// Skip log bytes before this offset, e.g. when resuming a watch.
    #[arg(long, default_value = "0")]
    pub from_offset: u64,

    /// Append job logs to this file instead of stdout.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Output a JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `shard-launch cancel`.
#[derive(Parser, Debug)]
pub struct CancelArgs {
    /// Job handle to cancel.
    pub handle: String,

    #[command(flatten)]
    pub backend: BackendArgs,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse arguments and run the selected command.
pub async fn run() -> anyhow::Result<ExitCode> {
    run_with_cli(parse_cli()).await
}

/// Run the selected command with already-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<ExitCode> {
    if cli.metrics_file.is_some() {
        metrics::init_metrics().context("Failed to initialize metrics")?;
    }

    let result = match cli.command {
        Commands::Plan(args) => run_plan_command(args).map(|()| ExitCode::SUCCESS),
        Commands::Submit(args) => run_submit_command(args).await,
        Commands::Watch(args) => run_watch_command(args).await,
        Commands::Cancel(args) => run_cancel_command(args).await.map(|()| ExitCode::SUCCESS),
    };

    if let Some(ref path) = cli.metrics_file {
        std::fs::write(path, metrics::export_metrics())
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    }

    result
}

fn load_config(args: &ShardArgs) -> anyhow::Result<LaunchConfig> {
    let mut config = LaunchConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;

    if let Some(total) = args.total_items {
        config.shards.total_items = total;
    }
    if let Some(count) = args.shards {
        config.shards.count = count;
    }
    config.validate()?;
    Ok(config)
}

fn plan_config(config: &LaunchConfig) -> anyhow::Result<Vec<ShardPipeline>> {
    let pipelines = config
        .planner()
        .plan(&config.stages)
        .context("Failed to plan shards")?;
    info!(
        shards = pipelines.len(),
        total_items = config.shards.total_items,
        "Planned shards"
    );
    Ok(pipelines)
}

fn run_plan_command(args: PlanArgs) -> anyhow::Result<()> {
    let config = load_config(&args.shard)?;
    let pipelines = plan_config(&config)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&pipelines)?);
        return Ok(());
    }

    for pipeline in &pipelines {
        println!("{} ({} items) -> {}", pipeline.range, pipeline.range.len(), pipeline.output);
        for (position, stage) in pipeline.stages.iter().enumerate() {
            println!("  {}. {}: {}", position + 1, stage.name, stage.command);
        }
    }
    Ok(())
}

async fn run_submit_command(args: SubmitArgs) -> anyhow::Result<ExitCode> {
    let config = load_config(&args.shard)?;
    let pipelines = plan_config(&config)?;
    let spec = config.job_spec(pipelines);
    let backend = config.build_backend()?;
    let submitter = JobSubmitter::new(Arc::clone(&backend));

    if args.dry_run {
        let request = submitter.prepare(&spec)?;
        println!("{}", serde_json::to_string_pretty(&request)?);
        return Ok(ExitCode::SUCCESS);
    }

    let handle = submitter.submit(&spec).await?;
    let submitted_at = Utc::now();

    if args.json {
        println!(
            "{}",
            serde_json::json!({
                "handle": handle,
                "shards": spec.shards.len(),
                "submitted_at": submitted_at.to_rfc3339(),
            })
        );
    } else {
        println!(
            "Submitted job {} ({} shards) at {}",
            handle,
            spec.shards.len(),
            submitted_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    if !must_watch(args.watch, &config.backend) {
        return Ok(ExitCode::SUCCESS);
    }

    let state = MonitorState::new(handle);
    watch_job(
        backend,
        config.watch_options(),
        state,
        args.log_file.as_deref(),
        args.json,
    )
    .await
}

async fn run_watch_command(args: WatchArgs) -> anyhow::Result<ExitCode> {
    let (backend, mut options) = resolve_backend(&args.backend)?;
    if let Some(secs) = args.poll_interval {
        options.poll_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = args.max_wait {
        options.max_wait = Duration::from_secs(secs);
    }

    let state = MonitorState::new(JobHandle::new(args.handle)).with_log_offset(args.from_offset);
    watch_job(backend, options, state, args.log_file.as_deref(), args.json).await
}

async fn run_cancel_command(args: CancelArgs) -> anyhow::Result<()> {
    let (backend, _) = resolve_backend(&args.backend)?;
    let handle = JobHandle::new(args.handle);

    backend
        .cancel(&handle)
        .await
        .with_context(|| format!("Failed to cancel job {}", handle))?;
    println!("Cancellation requested for job {}", handle);
    Ok(())
}

/// Whether `submit` must stay attached to the job it created.
///
/// In-process jobs are killed when shard-launch exits, so they are always
/// watched.
fn must_watch(requested: bool, backend: &BackendConfig) -> bool {
    if requested {
        return true;
    }
    if backend.is_in_process() {
        info!("Local jobs only run while shard-launch is running; watching until they finish");
        return true;
    }
    false
}

/// Picks the backend from a config file, or from `--api-base`.
fn resolve_backend(args: &BackendArgs) -> anyhow::Result<(Arc<dyn ClusterBackend>, WatchOptions)> {
    if let Some(ref path) = args.config {
        let config = LaunchConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?;
        if config.backend.is_in_process() {
            bail!(
                "{} uses the local backend, whose jobs exist only inside the submitting process; \
                 use `shard-launch submit --watch` instead",
                path.display()
            );
        }
        return Ok((config.build_backend()?, config.watch_options()));
    }

    match args.api_base {
        Some(ref api_base) => {
            let backend = HttpBackend::new(api_base.clone(), args.api_token.clone())?;
            Ok((Arc::new(backend), WatchOptions::default()))
        }
        None => bail!("Either --config or --api-base (SHARD_LAUNCH_API_BASE) is required"),
    }
}

fn open_log_sink(path: Option<&Path>) -> anyhow::Result<Box<dyn Write + Send>> {
    match path {
        Some(path) => {
            let file = File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(std::io::stdout())),
    }
}

async fn watch_job(
    backend: Arc<dyn ClusterBackend>,
    options: WatchOptions,
    state: MonitorState,
    log_file: Option<&Path>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let mut sink = open_log_sink(log_file)?;

    let (cancel_tx, cancel_rx) = broadcast::channel(1);
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(());
        }
    });

    let handle = state.handle.clone();
    let mut monitor = CompletionMonitor::new(backend, options).with_cancellation(cancel_rx);
    let result = monitor
        .watch_from(state, |bytes| {
            if let Err(e) = sink.write_all(bytes).and_then(|()| sink.flush()) {
                warn!(error = %e, "Failed to write job logs");
            }
        })
        .await;
    interrupt.abort();

    let state = match result {
        Ok(state) => state,
        Err(MonitorError::Cancelled { .. }) => {
            eprintln!(
                "Stopped watching job {}; it may still be running. Cancel it with `shard-launch cancel {}`.",
                handle, handle
            );
            return Ok(ExitCode::from(EXIT_INTERRUPTED));
        }
        Err(e) => return Err(e.into()),
    };

    if json {
        println!("{}", serde_json::to_string(&state)?);
    } else {
        println!(
            "Job {} finished: {} after {:.0?} ({} status queries, {} transient errors)",
            state.handle,
            state.outcome,
            state.elapsed,
            state.status_queries,
            state.transient_errors
        );
        if state.outcome == Outcome::Timeout {
            println!("The job was not cancelled and may still be running.");
        }
    }

    Ok(ExitCode::from(exit_code_for(&state.outcome)))
}

/// Maps a watch outcome to the process exit code.
pub fn exit_code_for(outcome: &Outcome) -> u8 {
    match outcome {
        Outcome::Success => 0,
        Outcome::Failure { exit_code } => (*exit_code).clamp(1, 255) as u8,
        Outcome::Timeout => EXIT_TIMEOUT,
        Outcome::Pending => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_submit() {
        let cli = Cli::try_parse_from([
            "shard-launch",
            "submit",
            "-c",
            "launch.yaml",
            "-n",
            "8",
            "--watch",
            "--log-level",
            "debug",
        ])
        .expect("valid args");

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Submit(args) => {
                assert_eq!(args.shard.config, PathBuf::from("launch.yaml"));
                assert_eq!(args.shard.shards, Some(8));
                assert!(args.watch);
                assert!(!args.dry_run);
            }
            _ => panic!("expected submit"),
        }
    }

    #[test]
    fn test_parse_watch() {
        let cli = Cli::try_parse_from([
            "shard-launch",
            "watch",
            "job-123",
            "--api-base",
            "http://localhost:8080",
            "--poll-interval",
            "5",
            "--max-wait",
            "60",
        ])
        .expect("valid args");

        match cli.command {
            Commands::Watch(args) => {
                assert_eq!(args.handle, "job-123");
                assert_eq!(args.backend.api_base.as_deref(), Some("http://localhost:8080"));
                assert_eq!(args.poll_interval, Some(5));
                assert_eq!(args.max_wait, Some(60));
                assert_eq!(args.from_offset, 0);
            }
            _ => panic!("expected watch"),
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(&Outcome::Success), 0);
        assert_eq!(exit_code_for(&Outcome::Failure { exit_code: 2 }), 2);
        assert_eq!(exit_code_for(&Outcome::Failure { exit_code: -9 }), 1);
        assert_eq!(exit_code_for(&Outcome::Failure { exit_code: 300 }), 255);
        assert_eq!(exit_code_for(&Outcome::Timeout), EXIT_TIMEOUT);
    }

    #[test]
    fn test_local_submit_always_watches() {
        assert!(must_watch(false, &BackendConfig::Local));
        assert!(must_watch(true, &BackendConfig::Local));

        let http = BackendConfig::Http {
            api_base: "http://localhost:8080".to_string(),
            token_env: "SHARD_LAUNCH_API_TOKEN".to_string(),
            request_timeout_secs: 30,
        };
        assert!(!must_watch(false, &http));
        assert!(must_watch(true, &http));
    }

    #[test]
    fn test_watch_rejects_local_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("local.yaml");
        std::fs::write(
            &path,
            "name: local-run\njob: { image: none }\nshards: { total_items: 4, count: 2 }\n\
             stages: [{ command: \"echo {{ start }}\" }]\n",
        )
        .expect("write config");

        let args = BackendArgs {
            config: Some(path),
            api_base: None,
            api_token: None,
        };
        let err = match resolve_backend(&args) {
            Ok(_) => panic!("local config must be rejected"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("local backend"));
    }

    #[test]
    fn test_resolve_backend_requires_source() {
        let args = BackendArgs {
            config: None,
            api_base: None,
            api_token: None,
        };
        assert!(resolve_backend(&args).is_err());

        let args = BackendArgs {
            config: None,
            api_base: Some("http://localhost:8080".to_string()),
            api_token: None,
        };
        let (backend, options) = resolve_backend(&args).expect("http backend");
        assert_eq!(backend.name(), "http");
        assert_eq!(options, WatchOptions::default());
    }
}
