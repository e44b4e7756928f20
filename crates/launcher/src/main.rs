#![forbid(unsafe_code)]

//! `sjs_launch_workers`: start queue workers on this node and supervise
//! them until the queue drains, walltime runs out, or the launcher is
//! interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sjs_core::{LaunchStamp, SjsConfig};
use sjs_launcher::checks::BackendPreChecks;
use sjs_launcher::environment::LocalEnvironment;
use sjs_launcher::pool::ProcessSpawner;
use sjs_launcher::probe::{QueueProbe, RedisQueueProbe};
use sjs_launcher::signals::{ProcessGroupBroadcaster, ShutdownSignal};
use sjs_launcher::{Collaborators, LaunchOptions, LaunchReport, Supervisor};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sjs_launch_workers", version, about = "Launch and supervise queue workers on this node")]
struct Cli {
    /// Number of workers to start.
    #[arg(default_value_t = 1)]
    num_workers: usize,

    /// Exit once every worker is idle and the queue is empty (default).
    #[arg(short = 'b', long, overrides_with = "stay_alive")]
    burst: bool,

    /// Keep workers alive until the launcher is killed.
    #[arg(long, overrides_with = "burst")]
    stay_alive: bool,

    /// Run pre-worker checks (default).
    #[arg(long, overrides_with = "skip_pre_checks")]
    run_pre_checks: bool,

    #[arg(long, overrides_with = "run_pre_checks")]
    skip_pre_checks: bool,

    /// Compare this node's env record with the run's (default).
    #[arg(long, overrides_with = "skip_env_checks")]
    run_env_checks: bool,

    #[arg(long, overrides_with = "run_env_checks")]
    skip_env_checks: bool,

    /// Update interval in seconds.
    #[arg(short = 'n', long, default_value_t = 60)]
    interval: u64,

    /// Launcher config file.
    #[arg(long, default_value = "sjs.yaml")]
    config: PathBuf,

    /// Directory for worker log files.
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Log level (env-filter syntax).
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::new(&cli.log))
        .init();

    match run(cli).await {
        Ok(report) => {
            info!(cause = ?report.cause, "all done");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<LaunchReport> {
    let shutdown = ShutdownSignal::install().context("installing signal handlers")?;

    let config = SjsConfig::load(&cli.config)?;
    let run_dir = std::env::current_dir().context("current directory")?;
    let stamp = LaunchStamp::now(hostname()?);

    let mut options = LaunchOptions::new(run_dir, stamp);
    options.num_workers = cli.num_workers;
    options.burst = cli.burst || !cli.stay_alive;
    options.run_pre_checks = cli.run_pre_checks || !cli.skip_pre_checks;
    options.run_env_checks = cli.run_env_checks || !cli.skip_env_checks;
    options.interval = Duration::from_secs(cli.interval);
    options.log_dir = cli.log_dir;

    let probe: Arc<dyn QueueProbe> = Arc::new(RedisQueueProbe::new(&config)?);
    let deps = Collaborators {
        checks: Arc::new(BackendPreChecks::new(config.clone(), Arc::clone(&probe))),
        environment: Arc::new(LocalEnvironment::new(config.python.clone())),
        spawner: Arc::new(ProcessSpawner),
        probe,
        broadcaster: Arc::new(ProcessGroupBroadcaster),
    };

    let log_dir = options.log_dir.clone();
    let report = Supervisor::new(options, config, deps).run(shutdown).await?;

    // Best-effort: the launch already finished.
    match report.write_json(&log_dir) {
        Ok(path) => info!(path = %path.display(), "launch report written"),
        Err(e) => warn!(error = %e, "failed to write launch report"),
    }
    Ok(report)
}

#[cfg(unix)]
fn hostname() -> Result<String> {
    let name = nix::unistd::gethostname().context("hostname")?;
    Ok(name.to_string_lossy().into_owned())
}

#[cfg(not(unix))]
fn hostname() -> Result<String> {
    std::env::var("COMPUTERNAME").context("hostname")
}
