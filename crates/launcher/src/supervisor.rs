//! Lifecycle of one launch: checks, environment verification, the worker
//! pool, the monitoring loop and shutdown.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sjs_core::{EnvironmentSnapshot, LaunchStamp, RunContext, SjsConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checks::PreChecks;
use crate::environment::EnvironmentSource;
use crate::error::LaunchError;
use crate::pool::{LogTemplate, WorkerCommand, WorkerGroup, WorkerSpawner};
use crate::probe::{QueueProbe, WorkerState};
use crate::signals::{ShutdownSignal, TerminationBroadcaster};

/// Delay between the two group interrupts. Workers debounce signals, so a
/// second interrupt sent too early can be lost; nothing guarantees this
/// value is long enough on a loaded node.
pub const SIGNAL_GAP: Duration = Duration::from_secs(1);

/// Lifecycle phases, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initializing,
    PreChecking,
    EnvVerifying,
    Running,
    Draining,
    Terminated,
}

/// Why the launch ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCause {
    /// Burst mode: every worker on this host idle and the queue empty.
    IdleAndEmpty,
    /// Less walltime left than one job needs.
    Walltime,
    /// Workers exited on their own.
    WorkersExited,
    /// SIGINT/SIGTERM reached the supervisor.
    Interrupted,
}

/// Command-line level settings for one launch.
#[derive(Clone, Debug)]
pub struct LaunchOptions {
    pub num_workers: usize,
    pub burst: bool,
    pub run_pre_checks: bool,
    pub run_env_checks: bool,
    pub interval: Duration,
    pub signal_gap: Duration,
    /// Directory searched for the run marker.
    pub run_dir: PathBuf,
    pub log_dir: PathBuf,
    pub stamp: LaunchStamp,
}

impl LaunchOptions {
    pub fn new(run_dir: PathBuf, stamp: LaunchStamp) -> Self {
        Self {
            num_workers: 1,
            burst: true,
            run_pre_checks: true,
            run_env_checks: true,
            interval: Duration::from_secs(60),
            signal_gap: SIGNAL_GAP,
            log_dir: run_dir.join("logs"),
            run_dir,
            stamp,
        }
    }
}

/// External capabilities the supervisor drives.
#[derive(Clone)]
pub struct Collaborators {
    pub checks: Arc<dyn PreChecks>,
    pub environment: Arc<dyn EnvironmentSource>,
    pub spawner: Arc<dyn WorkerSpawner>,
    pub probe: Arc<dyn QueueProbe>,
    pub broadcaster: Arc<dyn TerminationBroadcaster>,
}

/// Summary of a finished launch.
#[derive(Clone, Debug, Serialize)]
pub struct LaunchReport {
    pub host: String,
    pub timestamp: String,
    pub cause: StopCause,
    pub worker_pids: Vec<u32>,
    pub phases: Vec<Phase>,
    pub logs_closed: usize,
    pub env_record: Option<PathBuf>,
}

impl LaunchReport {
    /// Writes `{dir}/{host}_{timestamp}.launch.json`.
    pub fn write_json(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let path = dir.join(format!("{}_{}.launch.json", self.host, self.timestamp));
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}

pub struct Supervisor {
    options: LaunchOptions,
    config: SjsConfig,
    deps: Collaborators,
    phases: Vec<Phase>,
}

impl Supervisor {
    pub fn new(options: LaunchOptions, config: SjsConfig, deps: Collaborators) -> Self {
        Self {
            options,
            config,
            deps,
            phases: vec![Phase::Initializing],
        }
    }

    fn enter(&mut self, phase: Phase) {
        if self.phases.last() == Some(&phase) {
            return;
        }
        debug!(?phase, "entering phase");
        self.phases.push(phase);
    }

    /// Runs the launch to completion.
    ///
    /// Fatal preconditions return before any log file is opened or worker
    /// started. Once workers run, log files are closed on every path out.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> Result<LaunchReport, LaunchError> {
        let token = shutdown.token().clone();

        self.enter(Phase::PreChecking);
        if self.options.run_pre_checks {
            info!("running pre-checks");
            let checked = until_cancelled(&token, self.deps.checks.run()).await;
            match checked {
                Some(res) => res.map_err(LaunchError::PreCheck)?,
                None => return Ok(self.interrupted_before_spawn(None)),
            }
            info!("pre-checks OK");
        } else {
            warn!("skipping pre-checks");
        }

        let ctx = RunContext::resolve(&self.options.run_dir, &self.options.stamp)?;

        self.enter(Phase::EnvVerifying);
        let Some(env_record) = self.verify_environment(&ctx, &token).await? else {
            return Ok(self.interrupted_before_spawn(None));
        };

        if token.is_cancelled() {
            return Ok(self.interrupted_before_spawn(Some(env_record)));
        }

        let logs = LogTemplate {
            dir: self.options.log_dir.clone(),
            stamp: self.options.stamp.clone(),
        };
        self.announce(&logs, &env_record);

        self.enter(Phase::Running);
        let (program, args) = self.config.worker_argv();
        let command = WorkerCommand { program, args };
        let mut workers = self
            .deps
            .spawner
            .spawn(self.options.num_workers, &command, &logs)
            .await?;
        let pids = workers.pids();
        info!(?pids, "worker pids");

        let outcome = self.supervise(workers.as_mut(), &mut shutdown).await;
        let logs_closed = workers.close_logs();
        let cause = outcome?;

        self.enter(Phase::Terminated);
        info!(?cause, logs_closed, "all done");
        Ok(self.report(cause, pids, logs_closed, Some(env_record)))
    }

    fn interrupted_before_spawn(&mut self, env_record: Option<PathBuf>) -> LaunchReport {
        info!("shutdown requested before workers started");
        self.enter(Phase::Terminated);
        self.report(StopCause::Interrupted, Vec::new(), 0, env_record)
    }

    fn report(
        &self,
        cause: StopCause,
        worker_pids: Vec<u32>,
        logs_closed: usize,
        env_record: Option<PathBuf>,
    ) -> LaunchReport {
        LaunchReport {
            host: self.options.stamp.host.clone(),
            timestamp: self.options.stamp.timestamp.clone(),
            cause,
            worker_pids,
            phases: self.phases.clone(),
            logs_closed,
            env_record,
        }
    }

    fn announce(&self, logs: &LogTemplate, env_record: &Path) {
        info!(host = %self.options.stamp.host, timestamp = %self.options.stamp.timestamp, "launching workers");
        info!(template = %logs.pattern(), "log name template");
        info!(path = %env_record.display(), "env record path");
        if self.options.burst {
            info!("burst mode: workers and launcher exit when all workers are idle and the queue is empty");
        } else {
            info!("workers and launcher stay alive until killed");
        }
    }

    /// Persists this node's record, then compares it with the run's
    /// reference record unless env checks are disabled. `None` when
    /// shutdown was requested during the capture.
    async fn verify_environment(
        &self,
        ctx: &RunContext,
        token: &CancellationToken,
    ) -> Result<Option<PathBuf>, LaunchError> {
        let Some(current) = until_cancelled(token, self.deps.environment.capture()).await else {
            return Ok(None);
        };
        let current_path = ctx.env_record_path();
        current.persist(&current_path)?;

        if !self.options.run_env_checks {
            warn!("skipping env-checks");
            return Ok(Some(current_path));
        }

        info!("running env-checks");
        let reference_path = ctx.reference_env_record_path();
        let reference = EnvironmentSnapshot::load(&reference_path)?;
        if !current.equals(&reference) {
            let diff = current.diff(&reference);
            for d in &diff {
                warn!(key = %d.key, this_node = ?d.left, original = ?d.right, "env record differs");
            }
            return Err(LaunchError::EnvMismatch {
                current: current_path,
                reference: reference_path,
                differing: diff.len(),
            });
        }
        info!("env-checks OK");
        Ok(Some(current_path))
    }

    /// The loop only runs when there is a decision to make each cycle.
    fn monitoring_enabled(&self) -> bool {
        self.config.min_seconds_per_job.is_some() || !self.options.burst
    }

    async fn supervise(
        &mut self,
        workers: &mut dyn WorkerGroup,
        shutdown: &mut ShutdownSignal,
    ) -> Result<StopCause, LaunchError> {
        let stop = if self.monitoring_enabled() {
            let token = shutdown.token().clone();
            Some(self.monitor(&*workers, &token).await)
        } else {
            None
        };

        match stop {
            Some(cause @ (StopCause::IdleAndEmpty | StopCause::Interrupted)) => {
                self.abort(workers, shutdown).await?;
                Ok(cause)
            }
            Some(cause) => self.wait_or_abort(workers, shutdown, cause).await,
            None => {
                self.wait_or_abort(workers, shutdown, StopCause::WorkersExited)
                    .await
            }
        }
    }

    /// Polls every `interval` until a stop condition holds. Within a cycle
    /// the idle check runs before the walltime check.
    async fn monitor(&mut self, workers: &dyn WorkerGroup, token: &CancellationToken) -> StopCause {
        let host = self.options.stamp.host.clone();
        loop {
            tokio::select! {
                _ = token.cancelled() => return StopCause::Interrupted,
                _ = tokio::time::sleep(self.options.interval) => {}
            }

            if self.options.burst {
                match until_cancelled(token, self.host_idle_and_queue_empty(&host)).await {
                    None => return StopCause::Interrupted,
                    Some(true) => {
                        info!("all workers idle; queue is empty");
                        return StopCause::IdleAndEmpty;
                    }
                    Some(false) => {}
                }
            }

            if let Some(min_seconds) = self.config.min_seconds_per_job {
                let Some(walltime) =
                    until_cancelled(token, self.deps.probe.remaining_walltime_seconds()).await
                else {
                    return StopCause::Interrupted;
                };
                match walltime {
                    Ok(remaining) if remaining < min_seconds => {
                        info!(
                            remaining,
                            min_seconds,
                            "walltime remaining is less than the min seconds required per job; \
                             interrupting workers so they exit after their current job"
                        );
                        self.enter(Phase::Draining);
                        for pid in workers.pids() {
                            if let Err(e) = self.deps.broadcaster.interrupt_worker(pid) {
                                warn!(pid, error = %e, "failed to interrupt worker");
                            }
                        }
                        return StopCause::Walltime;
                    }
                    Ok(remaining) => debug!(remaining, "walltime remaining"),
                    Err(e) => warn!(error = %e, "failure getting walltime"),
                }
            }
        }
    }

    /// No registered worker on this host means nothing is busy.
    async fn host_idle_and_queue_empty(&self, host: &str) -> bool {
        let registered = match self.deps.probe.workers_for_host(host).await {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "failure listing workers");
                return false;
            }
        };
        let idle = registered
            .iter()
            .filter(|w| w.state == WorkerState::Idle)
            .count();
        debug!(registered = registered.len(), idle, "worker states");
        if idle != registered.len() {
            return false;
        }
        match self.deps.probe.pending_job_count().await {
            Ok(pending) => pending == 0,
            Err(e) => {
                warn!(error = %e, "failure reading queue length");
                false
            }
        }
    }

    async fn wait_or_abort(
        &mut self,
        workers: &mut dyn WorkerGroup,
        shutdown: &mut ShutdownSignal,
        cause: StopCause,
    ) -> Result<StopCause, LaunchError> {
        info!("waiting for workers to exit");
        let token = shutdown.token().clone();
        match until_cancelled(&token, workers.wait_all()).await {
            Some(Ok(())) => Ok(cause),
            Some(Err(e)) => {
                warn!(error = %e, "waiting for workers failed; interrupting process group");
                if let Err(abort_err) = self.abort(workers, shutdown).await {
                    warn!(error = %abort_err, "workers did not exit cleanly");
                }
                Err(e)
            }
            None => {
                self.abort(workers, shutdown).await?;
                Ok(StopCause::Interrupted)
            }
        }
    }

    /// Interrupts the whole process group twice, then waits for every
    /// worker. Signal handling is disarmed first, so this runs at most once.
    async fn abort(
        &mut self,
        workers: &mut dyn WorkerGroup,
        shutdown: &mut ShutdownSignal,
    ) -> Result<(), LaunchError> {
        shutdown.disarm();
        self.enter(Phase::Draining);
        info!("killing any workers");

        info!("sending first SIGINT");
        if let Err(e) = self.deps.broadcaster.interrupt_group() {
            warn!(error = %e, "first group interrupt failed");
        }
        tokio::time::sleep(self.options.signal_gap).await;
        info!("sending second SIGINT");
        if let Err(e) = self.deps.broadcaster.interrupt_group() {
            warn!(error = %e, "second group interrupt failed");
        }

        workers.wait_all().await
    }
}

/// Output of `fut`, or `None` once `token` is cancelled. Cancellation
/// wins when both are ready.
async fn until_cancelled<F: Future>(token: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        out = fut => Some(out),
    }
}
