//! Worker subprocesses and their log files.

use std::fs::File;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use sjs_core::LaunchStamp;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::LaunchError;

/// Program and argv used for every worker of a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Names worker logs `{dir}/{host}_{timestamp}_{index}.log`.
#[derive(Clone, Debug)]
pub struct LogTemplate {
    pub dir: PathBuf,
    pub stamp: LaunchStamp,
}

impl LogTemplate {
    pub fn path_for(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}_{index}.log", self.stamp.prefix()))
    }

    /// Glob-style pattern printed for operators.
    pub fn pattern(&self) -> String {
        self.dir
            .join(format!("{}_*.log", self.stamp.prefix()))
            .display()
            .to_string()
    }
}

/// The set of running workers, as seen by the supervisor.
#[async_trait]
pub trait WorkerGroup: Send {
    /// Process ids in spawn order.
    fn pids(&self) -> Vec<u32>;

    /// Blocks until every worker has exited. Safe to call again after the
    /// future was dropped.
    async fn wait_all(&mut self) -> Result<(), LaunchError>;

    /// Closes log files still open and returns how many were closed.
    fn close_logs(&mut self) -> usize;
}

/// Starts a batch of workers.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(
        &self,
        count: usize,
        command: &WorkerCommand,
        logs: &LogTemplate,
    ) -> Result<Box<dyn WorkerGroup>, LaunchError>;
}

/// Spawns real OS processes through [`WorkerPool::spawn`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessSpawner;

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(
        &self,
        count: usize,
        command: &WorkerCommand,
        logs: &LogTemplate,
    ) -> Result<Box<dyn WorkerGroup>, LaunchError> {
        let pool = WorkerPool::spawn(count, command, logs).await?;
        Ok(Box::new(pool))
    }
}

/// One spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    pub index: usize,
    pub pid: u32,
    pub log_path: PathBuf,
    pub started_at: DateTime<Local>,
    child: Child,
    log: Option<File>,
}

/// Workers started together; owns their processes and log files.
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<WorkerHandle>,
}

impl WorkerPool {
    /// Opens every log file, then starts `count` workers with stdout and
    /// stderr redirected into them.
    ///
    /// Log files are all opened before the first process starts. If a
    /// process fails to start, the workers already running are killed and
    /// reaped before the error is returned.
    pub async fn spawn(
        count: usize,
        command: &WorkerCommand,
        logs: &LogTemplate,
    ) -> Result<Self, LaunchError> {
        std::fs::create_dir_all(&logs.dir).map_err(|source| LaunchError::Spawn {
            index: 0,
            log: logs.dir.clone(),
            source,
        })?;

        let mut files = Vec::with_capacity(count);
        for index in 0..count {
            let path = logs.path_for(index);
            let file = File::create(&path).map_err(|source| LaunchError::Spawn {
                index,
                log: path.clone(),
                source,
            })?;
            files.push((path, file));
        }

        let mut handles: Vec<WorkerHandle> = Vec::with_capacity(count);
        for (index, (log_path, file)) in files.into_iter().enumerate() {
            info!(index, log = %log_path.display(), "launching worker");
            // `id()` is only `None` once the child has been reaped
            let started = start(command, &file).and_then(|child| match child.id() {
                Some(pid) => Ok((child, pid)),
                None => Err(std::io::Error::other("worker exited before its pid was read")),
            });
            match started {
                Ok((child, pid)) => handles.push(WorkerHandle {
                    index,
                    pid,
                    log_path,
                    started_at: Local::now(),
                    child,
                    log: Some(file),
                }),
                Err(source) => {
                    reap_partial(&mut handles).await;
                    return Err(LaunchError::Spawn {
                        index,
                        log: log_path,
                        source,
                    });
                }
            }
        }

        let pool = Self { handles };
        for h in pool.handles() {
            info!(
                index = h.index,
                pid = h.pid,
                started_at = %h.started_at.format("%H:%M:%S%.3f"),
                log = %h.log_path.display(),
                "worker started"
            );
        }
        info!(pids = ?pool.pids(), "workers started");
        Ok(pool)
    }

    pub fn handles(&self) -> &[WorkerHandle] {
        &self.handles
    }
}

fn start(command: &WorkerCommand, log: &File) -> std::io::Result<Child> {
    Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log.try_clone()?))
        .spawn()
}

/// Kills and waits on every worker of a batch that failed to start in
/// full. Returns how many were reaped.
async fn reap_partial(handles: &mut Vec<WorkerHandle>) -> usize {
    let mut reaped = 0;
    for h in handles.iter_mut() {
        warn!(index = h.index, pid = h.pid, "killing worker from failed batch");
        if let Err(e) = h.child.start_kill() {
            warn!(pid = h.pid, error = %e, "kill failed");
        }
        match h.child.wait().await {
            Ok(status) => {
                debug!(pid = h.pid, %status, "reaped worker");
                reaped += 1;
            }
            Err(e) => warn!(pid = h.pid, error = %e, "reap failed"),
        }
    }
    handles.clear();
    reaped
}

#[async_trait]
impl WorkerGroup for WorkerPool {
    fn pids(&self) -> Vec<u32> {
        self.handles.iter().map(|h| h.pid).collect()
    }

    async fn wait_all(&mut self) -> Result<(), LaunchError> {
        for h in self.handles.iter_mut() {
            let status = h
                .child
                .wait()
                .await
                .map_err(|source| LaunchError::Wait { pid: h.pid, source })?;
            info!(index = h.index, pid = h.pid, %status, "worker exited");
        }
        Ok(())
    }

    fn close_logs(&mut self) -> usize {
        let mut closed = 0;
        for h in self.handles.iter_mut() {
            if let Some(f) = h.log.take() {
                if let Err(e) = f.sync_all() {
                    warn!(log = %h.log_path.display(), error = %e, "log flush failed");
                }
                closed += 1;
            }
        }
        closed
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;

    use tempfile::TempDir;

    use super::*;

    fn template(dir: &Path) -> LogTemplate {
        LogTemplate {
            dir: dir.join("logs"),
            stamp: LaunchStamp {
                host: "n01".into(),
                timestamp: "2024_01_01__00_00_00".into(),
            },
        }
    }

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    #[tokio::test]
    async fn spawns_one_log_per_worker_and_captures_output() {
        let dir = TempDir::new().unwrap();
        let logs = template(dir.path());

        let mut pool = WorkerPool::spawn(3, &sh("echo out; echo err 1>&2"), &logs)
            .await
            .unwrap();
        assert_eq!(pool.pids().len(), 3);
        assert!(pool.pids().iter().all(|&pid| pid != 0));
        assert!(pool.handles().iter().enumerate().all(|(i, h)| h.index == i));

        pool.wait_all().await.unwrap();
        assert_eq!(pool.close_logs(), 3);
        assert_eq!(pool.close_logs(), 0);

        for i in 0..3 {
            let path = dir.path().join(format!("logs/n01_2024_01_01__00_00_00_{i}.log"));
            let text = std::fs::read_to_string(path).unwrap();
            assert!(text.contains("out"));
            assert!(text.contains("err"));
        }
    }

    #[tokio::test]
    async fn unopenable_log_spawns_nothing() {
        let dir = TempDir::new().unwrap();
        let logs = template(dir.path());
        std::fs::create_dir_all(&logs.dir).unwrap();
        // a directory where the second log file should go
        std::fs::create_dir(logs.path_for(1)).unwrap();
        let marker = dir.path().join("started");

        let cmd = sh(&format!("touch {}", marker.display()));
        let err = WorkerPool::spawn(2, &cmd, &logs).await.unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { index: 1, .. }));

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn failed_batch_kills_and_reaps_started_workers() {
        let dir = TempDir::new().unwrap();
        let logs = template(dir.path());
        std::fs::create_dir_all(&logs.dir).unwrap();
        let cmd = sh("sleep 30");

        let mut handles = Vec::new();
        for index in 0..2 {
            let log_path = logs.path_for(index);
            let file = File::create(&log_path).unwrap();
            let child = start(&cmd, &file).unwrap();
            handles.push(WorkerHandle {
                index,
                pid: child.id().unwrap(),
                log_path,
                started_at: Local::now(),
                child,
                log: Some(file),
            });
        }
        let pids: Vec<u32> = handles.iter().map(|h| h.pid).collect();

        let reaped = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            reap_partial(&mut handles),
        )
        .await
        .expect("sleeping workers were not killed");

        assert_eq!(reaped, 2);
        assert!(handles.is_empty());
        for pid in pids {
            // reaped children no longer exist, not even as zombies
            let gone = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None);
            assert_eq!(gone, Err(nix::errno::Errno::ESRCH));
        }
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let cmd = WorkerCommand {
            program: "definitely-not-a-worker-binary".into(),
            args: vec![],
        };
        let err = WorkerPool::spawn(2, &cmd, &template(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { index: 0, .. }));
    }
}
