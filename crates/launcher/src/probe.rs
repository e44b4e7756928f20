//! Queries against the shared queue backend and the batch scheduler.

use std::process::Stdio;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use sjs_core::SjsConfig;
use thiserror::Error;
use tokio::sync::OnceCell;

const WORKERS_KEY: &str = "rq:workers";
const WORKER_KEY_PREFIX: &str = "rq:worker:";
const QUEUE_KEY_PREFIX: &str = "rq:queue:";

/// State a worker reports to the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
    Started,
    Suspended,
    Other(String),
}

impl WorkerState {
    pub fn parse(s: &str) -> Self {
        match s {
            "idle" => Self::Idle,
            "busy" => Self::Busy,
            "started" => Self::Started,
            "suspended" => Self::Suspended,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A registered worker and its last reported state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisteredWorker {
    pub name: String,
    pub state: WorkerState,
}

/// Failure to read backend or scheduler state. Never fatal.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("queue backend: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("walltime command: {0}")]
    Command(#[from] std::io::Error),
    #[error("walltime command exited with {status}: {stderr}")]
    CommandFailed { status: std::process::ExitStatus, stderr: String },
    #[error("walltime unavailable: cannot parse {0:?}")]
    Unparseable(String),
}

/// Worker liveness, queue depth and remaining allocation time.
#[async_trait]
pub trait QueueProbe: Send + Sync {
    /// Registered workers whose name starts with `host`.
    async fn workers_for_host(&self, host: &str) -> Result<Vec<RegisteredWorker>, ProbeError>;

    /// Jobs waiting in the queue.
    async fn pending_job_count(&self) -> Result<u64, ProbeError>;

    /// Seconds left in the current batch allocation. An error means the
    /// value is unavailable this cycle.
    async fn remaining_walltime_seconds(&self) -> Result<u64, ProbeError>;
}

/// Reads the RQ key layout from Redis and asks the scheduler for walltime.
pub struct RedisQueueProbe {
    client: redis::Client,
    conn: OnceCell<MultiplexedConnection>,
    queue: String,
    walltime_command: String,
}

impl RedisQueueProbe {
    /// Builds the probe; no connection is opened until the first query.
    pub fn new(config: &SjsConfig) -> Result<Self, ProbeError> {
        Ok(Self {
            client: redis::Client::open(config.redis.url())?,
            conn: OnceCell::new(),
            queue: config.queue.clone(),
            walltime_command: config.walltime_command.clone(),
        })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, ProbeError> {
        let conn = self
            .conn
            .get_or_try_init(|| self.client.get_multiplexed_async_connection())
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl QueueProbe for RedisQueueProbe {
    async fn workers_for_host(&self, host: &str) -> Result<Vec<RegisteredWorker>, ProbeError> {
        let mut conn = self.conn().await?;
        let mut keys: Vec<String> = conn.smembers(WORKERS_KEY).await?;
        keys.sort();

        let mut out = Vec::new();
        for key in keys {
            let name = key.strip_prefix(WORKER_KEY_PREFIX).unwrap_or(&key);
            if !name.starts_with(host) {
                continue;
            }
            let state: Option<String> = conn.hget(&key, "state").await?;
            out.push(RegisteredWorker {
                name: name.to_string(),
                state: WorkerState::parse(state.as_deref().unwrap_or("")),
            });
        }
        Ok(out)
    }

    async fn pending_job_count(&self) -> Result<u64, ProbeError> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.llen(format!("{QUEUE_KEY_PREFIX}{}", self.queue)).await?;
        Ok(len)
    }

    async fn remaining_walltime_seconds(&self) -> Result<u64, ProbeError> {
        let out = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.walltime_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;
        if !out.status.success() {
            return Err(ProbeError::CommandFailed {
                status: out.status,
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        let text = String::from_utf8_lossy(&out.stdout);
        parse_remaining_walltime(&text).ok_or_else(|| ProbeError::Unparseable(text.trim().to_string()))
    }
}

/// Seconds from the `H:M:S` field ending the last non-empty line.
pub fn parse_remaining_walltime(output: &str) -> Option<u64> {
    let line = output.lines().rev().find(|l| !l.trim().is_empty())?;
    let field = line.split_whitespace().last()?;
    let mut parts = field.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: u64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || minutes >= 60 || seconds >= 60 {
        return None;
    }
    Some(hours * 3600 + minutes * 60 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_last_line_of_qstat_output() {
        let out = "\nJob ID    Username Queue    Jobname  Req'd  Elap\n\
                   --------- -------- -------- -------- ------ -----\n\
                   12345.srv alice    batch    sjs      24:00  R 01:02:03\n\n";
        assert_eq!(parse_remaining_walltime(out), Some(3723));
    }

    #[test]
    fn hours_may_exceed_two_digits() {
        assert_eq!(parse_remaining_walltime("remaining 120:00:01"), Some(432_001));
    }

    #[test]
    fn unparseable_output_is_unavailable() {
        assert_eq!(parse_remaining_walltime(""), None);
        assert_eq!(parse_remaining_walltime("qstat: Unknown Job Id"), None);
        assert_eq!(parse_remaining_walltime("00:61:00"), None);
        assert_eq!(parse_remaining_walltime("1:2:3:4"), None);
    }

    #[test]
    fn worker_states() {
        assert_eq!(WorkerState::parse("idle"), WorkerState::Idle);
        assert_eq!(WorkerState::parse("busy"), WorkerState::Busy);
        assert_eq!(
            WorkerState::parse("rebooting"),
            WorkerState::Other("rebooting".into())
        );
    }

    #[tokio::test]
    async fn walltime_from_shell_command() {
        let mut cfg = SjsConfig::from_yaml("redis: {host: localhost}\nqueue: q\n").unwrap();
        cfg.walltime_command = "printf 'header\\n00:05:00\\n'".into();
        let probe = RedisQueueProbe::new(&cfg).unwrap();
        assert_eq!(probe.remaining_walltime_seconds().await.unwrap(), 300);

        cfg.walltime_command = "exit 3".into();
        let probe = RedisQueueProbe::new(&cfg).unwrap();
        assert!(matches!(
            probe.remaining_walltime_seconds().await,
            Err(ProbeError::CommandFailed { .. })
        ));
    }
}
