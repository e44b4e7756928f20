//! Launcher configuration, loaded once from YAML before the pool starts.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SjsError};

/// Top-level configuration file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SjsConfig {
    /// Queue backend connection.
    pub redis: RedisConfig,
    /// Name of the queue the workers consume.
    pub queue: String,
    /// Stop taking new jobs once less walltime than this remains.
    #[serde(default)]
    pub min_seconds_per_job: Option<u64>,
    /// Worker program override.
    #[serde(default)]
    pub worker: WorkerCommandConfig,
    /// Shell command printing the remaining walltime on its last line.
    #[serde(default = "default_walltime_command")]
    pub walltime_command: String,
    /// Interpreter inspected when recording the environment.
    #[serde(default = "default_python")]
    pub python: String,
}

/// Redis connection parameters.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RedisConfig {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    #[serde(default = "default_redis_port")]
    pub port: u16,
    /// Database index.
    #[serde(default)]
    pub db: u32,
}

/// Program used to start one queue worker.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerCommandConfig {
    /// Executable, resolved through `PATH`.
    #[serde(default = "default_worker_program")]
    pub program: String,
    /// Extra arguments appended after the queue name.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for WorkerCommandConfig {
    fn default() -> Self {
        Self {
            program: default_worker_program(),
            args: Vec::new(),
        }
    }
}

fn default_walltime_command() -> String {
    "qstat -i $PBS_JOBID".to_string()
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_worker_program() -> String {
    "rq".to_string()
}

impl RedisConfig {
    /// Connection URL in the form `redis://host:port/db`.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

impl SjsConfig {
    /// Reads and parses a YAML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).map_err(|e| SjsError::io("read", path, e))?;
        Self::from_yaml(&s).map_err(|source| SjsError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parses config text.
    pub fn from_yaml(s: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(s)
    }

    /// Rejects values that would make the worker command or the walltime
    /// policy meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.queue.trim().is_empty() {
            return Err(SjsError::InvalidConfig("queue name is empty".into()));
        }
        if self.redis.host.trim().is_empty() {
            return Err(SjsError::InvalidConfig("redis.host is empty".into()));
        }
        if self.redis.port == 0 {
            return Err(SjsError::InvalidConfig("redis.port must be non-zero".into()));
        }
        if self.min_seconds_per_job == Some(0) {
            return Err(SjsError::InvalidConfig(
                "min_seconds_per_job must be positive when set".into(),
            ));
        }
        if self.worker.program.trim().is_empty() {
            return Err(SjsError::InvalidConfig("worker.program is empty".into()));
        }
        Ok(())
    }

    /// Full worker argv: `{program} worker -u {url} {queue} {args...}`.
    pub fn worker_argv(&self) -> (String, Vec<String>) {
        let mut args = vec![
            "worker".to_string(),
            "-u".to_string(),
            self.redis.url(),
            self.queue.clone(),
        ];
        args.extend(self.worker.args.iter().cloned());
        (self.worker.program.clone(), args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "redis:\n  host: node01\n  port: 6380\n  db: 2\nqueue: jobs\n";

    #[test]
    fn defaults_fill_optional_fields() {
        let cfg = SjsConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(cfg.min_seconds_per_job, None);
        assert_eq!(cfg.worker.program, "rq");
        assert_eq!(cfg.walltime_command, "qstat -i $PBS_JOBID");
        assert_eq!(cfg.python, "python3");
        cfg.validate().unwrap();
    }

    #[test]
    fn worker_argv_includes_url_and_queue() {
        let mut cfg = SjsConfig::from_yaml(MINIMAL).unwrap();
        cfg.worker.args = vec!["--with-scheduler".into()];
        let (program, args) = cfg.worker_argv();
        assert_eq!(program, "rq");
        assert_eq!(
            args,
            vec!["worker", "-u", "redis://node01:6380/2", "jobs", "--with-scheduler"]
        );
    }

    #[test]
    fn rejects_zero_min_seconds() {
        let mut cfg = SjsConfig::from_yaml(MINIMAL).unwrap();
        cfg.min_seconds_per_job = Some(0);
        assert!(matches!(cfg.validate(), Err(SjsError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_empty_queue() {
        let mut cfg = SjsConfig::from_yaml(MINIMAL).unwrap();
        cfg.queue = "  ".into();
        assert!(cfg.validate().is_err());
    }
}
