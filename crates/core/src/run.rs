//! Locating the supervised run this launch belongs to.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::error::{Result, SjsError};

/// Marker file written by the run initializer.
pub const RUNNING_MARKER: &str = "sjs_running";

const ENV_RECORD_DIR: &str = "env_records";
const REFERENCE_ENV_RECORD: &str = "env_record_start.yaml";

/// Host and wall-clock time identifying one launch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchStamp {
    /// Host the workers run on.
    pub host: String,
    /// `%Y_%m_%d__%H_%M_%S` in local time.
    pub timestamp: String,
}

impl LaunchStamp {
    /// Stamp for `host` at the current local time.
    pub fn now(host: impl Into<String>) -> Self {
        Self::at(host, Local::now())
    }

    /// Stamp for `host` at `when`.
    pub fn at(host: impl Into<String>, when: DateTime<Local>) -> Self {
        Self {
            host: host.into(),
            timestamp: when.format("%Y_%m_%d__%H_%M_%S").to_string(),
        }
    }

    /// `{host}_{timestamp}`, shared by log and record file names.
    pub fn prefix(&self) -> String {
        format!("{}_{}", self.host, self.timestamp)
    }
}

/// An initialized run: where it lives and who is launching into it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunContext {
    /// Run working directory.
    pub working_dir: PathBuf,
    /// Launching host.
    pub host: String,
    /// Launch timestamp.
    pub timestamp: String,
}

impl RunContext {
    /// Resolves the run started in `dir`.
    ///
    /// The marker's trimmed content names the working directory; relative
    /// paths are taken from `dir` and empty content means `dir` itself.
    pub fn resolve(dir: &Path, stamp: &LaunchStamp) -> Result<Self> {
        let marker = dir.join(RUNNING_MARKER);
        let content = match std::fs::read_to_string(&marker) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SjsError::RunNotFound {
                    marker: RUNNING_MARKER,
                    dir: dir.to_path_buf(),
                })
            }
            Err(e) => return Err(SjsError::io("read", marker, e)),
        };

        let named = content.trim();
        let working_dir = if named.is_empty() {
            dir.to_path_buf()
        } else {
            dir.join(named)
        };

        tracing::debug!(marker = %marker.display(), working_dir = %working_dir.display(), "run context resolved");

        Ok(Self {
            working_dir,
            host: stamp.host.clone(),
            timestamp: stamp.timestamp.clone(),
        })
    }

    /// Directory holding every env record of the run.
    pub fn env_record_dir(&self) -> PathBuf {
        self.working_dir.join(ENV_RECORD_DIR)
    }

    /// Record for this launch: `env_records/{host}_{timestamp}.yaml`.
    pub fn env_record_path(&self) -> PathBuf {
        self.env_record_dir()
            .join(format!("{}_{}.yaml", self.host, self.timestamp))
    }

    /// Record taken when the run was started.
    pub fn reference_env_record_path(&self) -> PathBuf {
        self.env_record_dir().join(REFERENCE_ENV_RECORD)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn stamp_format() {
        let when = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 1).unwrap();
        let stamp = LaunchStamp::at("n042", when);
        assert_eq!(stamp.timestamp, "2024_03_07__09_05_01");
        assert_eq!(stamp.prefix(), "n042_2024_03_07__09_05_01");
    }
}
