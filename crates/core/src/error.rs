//! Error type shared by the launcher models.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the shared launcher models.
#[derive(Debug, Error)]
pub enum SjsError {
    /// No supervised run has been started in the directory.
    #[error(
        "currently there is no run started (no {marker} file in {}); are you in the correct directory?",
        dir.display()
    )]
    RunNotFound {
        /// Marker file name that was looked for.
        marker: &'static str,
        /// Directory that was searched.
        dir: PathBuf,
    },

    /// A persisted environment record does not exist.
    #[error("env record not found: {}", .0.display())]
    EnvRecordNotFound(PathBuf),

    /// A persisted environment record could not be parsed.
    #[error("env record {} is corrupt: {source}", path.display())]
    EnvRecordParse {
        /// Record path.
        path: PathBuf,
        /// Underlying YAML error.
        #[source]
        source: serde_yaml::Error,
    },

    /// The configuration file could not be parsed.
    #[error("config {} could not be parsed: {source}", path.display())]
    ConfigParse {
        /// Config path.
        path: PathBuf,
        /// Underlying YAML error.
        #[source]
        source: serde_yaml::Error,
    },

    /// The configuration parsed but holds unusable values.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Filesystem failure with the path that triggered it.
    #[error("{action} {}: {source}", path.display())]
    Io {
        /// What was being attempted, e.g. "read".
        action: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl SjsError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }
}

/// Result alias for the shared models.
pub type Result<T> = std::result::Result<T, SjsError>;
