use std::path::PathBuf;

use sjs_core::SjsError;
use thiserror::Error;

/// Fatal launch failures. Each one ends the launch with a non-zero exit.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// A pre-worker check failed.
    #[error("pre-checks failed: {0:#}")]
    PreCheck(anyhow::Error),

    /// No run has been started in the invocation directory.
    #[error(transparent)]
    RunNotFound(SjsError),

    /// This node's environment differs from the one the run started with.
    #[error(
        "env record of this machine does not match env record of original machine \
         ({differing} differing entries); compare {} with {} manually",
        current.display(),
        reference.display()
    )]
    EnvMismatch {
        /// Record written for this launch.
        current: PathBuf,
        /// Record written when the run was started.
        reference: PathBuf,
        /// Number of differing keys.
        differing: usize,
    },

    /// An env record could not be written or read.
    #[error("env record: {0}")]
    EnvRecord(SjsError),

    /// A log file could not be opened or a worker process could not start.
    #[error("failed to launch worker #{index} (log {}): {source}", log.display())]
    Spawn {
        /// Worker index within the batch.
        index: usize,
        /// Log file of that worker.
        log: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Waiting on a worker process failed.
    #[error("waiting for worker pid {pid}: {source}")]
    Wait {
        /// Process id.
        pid: u32,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl From<SjsError> for LaunchError {
    fn from(e: SjsError) -> Self {
        match e {
            SjsError::RunNotFound { .. } => Self::RunNotFound(e),
            other => Self::EnvRecord(other),
        }
    }
}
