//! Capturing the environment record of the launching node.

use std::process::Stdio;

use async_trait::async_trait;
use sjs_core::EnvironmentSnapshot;
use tracing::debug;

/// Source of the environment snapshot taken at launch.
#[async_trait]
pub trait EnvironmentSource: Send + Sync {
    /// Gathers the current facts. Reads local state only.
    async fn capture(&self) -> EnvironmentSnapshot;
}

/// Inspects the host OS and the Python interpreter the workers run under.
#[derive(Clone, Debug)]
pub struct LocalEnvironment {
    python: String,
}

impl LocalEnvironment {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
        }
    }
}

#[async_trait]
impl EnvironmentSource for LocalEnvironment {
    async fn capture(&self) -> EnvironmentSnapshot {
        let mut snap = EnvironmentSnapshot::new();
        snap.insert("os", std::env::consts::OS);
        snap.insert("os.family", std::env::consts::FAMILY);
        snap.insert("arch", std::env::consts::ARCH);
        snap.insert("launcher.version", env!("CARGO_PKG_VERSION"));

        // Older interpreters print the version on stderr.
        if let Some(out) = run_capture(&self.python, &["--version"]).await {
            snap.insert("runtime.python", out.trim());
        }
        if let Some(freeze) = run_capture(&self.python, &["-m", "pip", "freeze"]).await {
            snap.add_pip_freeze(&freeze);
        }
        snap
    }
}

/// Stdout (or stderr when stdout is empty) of a successful command.
async fn run_capture(program: &str, args: &[&str]) -> Option<String> {
    let out = match tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
    {
        Ok(out) => out,
        Err(e) => {
            debug!(program, ?args, error = %e, "environment probe unavailable");
            return None;
        }
    };
    if !out.status.success() {
        debug!(program, ?args, status = ?out.status, "environment probe failed");
        return None;
    }
    let stdout = String::from_utf8_lossy(&out.stdout).to_string();
    if stdout.trim().is_empty() {
        Some(String::from_utf8_lossy(&out.stderr).to_string())
    } else {
        Some(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_interpreter_is_omitted() {
        let env = LocalEnvironment::new("definitely-not-a-python-binary");
        let snap = env.capture().await;
        assert_eq!(snap.get("os"), Some(std::env::consts::OS));
        assert_eq!(snap.get("runtime.python"), None);
        assert!(snap.iter().all(|(k, _)| !k.starts_with("package.")));
    }

    #[tokio::test]
    async fn capture_is_deterministic() {
        let env = LocalEnvironment::new("definitely-not-a-python-binary");
        assert_eq!(env.capture().await, env.capture().await);
    }
}
