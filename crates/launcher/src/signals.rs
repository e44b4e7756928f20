//! Shutdown requests from outside and interrupts sent to the workers.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cancellation driven by SIGINT/SIGTERM delivered to the supervisor.
pub struct ShutdownSignal {
    token: CancellationToken,
    listener: Option<JoinHandle<()>>,
}

impl ShutdownSignal {
    /// Registers SIGINT and SIGTERM listeners and cancels the token on the
    /// first one received.
    ///
    /// Tokio keeps its handler installed for the life of the process, so
    /// once the listener is gone further interrupts (including the ones
    /// the supervisor sends to its own process group) are absorbed.
    #[cfg(unix)]
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let token = CancellationToken::new();
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        let cancel = token.clone();
        let listener = tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM, exiting"),
                _ = sigint.recv() => tracing::info!("received SIGINT, exiting"),
            }
            cancel.cancel();
        });

        Ok(Self {
            token,
            listener: Some(listener),
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> std::io::Result<Self> {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let listener = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received Ctrl-C, exiting");
                cancel.cancel();
            }
        });
        Ok(Self {
            token,
            listener: Some(listener),
        })
    }

    /// Shutdown driven only through `token`.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            listener: None,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stops reacting to signals. Idempotent.
    pub fn disarm(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

impl Drop for ShutdownSignal {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Delivers interrupts to workers.
///
/// Workers trap their own interrupt: the first one asks for a warm stop
/// after the current job, the second forces an immediate stop.
pub trait TerminationBroadcaster: Send + Sync {
    /// Interrupts every process in the supervisor's process group.
    fn interrupt_group(&self) -> std::io::Result<()>;

    /// Interrupts one worker.
    fn interrupt_worker(&self, pid: u32) -> std::io::Result<()>;
}

/// Sends SIGINT with `killpg`/`kill`. A target that already exited is not
/// an error.
#[cfg(unix)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessGroupBroadcaster;

#[cfg(unix)]
impl TerminationBroadcaster for ProcessGroupBroadcaster {
    fn interrupt_group(&self) -> std::io::Result<()> {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::getpgrp;

        tolerate_gone(killpg(getpgrp(), Signal::SIGINT), "process group")
    }

    fn interrupt_worker(&self, pid: u32) -> std::io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        #[allow(clippy::cast_possible_wrap)]
        let target = Pid::from_raw(pid as i32);
        tolerate_gone(kill(target, Signal::SIGINT), "worker")
    }
}

#[cfg(unix)]
fn tolerate_gone(res: nix::Result<()>, what: &'static str) -> std::io::Result<()> {
    match res {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) => {
            tracing::debug!(target_kind = what, "already exited");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Process groups do not exist here; every call fails.
#[cfg(not(unix))]
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessGroupBroadcaster;

#[cfg(not(unix))]
impl TerminationBroadcaster for ProcessGroupBroadcaster {
    fn interrupt_group(&self) -> std::io::Result<()> {
        Err(std::io::ErrorKind::Unsupported.into())
    }

    fn interrupt_worker(&self, _pid: u32) -> std::io::Result<()> {
        Err(std::io::ErrorKind::Unsupported.into())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn interrupting_exited_worker_is_ok() {
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        ProcessGroupBroadcaster.interrupt_worker(pid).unwrap();
    }

    #[tokio::test]
    async fn interrupt_stops_worker() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        ProcessGroupBroadcaster.interrupt_worker(pid).unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }

    #[test]
    fn disarm_is_idempotent() {
        let mut shutdown = ShutdownSignal::from_token(CancellationToken::new());
        shutdown.disarm();
        shutdown.disarm();
        assert!(!shutdown.is_requested());
    }
}
