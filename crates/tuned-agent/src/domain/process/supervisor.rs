use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;

use error_stack::Report;
use error_stack::ResultExt;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::DaemonControl;
use super::SupervisorError;

/// Reply written to a control client once the daemon has stopped.
pub const STOP_ACK: &[u8] = b"ok";

/// How to launch the tuning daemon.
#[derive(Debug, Clone)]
pub struct DaemonCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl DaemonCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

/// How the daemon process ended.
#[derive(Debug, derive_more::Display)]
pub enum ExitOutcome {
    #[display("exited with {_0}")]
    Exited(ExitStatus),
    #[display("exit could not be observed: {_0}")]
    Unobserved(String),
}

#[derive(Debug)]
struct RunningDaemon {
    pid: Pid,
    exit_rx: oneshot::Receiver<ExitOutcome>,
}

/// Owns the one tuning daemon child process.
///
/// The daemon's own output is passed through untouched: it timestamps its lines itself.
#[derive(Debug)]
pub struct TunedSupervisor {
    command: DaemonCommand,
    running: Option<RunningDaemon>,
    has_started: bool,
}

impl TunedSupervisor {
    pub fn new(command: DaemonCommand) -> Self {
        Self {
            command,
            running: None,
            has_started: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Whether the daemon was ever started successfully by this supervisor.
    pub fn has_started(&self) -> bool {
        self.has_started
    }

    pub fn pid(&self) -> Option<i32> {
        self.running.as_ref().map(|daemon| daemon.pid.as_raw())
    }

    /// Launch the daemon. Does nothing if it is already running.
    ///
    /// # Errors
    ///
    /// - [`SupervisorError::StartFailed`] if the process cannot be spawned
    pub fn start(&mut self) -> Result<(), Report<SupervisorError>> {
        if self.running.is_some() {
            return Ok(());
        }

        let program = self.command.program.display().to_string();
        info!("Starting {program}");

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .change_context(SupervisorError::StartFailed {
                program: program.clone(),
            })?;

        let Some(raw_pid) = child.id() else {
            return Err(Report::new(SupervisorError::StartFailed { program })
                .attach_printable("process exited before its PID could be read"));
        };
        let pid = Pid::from_raw(raw_pid as i32);

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) => ExitOutcome::Exited(status),
                Err(e) => ExitOutcome::Unobserved(e.to_string()),
            };
            if exit_tx.send(outcome).is_err() {
                debug!("Nobody is waiting for the exit of PID {pid}");
            }
        });

        info!("Started {program} with PID {pid}");
        self.running = Some(RunningDaemon { pid, exit_rx });
        self.has_started = true;
        Ok(())
    }

    /// Resolves once the tracked daemon exits, for whatever reason.
    ///
    /// Never resolves while no daemon is tracked. Cancel safe.
    pub async fn wait_exit(&mut self) -> ExitOutcome {
        let Some(daemon) = self.running.as_mut() else {
            return std::future::pending().await;
        };

        let outcome = (&mut daemon.exit_rx).await.unwrap_or_else(|_| {
            ExitOutcome::Unobserved("exit notifier dropped".to_string())
        });
        self.running = None;
        outcome
    }

    /// Terminate the daemon and wait until it has exited, so any tuning rollback it
    /// performs on shutdown is complete when this returns. No-op when nothing runs.
    pub async fn stop(&mut self) {
        let Some(daemon) = self.running.as_ref() else {
            debug!("Tuned is not running, nothing to stop");
            return;
        };
        let pid = daemon.pid;

        debug!("Sending SIGTERM to PID {pid}");
        match kill(pid, Signal::SIGTERM) {
            // already gone, the exit notification is on its way
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                error!("Cannot terminate PID {pid}: {e}");
                return;
            }
        }

        let outcome = self.wait_exit().await;
        info!("Tuned process terminated: {outcome}");
    }

    /// [`stop`](Self::stop), then acknowledge the completed shutdown to `ack`.
    ///
    /// # Errors
    ///
    /// - [`SupervisorError::AckFailed`] if the acknowledgement cannot be written
    pub async fn stop_with_ack<W>(&mut self, ack: &mut W) -> Result<(), Report<SupervisorError>>
    where
        W: AsyncWrite + Unpin,
    {
        self.stop().await;

        ack.write_all(STOP_ACK)
            .await
            .change_context(SupervisorError::AckFailed)?;
        ack.flush().await.change_context(SupervisorError::AckFailed)?;
        Ok(())
    }
}

impl DaemonControl for TunedSupervisor {
    fn reload(&mut self) -> Result<(), Report<SupervisorError>> {
        let Some(daemon) = self.running.as_ref() else {
            return self.start();
        };

        info!("Reloading tuned, sending SIGHUP to PID {}", daemon.pid);
        kill(daemon.pid, Signal::SIGHUP).change_context(SupervisorError::SignalFailed {
            signal: Signal::SIGHUP.as_str().to_string(),
            pid: daemon.pid.as_raw(),
        })
    }
}

impl Drop for TunedSupervisor {
    fn drop(&mut self) {
        if let Some(daemon) = &self.running {
            warn!("Supervisor dropped while tuned (PID {}) is still running", daemon.pid);
        }
    }
}

#[cfg(test)]
pub(crate) fn shell_daemon(script: &str) -> DaemonCommand {
    DaemonCommand::new("/bin/sh", vec!["-c".to_string(), script.to_string()])
}

/// Ignores SIGHUP, exits cleanly on SIGTERM.
#[cfg(test)]
pub(crate) const LONG_RUNNING: &str =
    "trap '' HUP; trap 'exit 0' TERM; while :; do sleep 0.1; done";
