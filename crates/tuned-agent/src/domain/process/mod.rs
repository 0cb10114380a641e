use core::error::Error;

use error_stack::Report;

pub mod supervisor;

pub use supervisor::DaemonCommand;
pub use supervisor::ExitOutcome;
pub use supervisor::TunedSupervisor;

/// Errors raised while managing the tuning daemon process.
#[derive(Debug, derive_more::Display)]
pub enum SupervisorError {
    #[display("Failed to start {program}")]
    StartFailed { program: String },
    #[display("Failed to send {signal} to PID {pid}")]
    SignalFailed { signal: String, pid: i32 },
    #[display("Failed to acknowledge shutdown to the control client")]
    AckFailed,
}

impl Error for SupervisorError {}

/// Control over the tuning daemon used by the reconciliation action.
pub trait DaemonControl {
    /// Ask the daemon to re-read its configuration, starting it if it is not running.
    ///
    /// # Errors
    ///
    /// - [`SupervisorError::StartFailed`] if the daemon had to be started and could not be
    /// - [`SupervisorError::SignalFailed`] if the reload signal could not be delivered
    fn reload(&mut self) -> Result<(), Report<SupervisorError>>;
}
