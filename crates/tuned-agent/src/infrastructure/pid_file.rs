use core::error::Error;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;

#[derive(Debug, derive_more::Display)]
pub enum PidFileError {
    #[display("Failed to create run directory '{}'", path.display())]
    CreateDirFailed { path: PathBuf },
    #[display("Failed to write pid file '{}'", path.display())]
    WriteFailed { path: PathBuf },
}

impl Error for PidFileError {}

/// Record the agent's own PID at `path`, creating the parent directory.
pub fn write_pid_file(path: &Path) -> Result<(), Report<PidFileError>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).change_context(PidFileError::CreateDirFailed {
            path: parent.to_path_buf(),
        })?;
    }

    let pid = std::process::id();
    std::fs::write(path, pid.to_string()).change_context(PidFileError::WriteFailed {
        path: path.to_path_buf(),
    })?;
    debug!("Wrote PID {pid} to {}", path.display());
    Ok(())
}
