use core::error::Error;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;
use tracing::warn;

use crate::domain::process::supervisor::STOP_ACK;

/// Command asking the agent to stop the daemon and exit.
pub const STOP_COMMAND: &[u8] = b"stop";

#[derive(Debug, derive_more::Display)]
pub enum ControlError {
    #[display("Cannot create listener on {}", path.display())]
    BindFailed { path: PathBuf },
    #[display("Connection accept error")]
    AcceptFailed,
    #[display("Failed to read a control command")]
    ReadFailed,
    #[display("Cannot connect to {}", path.display())]
    ConnectFailed { path: PathBuf },
    #[display("Unexpected reply from the agent: {reply:?}")]
    UnexpectedReply { reply: String },
    #[display("Timed out waiting for the agent")]
    Timeout,
}

impl Error for ControlError {}

/// Local control channel listener.
///
/// Connections are accepted on a background task and handed over through a one-slot
/// channel, so the loop sees at most one pending client at a time. The task is aborted
/// and the socket file removed when the listener is dropped.
pub struct ControlSocket {
    path: PathBuf,
    connections: mpsc::Receiver<io::Result<UnixStream>>,
    accept_task: JoinHandle<()>,
}

impl ControlSocket {
    /// Bind the control socket at `path`, replacing a stale socket file.
    ///
    /// # Errors
    ///
    /// - [`ControlError::BindFailed`] if the socket cannot be created
    pub fn bind(path: &Path) -> Result<Self, Report<ControlError>> {
        let bind_failed = || ControlError::BindFailed {
            path: path.to_path_buf(),
        };

        match std::fs::remove_file(path) {
            Ok(()) => debug!("Removed stale control socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Report::new(e).change_context(bind_failed())),
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).change_context_lazy(bind_failed)?;
        }
        let listener = UnixListener::bind(path).change_context_lazy(bind_failed)?;

        let (tx, connections) = mpsc::channel(1);
        let accept_task = tokio::spawn(async move {
            loop {
                let accepted = listener.accept().await.map(|(stream, _)| stream);
                if tx.send(accepted).await.is_err() {
                    return;
                }
            }
        });

        debug!("Listening for control commands on {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            connections,
            accept_task,
        })
    }

    /// Wait for the next client connection. Cancel safe.
    ///
    /// # Errors
    ///
    /// - [`ControlError::AcceptFailed`] if accepting a connection failed
    pub async fn accept(&mut self) -> Result<UnixStream, Report<ControlError>> {
        match self.connections.recv().await {
            Some(accepted) => accepted.change_context(ControlError::AcceptFailed),
            None => Err(Report::new(ControlError::AcceptFailed)
                .attach_printable("the accept task stopped")),
        }
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        self.accept_task.abort();
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Cannot remove control socket {}: {e}", self.path.display());
        }
    }
}

/// Read one command of at most [`STOP_COMMAND`]'s length from a client.
///
/// # Errors
///
/// - [`ControlError::ReadFailed`] if the read fails
/// - [`ControlError::Timeout`] if the client sends nothing within `read_timeout`
pub async fn read_command(
    stream: &mut UnixStream,
    read_timeout: Duration,
) -> Result<Vec<u8>, Report<ControlError>> {
    let mut buf = [0u8; STOP_COMMAND.len()];
    let read = timeout(read_timeout, stream.read(&mut buf))
        .await
        .map_err(|_| Report::new(ControlError::Timeout))?
        .change_context(ControlError::ReadFailed)?;
    Ok(buf[..read].to_vec())
}

/// Ask a running agent to stop its daemon, waiting for the acknowledgement that the
/// daemon has exited.
///
/// # Errors
///
/// - [`ControlError::ConnectFailed`] if no agent listens on `path`
/// - [`ControlError::UnexpectedReply`] if the agent replied with anything but the ack
/// - [`ControlError::Timeout`] if the exchange did not complete within `wait`
pub async fn request_stop(path: &Path, wait: Duration) -> Result<(), Report<ControlError>> {
    let exchange = async {
        let mut stream =
            UnixStream::connect(path)
                .await
                .change_context(ControlError::ConnectFailed {
                    path: path.to_path_buf(),
                })?;
        stream
            .write_all(STOP_COMMAND)
            .await
            .change_context(ControlError::ConnectFailed {
                path: path.to_path_buf(),
            })?;

        let mut reply = Vec::new();
        stream
            .read_to_end(&mut reply)
            .await
            .change_context(ControlError::ReadFailed)?;
        Ok::<_, Report<ControlError>>(reply)
    };

    let reply = timeout(wait, exchange)
        .await
        .map_err(|_| Report::new(ControlError::Timeout))??;
    if reply != STOP_ACK {
        warn!("Agent replied {:?} to stop", String::from_utf8_lossy(&reply));
        return Err(Report::new(ControlError::UnexpectedReply {
            reply: String::from_utf8_lossy(&reply).into_owned(),
        }));
    }
    Ok(())
}
