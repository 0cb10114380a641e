use core::error::Error;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;

/// Capacity of the channel between the notify thread and the loop.
const EVENT_BUFFER: usize = 16;

#[derive(Debug, derive_more::Display)]
pub enum FsWatchError {
    #[display("Failed to create filesystem watcher")]
    CreateFailed,
    #[display("Failed to start watching {}", path.display())]
    WatchFailed { path: PathBuf },
    #[display("Error watching filesystem: {message}")]
    WatchError { message: String },
    #[display("Filesystem watcher stopped")]
    Closed,
}

impl Error for FsWatchError {}

/// Notifications forwarded from the notify thread.
#[derive(Debug)]
enum FsEvent {
    Removed(PathBuf),
    Error(String),
}

/// Reports removals of the watched profile files.
///
/// Mounted configuration is updated by swapping a symlink and removing the old target,
/// so a removal is the one event that means "the content changed and the change is
/// complete". Creation and modification are dropped on the notify thread.
///
/// The kernel drops a watch together with the removed inode, so every reported watched
/// path is watched again, resolving to the new target. A path that does not exist yet
/// is retried on every following call to [`ProfileWatcher::next_removal`].
pub struct ProfileWatcher {
    watcher: RecommendedWatcher,
    events: mpsc::Receiver<FsEvent>,
    paths: Vec<PathBuf>,
    unwatched: Vec<PathBuf>,
}

impl ProfileWatcher {
    /// Start watching every path in `paths`.
    ///
    /// # Errors
    ///
    /// - [`FsWatchError::CreateFailed`] if the platform watcher cannot be created
    /// - [`FsWatchError::WatchFailed`] if one of the paths cannot be watched
    pub fn new(paths: &[PathBuf]) -> Result<Self, Report<FsWatchError>> {
        let (tx, events) = mpsc::channel(EVENT_BUFFER);

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                let forwarded = match res {
                    Ok(event) => {
                        debug!("Filesystem event: {:?}", event);
                        match removed_path(&event) {
                            Some(path) => FsEvent::Removed(path),
                            None => return,
                        }
                    }
                    Err(e) => {
                        error!("Filesystem watch error: {:?}", e);
                        FsEvent::Error(e.to_string())
                    }
                };
                // receiver is gone once the loop attempt ended
                let _ = tx.blocking_send(forwarded);
            },
            Config::default(),
        )
        .change_context(FsWatchError::CreateFailed)?;

        for path in paths {
            watch_path(&mut watcher, path)?;
        }

        Ok(Self {
            watcher,
            events,
            paths: paths.to_vec(),
            unwatched: Vec::new(),
        })
    }

    /// Wait for the next removal of a watched path.
    ///
    /// # Errors
    ///
    /// - [`FsWatchError::WatchError`] if the platform watcher reported an error
    /// - [`FsWatchError::Closed`] if the watcher thread went away
    pub async fn next_removal(&mut self) -> Result<PathBuf, Report<FsWatchError>> {
        self.rewatch_pending();
        match self.events.recv().await {
            Some(FsEvent::Removed(path)) => {
                if self.paths.contains(&path) && !self.unwatched.contains(&path) {
                    self.unwatched.push(path.clone());
                    self.rewatch_pending();
                }
                Ok(path)
            }
            Some(FsEvent::Error(message)) => Err(Report::new(FsWatchError::WatchError { message })),
            None => Err(Report::new(FsWatchError::Closed)),
        }
    }
}

impl ProfileWatcher {
    fn rewatch_pending(&mut self) {
        let watcher = &mut self.watcher;
        self.unwatched.retain(|path| match watch_path(watcher, path) {
            Ok(()) => false,
            Err(e) => {
                debug!("Cannot watch {} again yet: {e:?}", path.display());
                true
            }
        });
    }
}

fn watch_path(watcher: &mut RecommendedWatcher, path: &Path) -> Result<(), Report<FsWatchError>> {
    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .change_context(FsWatchError::WatchFailed {
            path: path.to_path_buf(),
        })?;
    debug!("Watching {}", path.display());
    Ok(())
}

/// Whether `event` removes a watched path.
pub(crate) fn is_removal(event: &Event) -> bool {
    matches!(event.kind, EventKind::Remove(_))
}

fn removed_path(event: &Event) -> Option<PathBuf> {
    if !is_removal(event) {
        return None;
    }
    Some(event.paths.first().cloned().unwrap_or_default())
}
