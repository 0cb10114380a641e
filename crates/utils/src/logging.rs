//! provides logging helpers

use std::env;
use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// When set, logs are additionally written to a daily rolling file under this directory.
pub const LOG_PATH_ENV_VAR: &str = "TUNED_AGENT_LOG_PATH";

const LOG_FILE_PREFIX: &str = "tuned-agent.log";
const MAX_LOG_FILES: usize = 3;

/// Builds the formatting layer: stderr always, plus a rolling file when `log_path` is set.
///
/// The returned guard must be kept alive for the file writer to flush.
pub fn get_fmt_layer<S>(
    log_path: Option<String>,
) -> (Box<dyn Layer<S> + Send + Sync>, Option<WorkerGuard>)
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let stderr_layer = layer().with_writer(std::io::stderr).with_target(true);

    let Some(log_path) = log_path else {
        return (stderr_layer.boxed(), None);
    };

    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(MAX_LOG_FILES)
        .build(Path::new(&log_path))
    {
        Ok(appender) => {
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(true);
            (stderr_layer.and_then(file_layer).boxed(), Some(guard))
        }
        Err(e) => {
            eprintln!("failed to create rolling log file in {log_path}: {e}, logging to stderr only");
            (stderr_layer.boxed(), None)
        }
    }
}

/// initiate the global tracing subscriber
///
/// The filter is read from `RUST_LOG` and defaults to `info`.
pub fn init() -> Option<WorkerGuard> {
    let log_path = env::var(LOG_PATH_ENV_VAR).ok();
    let (fmt_layer, guard) = get_fmt_layer(log_path);

    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    registry().with(fmt_layer.with_filter(env_filter)).init();
    guard
}
