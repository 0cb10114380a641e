use core::error::Error;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, derive_more::Display)]
pub enum StatusError {
    #[display("Error reading tuned active profile file {}", path.display())]
    ActiveProfileUnreadable { path: PathBuf },
    #[display("Error getting recommended profile")]
    RecommendFailed,
}

impl Error for StatusError {}

/// Which profile the daemon applies and which one it would pick now.
#[async_trait]
pub trait ProfileStatus: Send + Sync {
    async fn active_profile(&self) -> Result<String, Report<StatusError>>;

    async fn recommended_profile(&self) -> Result<String, Report<StatusError>>;
}

/// Reads the daemon's active profile file and asks `tuned-adm` for its recommendation.
#[derive(Debug, Clone)]
pub struct TunedStatus {
    active_profile_file: PathBuf,
    tuned_adm: PathBuf,
}

impl TunedStatus {
    pub fn new(active_profile_file: impl Into<PathBuf>, tuned_adm: impl Into<PathBuf>) -> Self {
        Self {
            active_profile_file: active_profile_file.into(),
            tuned_adm: tuned_adm.into(),
        }
    }
}

#[async_trait]
impl ProfileStatus for TunedStatus {
    /// A missing file means no profile has been applied yet.
    async fn active_profile(&self) -> Result<String, Report<StatusError>> {
        match tokio::fs::read_to_string(&self.active_profile_file).await {
            Ok(content) => Ok(last_profile_line(&content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(
                    "No active profile file at {}",
                    self.active_profile_file.display()
                );
                Ok(String::new())
            }
            Err(e) => Err(
                Report::new(e).change_context(StatusError::ActiveProfileUnreadable {
                    path: self.active_profile_file.clone(),
                }),
            ),
        }
    }

    async fn recommended_profile(&self) -> Result<String, Report<StatusError>> {
        debug!("Getting recommended profile");
        let output = Command::new(&self.tuned_adm)
            .arg("recommend")
            .output()
            .await
            .change_context(StatusError::RecommendFailed)
            .attach_printable_lazy(|| format!("cannot run {}", self.tuned_adm.display()))?;

        if !output.status.success() {
            return Err(Report::new(StatusError::RecommendFailed).attach_printable(format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn last_profile_line(content: &str) -> String {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or_default()
        .to_string()
}
