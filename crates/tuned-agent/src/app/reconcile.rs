use core::error::Error;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::info;

use crate::domain::process::DaemonControl;
use crate::domain::state::ReconcilerState;
use crate::infrastructure::label_files::LabelFiles;
use crate::infrastructure::profiles::ProfileBundle;
use crate::infrastructure::tuned_status::ProfileStatus;

#[derive(Debug, derive_more::Display)]
pub enum ReconcileError {
    #[display("Failed to dump pod labels")]
    PodLabelDump,
    #[display("Failed to dump node labels")]
    NodeLabelDump,
    #[display("Failed to compare active and recommended profiles")]
    ProfileComparison,
    #[display("Failed to extract tuned profiles")]
    ProfileExtraction,
    #[display("Failed to reload tuned")]
    Reload,
}

impl Error for ReconcileError {}

/// What one reconciliation did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub labels_dumped: bool,
    pub profiles_extracted: bool,
    pub reload_requested: bool,
}

/// Turns pending change flags into label files, profiles and a daemon reload.
pub struct Reconciler<S> {
    files: LabelFiles,
    bundle: ProfileBundle,
    status: S,
}

impl<S: ProfileStatus> Reconciler<S> {
    pub fn new(files: LabelFiles, bundle: ProfileBundle, status: S) -> Self {
        Self {
            files,
            bundle,
            status,
        }
    }

    /// Consume the change flags of `state`.
    ///
    /// A flag is cleared before the I/O it triggers. If that I/O fails the change is not
    /// retried until the next full pull sees a difference again.
    ///
    /// # Errors
    ///
    /// Any failed step aborts the reconciliation; the caller ends its loop attempt.
    pub async fn reconcile<D: DaemonControl>(
        &self,
        state: &mut ReconcilerState,
        daemon: &mut D,
    ) -> Result<ReconcileOutcome, Report<ReconcileError>> {
        let mut outcome = ReconcileOutcome::default();

        if state.take_pod_change() {
            if let Some(pods) = state.pod_labels() {
                self.files
                    .dump_pods(pods)
                    .change_context(ReconcileError::PodLabelDump)?;
                outcome.labels_dumped = true;
            }
        }

        if state.take_node_change() {
            if let Some(labels) = state.node_labels() {
                self.files
                    .dump_node(labels)
                    .change_context(ReconcileError::NodeLabelDump)?;
                outcome.labels_dumped = true;
            }
        }

        if outcome.labels_dumped {
            let active = self
                .status
                .active_profile()
                .await
                .change_context(ReconcileError::ProfileComparison)?;
            let recommended = self
                .status
                .recommended_profile()
                .await
                .change_context(ReconcileError::ProfileComparison)?;
            if active == recommended {
                debug!("Active profile ({active}) matches the recommended one");
            } else {
                info!("Active profile ({active}) != recommended profile ({recommended})");
                outcome.reload_requested = true;
            }
        }

        if state.take_config_change() {
            self.bundle
                .extract()
                .change_context(ReconcileError::ProfileExtraction)?;
            outcome.profiles_extracted = true;
            outcome.reload_requested = true;
        }

        if outcome.reload_requested {
            daemon.reload().change_context(ReconcileError::Reload)?;
        }

        Ok(outcome)
    }
}
