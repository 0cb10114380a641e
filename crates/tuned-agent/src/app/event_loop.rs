//! # Reconciliation loop
//!
//! One attempt of the agent's main loop. Every event source of the agent (cluster
//! watches, filesystem removals, the two timers, the control socket, the daemon's exit
//! and the termination token) is multiplexed by a single `select!`, so the
//! [`ReconcilerState`] is only ever touched by one handler at a time.
//!
//! An attempt ends with `Ok` when the agent was asked to shut down (termination signal or
//! a `stop` command on the control socket) and with `Err` on any failure; the retry
//! wrapper decides whether to run another one. Watches, the filesystem watcher and the
//! control listener are owned by the attempt and released with it.

use core::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use futures::StreamExt;
use tokio::time::interval_at;
use tokio::time::Instant;
use tokio::time::Interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::reconcile::ReconcileOutcome;
use super::reconcile::Reconciler;
use super::retry::Attempt;
use crate::domain::process::SupervisorError;
use crate::domain::process::TunedSupervisor;
use crate::domain::resync::ResyncPeriod;
use crate::domain::state::ReconcilerState;
use crate::infrastructure::control_socket::read_command;
use crate::infrastructure::control_socket::ControlSocket;
use crate::infrastructure::control_socket::STOP_COMMAND;
use crate::infrastructure::fs_watcher::ProfileWatcher;
use crate::infrastructure::k8s::KubernetesError;
use crate::infrastructure::k8s::LabelSource;
use crate::infrastructure::k8s::WatchEvent;
use crate::infrastructure::tuned_status::ProfileStatus;

#[derive(Debug, derive_more::Display)]
pub enum LoopError {
    #[display("Tuned could not be started")]
    StartupFailed,
    #[display("Failed to restart tuned")]
    DaemonStartFailed,
    #[display("Tuned process exited: {outcome}")]
    DaemonExited { outcome: String },
    #[display("Failed to pull labels")]
    PullFailed,
    #[display("Cluster watch failed")]
    WatchFailed,
    #[display("Filesystem watch failed")]
    FsWatchFailed,
    #[display("Control channel failed")]
    ControlFailed,
    #[display("Reconciliation failed")]
    ReconcileFailed,
}

impl Error for LoopError {}

impl LoopError {
    /// Whether retrying cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StartupFailed)
    }
}

/// Knobs of one reconciliation loop.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub watch_files: Vec<PathBuf>,
    pub socket_path: PathBuf,
    pub reload_interval: Duration,
    pub pod_pull_period: Duration,
    pub control_read_timeout: Duration,
}

pub struct ReconciliationLoop<L, S> {
    source: L,
    reconciler: Reconciler<S>,
    settings: LoopSettings,
}

impl<L: LabelSource, S: ProfileStatus> ReconciliationLoop<L, S> {
    pub fn new(source: L, reconciler: Reconciler<S>, settings: LoopSettings) -> Self {
        Self {
            source,
            reconciler,
            settings,
        }
    }

    /// Run one attempt until shutdown is requested or something fails.
    ///
    /// # Errors
    ///
    /// - [`LoopError::StartupFailed`] if tuned cannot be started and never ran before, be it
    ///   by the explicit start or by the first reload
    /// - [`LoopError::DaemonExited`] if tuned exits on its own
    /// - any other [`LoopError`] when an event source or the reconciliation fails
    #[tracing::instrument(skip_all)]
    pub async fn run(
        &self,
        supervisor: &mut TunedSupervisor,
        resync: &mut ResyncPeriod,
        token: &CancellationToken,
    ) -> Result<(), Report<LoopError>> {
        let mut state = ReconcilerState::new(self.settings.pod_pull_period);
        // spread the first pod pull out instead of pulling at startup
        state.schedule_pod_pull(Instant::now());
        self.pull_labels(&mut state).await?;

        let mut node_events = self.source.watch_node();
        let mut pod_events = self.source.watch_pods();
        let mut fs_watcher = ProfileWatcher::new(&self.settings.watch_files)
            .change_context(LoopError::FsWatchFailed)?;
        let mut control = ControlSocket::bind(&self.settings.socket_path)
            .change_context(LoopError::ControlFailed)?;

        self.reconcile(&mut state, supervisor).await?;
        if !supervisor.is_running() {
            if let Err(report) = supervisor.start() {
                let context = if supervisor.has_started() {
                    LoopError::DaemonStartFailed
                } else {
                    LoopError::StartupFailed
                };
                return Err(report.change_context(context));
            }
        }

        let mut pull_timer = periodic(resync.current());
        let mut reload_timer = periodic(self.settings.reload_interval);
        info!(
            resync_period = ?resync.current(),
            "Reconciliation loop started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Termination requested, stopping tuned");
                    supervisor.stop().await;
                    return Ok(());
                }

                accepted = control.accept() => {
                    let mut stream = accepted.change_context(LoopError::ControlFailed)?;
                    match read_command(&mut stream, self.settings.control_read_timeout).await {
                        Ok(command) if command == STOP_COMMAND => {
                            info!("Stop requested over the control socket");
                            if let Err(e) = supervisor.stop_with_ack(&mut stream).await {
                                error!("Failed to acknowledge stop: {e:?}");
                            }
                            return Ok(());
                        }
                        Ok(command) => {
                            debug!(
                                "Ignoring control command {:?}",
                                String::from_utf8_lossy(&command)
                            );
                        }
                        Err(e) => warn!("Failed to read control command: {e:?}"),
                    }
                }

                outcome = supervisor.wait_exit() => {
                    return Err(Report::new(LoopError::DaemonExited {
                        outcome: outcome.to_string(),
                    }));
                }

                removed = fs_watcher.next_removal() => {
                    let path = removed.change_context(LoopError::FsWatchFailed)?;
                    info!("Remove event on: {}", path.display());
                    state.mark_config_changed();
                }

                event = node_events.next() => {
                    let event = watch_item(event, "node")?;
                    apply_watch_event(&mut state, event);
                }

                event = pod_events.next() => {
                    let event = watch_item(event, "pods")?;
                    apply_watch_event(&mut state, event);
                }

                _ = pull_timer.tick() => {
                    self.pull_labels(&mut state).await?;
                    if resync.shrink() {
                        info!("Lowering resync period to {:?}", resync.current());
                        pull_timer = periodic(resync.current());
                    }
                }

                _ = reload_timer.tick() => {
                    self.reconcile(&mut state, supervisor).await?;
                }
            }
        }
    }

    /// Pull the node's labels, and the pods' labels when their pull is due.
    async fn pull_labels(&self, state: &mut ReconcilerState) -> Result<(), Report<LoopError>> {
        let node_labels = self
            .source
            .node_labels()
            .await
            .change_context(LoopError::PullFailed)?;
        state.observe_node(node_labels);

        let now = Instant::now();
        if state.pod_pull_due(now) {
            debug!("Pulling pod labels");
            let pods = self
                .source
                .pod_labels()
                .await
                .change_context(LoopError::PullFailed)?;
            state.schedule_pod_pull(now);
            state.replace_pods(pods);
        }
        Ok(())
    }

    async fn reconcile(
        &self,
        state: &mut ReconcilerState,
        supervisor: &mut TunedSupervisor,
    ) -> Result<ReconcileOutcome, Report<LoopError>> {
        let outcome = match self.reconciler.reconcile(state, supervisor).await {
            Ok(outcome) => outcome,
            Err(report) => {
                // a reload may be the first start of tuned
                let context = if is_start_failure(&report) && !supervisor.has_started() {
                    LoopError::StartupFailed
                } else {
                    LoopError::ReconcileFailed
                };
                return Err(report.change_context(context));
            }
        };
        if outcome != ReconcileOutcome::default() {
            debug!(?outcome, "Reconciled");
        }
        Ok(outcome)
    }
}

fn is_start_failure<C>(report: &Report<C>) -> bool {
    matches!(
        report.downcast_ref::<SupervisorError>(),
        Some(SupervisorError::StartFailed { .. })
    )
}

fn periodic(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn watch_item(
    item: Option<Result<WatchEvent, Report<KubernetesError>>>,
    resource: &str,
) -> Result<WatchEvent, Report<LoopError>> {
    match item {
        Some(result) => result.change_context(LoopError::WatchFailed),
        None => Err(Report::new(KubernetesError::WatchClosed {
            resource: resource.to_string(),
        })
        .change_context(LoopError::WatchFailed)),
    }
}

fn apply_watch_event(state: &mut ReconcilerState, event: WatchEvent) {
    match event {
        WatchEvent::NodeLabels(labels) => {
            state.observe_node(labels);
        }
        WatchEvent::NodeDeleted => warn!("The node object was deleted"),
        WatchEvent::PodApplied { key, labels } => {
            state.observe_pod(key, labels);
        }
        WatchEvent::PodDeleted { key } => {
            state.forget_pod(&key);
        }
        WatchEvent::PodsListed(pods) => {
            state.replace_pods(pods);
        }
        WatchEvent::Unrecognized { reason } => warn!("Ignoring watch event: {reason}"),
    }
}

/// The loop together with the daemon it supervises across attempts.
pub struct SupervisedLoop<L, S> {
    pub event_loop: ReconciliationLoop<L, S>,
    pub supervisor: TunedSupervisor,
}

#[async_trait]
impl<L: LabelSource, S: ProfileStatus> Attempt for SupervisedLoop<L, S> {
    async fn run(
        &mut self,
        resync: &mut ResyncPeriod,
        token: &CancellationToken,
    ) -> Result<(), Report<LoopError>> {
        self.event_loop
            .run(&mut self.supervisor, resync, token)
            .await
    }
}
