use core::error::Error;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::event_loop::LoopSettings;
use super::event_loop::ReconciliationLoop;
use super::event_loop::SupervisedLoop;
use super::reconcile::Reconciler;
use super::retry::RetryWrapper;
use crate::config::DaemonArgs;
use crate::config::DumpNodeLabelsArgs;
use crate::domain::process::DaemonCommand;
use crate::domain::process::TunedSupervisor;
use crate::domain::resync::ResyncPeriod;
use crate::infrastructure::api::ApiServer;
use crate::infrastructure::k8s::KubeLabelSource;
use crate::infrastructure::k8s::LabelSource;
use crate::infrastructure::kube_client::init_kube_client;
use crate::infrastructure::label_files::write_node_labels;
use crate::infrastructure::label_files::LabelFiles;
use crate::infrastructure::pid_file::write_pid_file;
use crate::infrastructure::profiles::ProfileBundle;
use crate::infrastructure::tuned_status::TunedStatus;

/// Jitter applied to the base resync period, as a fraction of the period.
const RESYNC_JITTER: f64 = 0.3;
/// How long a control client may take to send its command.
const CONTROL_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, derive_more::Display)]
pub enum AppError {
    #[display("Failed to prepare the agent")]
    Startup,
    #[display("Failed to install signal handlers")]
    Signals,
    #[display("Reconciliation stopped")]
    Reconciliation,
    #[display("Failed to dump node labels")]
    DumpNodeLabels,
}

impl Error for AppError {}

/// The `daemon` command: keeps tuned in sync until terminated.
pub struct Application {
    args: DaemonArgs,
    token: CancellationToken,
}

impl Application {
    pub fn new(args: DaemonArgs) -> Self {
        Self {
            args,
            token: CancellationToken::new(),
        }
    }

    /// # Errors
    ///
    /// - [`AppError::Startup`] if the pid file, the initial profile extraction or the
    ///   cluster client fail
    /// - [`AppError::Reconciliation`] if the loop gave up
    #[tracing::instrument(skip_all, fields(node = %self.args.node_name))]
    pub async fn run(self) -> Result<(), Report<AppError>> {
        let signal_task = spawn_signal_handler(self.token.clone())?;

        let result = self.serve().await;

        self.token.cancel();
        signal_task.abort();
        result?;
        info!("Agent stopped");
        Ok(())
    }

    async fn serve(&self) -> Result<(), Report<AppError>> {
        write_pid_file(&self.args.pid_file).change_context(AppError::Startup)?;

        let bundle = ProfileBundle::new(
            &self.args.profiles_data,
            &self.args.profiles_dir,
            &self.args.profile_file_name,
        );
        bundle.extract().change_context(AppError::Startup)?;

        let client = init_kube_client(self.args.kubeconfig.clone())
            .await
            .change_context(AppError::Startup)?;

        let status = TunedStatus::new(&self.args.active_profile_file, &self.args.tuned_adm_binary);
        let api_task = self.args.api_listen_addr.clone().map(|listen_addr| {
            let server = ApiServer::new(status.clone(), listen_addr);
            let token = self.token.clone();
            tokio::spawn(async move {
                if let Err(e) = server.run(token).await {
                    error!("API server failed: {e:?}");
                }
            })
        });

        let mut attempt = SupervisedLoop {
            event_loop: ReconciliationLoop::new(
                KubeLabelSource::new(client, self.args.node_name.clone()),
                Reconciler::new(
                    LabelFiles::new(&self.args.node_labels, &self.args.pod_labels),
                    bundle,
                    status,
                ),
                LoopSettings {
                    watch_files: self.args.watch_files.clone(),
                    socket_path: self.args.socket.clone(),
                    reload_interval: self.args.reload_interval(),
                    pod_pull_period: self.args.pod_resync_period(),
                    control_read_timeout: CONTROL_READ_TIMEOUT,
                },
            ),
            supervisor: TunedSupervisor::new(DaemonCommand::new(
                &self.args.tuned_binary,
                self.args.tuned_args.clone(),
            )),
        };
        let resync = ResyncPeriod::with_jitter(
            self.args.resync_period(),
            RESYNC_JITTER,
            self.args.resync_period_max(),
        );
        info!(resync_period = ?resync.current(), "Starting reconciliation");

        let result = RetryWrapper::new(resync, self.token.clone())
            .run(&mut attempt)
            .await;

        // a failed run may leave tuned behind
        attempt.supervisor.stop().await;
        self.token.cancel();
        if let Some(api_task) = api_task {
            if let Err(e) = api_task.await {
                error!("API server task failed: {e}");
            }
        }

        result.change_context(AppError::Reconciliation)
    }
}

/// Cancel `token` on the first SIGHUP, SIGINT, SIGTERM or SIGQUIT.
fn spawn_signal_handler(token: CancellationToken) -> Result<JoinHandle<()>, Report<AppError>> {
    let mut sighup = signal(SignalKind::hangup()).change_context(AppError::Signals)?;
    let mut sigint = signal(SignalKind::interrupt()).change_context(AppError::Signals)?;
    let mut sigterm = signal(SignalKind::terminate()).change_context(AppError::Signals)?;
    let mut sigquit = signal(SignalKind::quit()).change_context(AppError::Signals)?;

    Ok(tokio::spawn(async move {
        let received = tokio::select! {
            _ = sighup.recv() => "SIGHUP",
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
            _ = sigquit.recv() => "SIGQUIT",
            _ = token.cancelled() => return,
        };
        info!("Received {received}, initiating graceful shutdown");
        token.cancel();
    }))
}

/// The `dump-node-labels` command: fetch the node's labels once and write them out.
///
/// # Errors
///
/// - [`AppError::DumpNodeLabels`] if the labels cannot be fetched or written
pub async fn dump_node_labels(args: DumpNodeLabelsArgs) -> Result<(), Report<AppError>> {
    let client = init_kube_client(args.kubeconfig)
        .await
        .change_context(AppError::DumpNodeLabels)?;
    let source = KubeLabelSource::new(client, args.node_name);

    let labels = source
        .node_labels()
        .await
        .change_context(AppError::DumpNodeLabels)?;
    write_node_labels(&args.node_labels, &labels).change_context(AppError::DumpNodeLabels)?;

    info!(
        "Wrote {} node labels to {}",
        labels.len(),
        args.node_labels.display()
    );
    Ok(())
}
