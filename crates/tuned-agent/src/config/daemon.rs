use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

pub const DEFAULT_SOCKET: &str = "/var/lib/tuned/openshift-tuned.sock";
pub const DEFAULT_NODE_LABELS: &str = "/var/lib/tuned/ocp-node-labels.cfg";
pub const DEFAULT_POD_LABELS: &str = "/var/lib/tuned/ocp-pod-labels.cfg";
pub const DEFAULT_PROFILES_DATA: &str = "/var/lib/tuned/profiles-data/tuned-profiles.yaml";

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of the node this agent runs on"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long = "watch-file",
        value_hint = clap::ValueHint::AnyPath,
        default_value = DEFAULT_PROFILES_DATA,
        help = "File or directory whose removal triggers profile re-extraction; repeatable"
    )]
    pub watch_files: Vec<PathBuf>,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        default_value = DEFAULT_NODE_LABELS,
        help = "File the node labels are dumped to"
    )]
    pub node_labels: PathBuf,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        default_value = DEFAULT_POD_LABELS,
        help = "File the labels of all pods on the node are dumped to"
    )]
    pub pod_labels: PathBuf,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        default_value = DEFAULT_PROFILES_DATA,
        help = "YAML bundle mapping profile names to profile contents"
    )]
    pub profiles_data: PathBuf,

    #[arg(
        long,
        value_hint = clap::ValueHint::DirPath,
        default_value = "/etc/tuned",
        help = "Directory the profiles are extracted to"
    )]
    pub profiles_dir: PathBuf,

    #[arg(
        long,
        default_value = "tuned.conf",
        help = "File name of an extracted profile inside its directory"
    )]
    pub profile_file_name: String,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        default_value = "/etc/tuned/active_profile",
        help = "File in which tuned records the profile it applies"
    )]
    pub active_profile_file: PathBuf,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        default_value = DEFAULT_SOCKET,
        help = "Control socket accepting the stop command"
    )]
    pub socket: PathBuf,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        default_value = "/run/openshift-tuned/openshift-tuned.pid",
        help = "Path of the agent's pid file"
    )]
    pub pid_file: PathBuf,

    #[arg(
        long,
        env = "RESYNC_PERIOD",
        default_value = "60",
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Base period in seconds of the full node label pull; jittered by 30%"
    )]
    pub resync_period: u64,

    #[arg(
        long,
        default_value = "3600",
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Ceiling in seconds of the backed-off resync period; reaching it is fatal"
    )]
    pub resync_period_max: u64,

    #[arg(
        long,
        default_value = "28800",
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Period in seconds of the full pod label pull; jittered by 30%"
    )]
    pub pod_resync_period: u64,

    #[arg(
        long,
        default_value = "5",
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Seconds between reconciliations; bounds the tuned reload rate"
    )]
    pub reload_interval: u64,

    #[arg(
        long,
        value_hint = clap::ValueHint::ExecutablePath,
        default_value = "/usr/sbin/tuned",
        help = "Path to the tuned daemon"
    )]
    pub tuned_binary: PathBuf,

    #[arg(
        long = "tuned-arg",
        default_value = "--no-dbus",
        allow_hyphen_values = true,
        help = "Argument passed to tuned; repeatable"
    )]
    pub tuned_args: Vec<String>,

    #[arg(
        long,
        value_hint = clap::ValueHint::ExecutablePath,
        default_value = "/usr/sbin/tuned-adm",
        help = "Path to tuned-adm, used to query the recommended profile"
    )]
    pub tuned_adm_binary: PathBuf,

    #[arg(
        long,
        env = "API_LISTEN_ADDR",
        help = "Listen address of the HTTP endpoint serving /active_profile; disabled when unset"
    )]
    pub api_listen_addr: Option<String>,
}

impl DaemonArgs {
    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period)
    }

    pub fn resync_period_max(&self) -> Duration {
        Duration::from_secs(self.resync_period_max)
    }

    pub fn pod_resync_period(&self) -> Duration {
        Duration::from_secs(self.pod_resync_period)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct StopArgs {
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        default_value = DEFAULT_SOCKET,
        help = "Control socket of the running agent"
    )]
    pub socket: PathBuf,

    #[arg(
        long,
        default_value = "60",
        help = "Seconds to wait for tuned to stop and roll back its settings"
    )]
    pub timeout: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct DumpNodeLabelsArgs {
    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of the node whose labels are dumped"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        default_value = DEFAULT_NODE_LABELS,
        help = "File the node labels are dumped to"
    )]
    pub node_labels: PathBuf,
}
