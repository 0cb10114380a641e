use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::daemon::DaemonArgs;
use crate::config::daemon::DumpNodeLabelsArgs;
use crate::config::daemon::StopArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Keep tuned in sync with node and pod labels and the profile bundle
    Daemon(Box<DaemonArgs>),
    /// Ask a running agent to stop tuned and exit
    Stop(StopArgs),
    /// Write the node's labels to the node label file once and exit
    #[command(name = "dump-node-labels")]
    DumpNodeLabels(DumpNodeLabelsArgs),
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use similar_asserts::assert_eq;

    use super::*;

    fn parse_daemon(args: &[&str]) -> DaemonArgs {
        let cli = Cli::try_parse_from(["tuned-agent", "daemon"].iter().chain(args))
            .expect("should parse");
        match cli.command {
            Commands::Daemon(args) => *args,
            _ => panic!("expected the daemon command"),
        }
    }

    #[test]
    fn daemon_defaults_match_the_host_layout() {
        let args = parse_daemon(&["--node-name", "worker-0"]);

        assert_eq!(args.node_name, "worker-0");
        assert_eq!(args.resync_period(), Duration::from_secs(60));
        assert_eq!(args.resync_period_max(), Duration::from_secs(3600));
        assert_eq!(args.pod_resync_period(), Duration::from_secs(8 * 3600));
        assert_eq!(args.reload_interval(), Duration::from_secs(5));
        assert_eq!(args.tuned_args, vec!["--no-dbus".to_string()]);
        assert_eq!(
            args.watch_files,
            vec![PathBuf::from(
                "/var/lib/tuned/profiles-data/tuned-profiles.yaml"
            )]
        );
        assert_eq!(args.profile_file_name, "tuned.conf");
        assert_eq!(args.api_listen_addr, None);
    }

    #[test]
    fn repeatable_flags_replace_their_defaults() {
        let args = parse_daemon(&[
            "--node-name",
            "worker-0",
            "--watch-file",
            "/a",
            "--watch-file",
            "/b",
            "--tuned-arg",
            "--no-dbus",
            "--tuned-arg",
            "--debug",
        ]);

        assert_eq!(
            args.watch_files,
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
        assert_eq!(
            args.tuned_args,
            vec!["--no-dbus".to_string(), "--debug".to_string()]
        );
    }

    #[test]
    fn zero_periods_are_rejected() {
        let parsed = Cli::try_parse_from([
            "tuned-agent",
            "daemon",
            "--node-name",
            "worker-0",
            "--reload-interval",
            "0",
        ]);

        assert!(parsed.is_err());
    }

    #[test]
    fn stop_uses_the_default_socket() {
        let cli = Cli::try_parse_from(["tuned-agent", "stop"]).expect("should parse");

        let Commands::Stop(args) = cli.command else {
            panic!("expected the stop command");
        };
        assert_eq!(
            args.socket,
            PathBuf::from("/var/lib/tuned/openshift-tuned.sock")
        );
    }
}
