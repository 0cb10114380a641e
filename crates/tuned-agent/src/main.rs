use anyhow::Result;
use clap::Parser;
use tuned_agent::app;
use tuned_agent::app::Application;
use tuned_agent::config::Cli;
use tuned_agent::config::Commands;
use tuned_agent::config::DaemonArgs;
use tuned_agent::config::StopArgs;
use tuned_agent::control_socket::request_stop;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = utils::logging::init();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::Stop(stop_args) => run_stop(stop_args).await,
        Commands::DumpNodeLabels(args) => app::dump_node_labels(args)
            .await
            .map_err(|report| anyhow::anyhow!("{report:?}")),
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    tracing::info!("Starting tuned agent {}", &**version::VERSION);

    Application::new(daemon_args)
        .run()
        .await
        .map_err(|report| anyhow::anyhow!("{report:?}"))
}

async fn run_stop(stop_args: StopArgs) -> Result<()> {
    request_stop(
        &stop_args.socket,
        std::time::Duration::from_secs(stop_args.timeout),
    )
    .await
    .map_err(|report| anyhow::anyhow!("{report:?}"))?;

    tracing::info!("Tuned stopped");
    Ok(())
}
