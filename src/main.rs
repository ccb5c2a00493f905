use clap::{Parser, Subcommand};
use crucible::client::ReconnectingClient;
use crucible::config::CrucibleConfig;
use crucible::server;
use std::path::PathBuf;
use std::time::Duration;

/// A WebSocket execution service that runs streaming shell commands as
/// supervised process groups, and the client that drives a fresh server
/// per task.
#[derive(Parser, Debug)]
#[command(name = "crucible", version, about)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "crucible.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the execution server until interrupted
    Serve {
        /// Bind port (overrides config)
        #[arg(long)]
        port: Option<u16>,

        /// Bind host (overrides config)
        #[arg(long)]
        host: Option<String>,
    },
    /// Execute one command against a fresh server and print its output
    Run {
        /// Shell command to execute
        command: String,

        /// Wall-clock timeout in seconds (overrides config default)
        #[arg(long)]
        timeout: Option<u64>,

        /// Target server port (overrides config)
        #[arg(long)]
        port: Option<u16>,

        /// Reuse a server that is already listening instead of restarting
        #[arg(long)]
        no_restart: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let mut config = match CrucibleConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("failed to load config: {e}");
            std::process::exit(2);
        }
    };

    match cli.command {
        Command::Serve { port, host } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Err(e) = server::run(&config).await {
                tracing::error!("server failed: {e}");
                std::process::exit(1);
            }
        }
        Command::Run {
            command,
            timeout,
            port,
            no_restart,
        } => {
            if let Some(port) = port {
                config.client.port = port;
            }
            if no_restart {
                config.client.restart_per_task = false;
            }
            let timeout =
                Duration::from_secs(timeout.unwrap_or(config.server.default_timeout_secs));

            let mut client = ReconnectingClient::new(config.client.clone());
            let result = client.run_task(&command, timeout).await;
            client.shutdown_server().await;

            match result {
                Ok(report) => {
                    print!("{}", report.output);
                    eprintln!(
                        "status: {} (exit code {}) in {:.1}s, started {}",
                        report.status,
                        report
                            .exit_code
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "none".to_string()),
                        report.duration.as_secs_f64(),
                        report.started_at.format("%Y-%m-%d %H:%M:%S UTC")
                    );
                    if let Some(tag) = report.classification {
                        eprintln!("classified: {tag:?}");
                    }
                    if !report.seq_gapless {
                        eprintln!("warning: output sequence had gaps");
                    }
                    std::process::exit(if report.success { 0 } else { 1 });
                }
                Err(e) => {
                    tracing::error!("task failed: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}
